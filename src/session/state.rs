//! Adapter state machine definitions.
//!
//! This module contains the adapter state enumeration, the session requests
//! a caller may issue, the notifications delivered by the platform, and the
//! transition table that relates them.

use bluer::Address;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::session::{
   device::{BondState, DeviceRecord},
   radio::{RadioCommand, RadioSnapshot},
};

/// Observable state of the local adapter.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
   Unavailable,
   Off,
   TurningOn,
   On,
   TurningOff,
   Discoverable,
   Connected,
}

impl AdapterState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// Radio is up and able to serve requests.
   pub const fn is_powered(self) -> bool {
      matches!(self, Self::On | Self::Discoverable | Self::Connected)
   }

   /// Waiting for the radio to finish a power change.
   pub const fn is_transient(self) -> bool {
      matches!(self, Self::TurningOn | Self::TurningOff)
   }

   /// Applies a transition, returning the new state if the move is legal.
   ///
   /// Anything not listed here leaves the state untouched; in particular
   /// `Off` never reaches `On` without passing through `TurningOn`.
   pub const fn next(self, transition: Transition) -> Option<Self> {
      use Transition as T;
      let next = match (self, transition) {
         (_, T::RadioLost) => Self::Unavailable,
         (Self::Unavailable, T::RadioRestored) => Self::Off,

         (Self::Off, T::EnableAcknowledged | T::Power(PowerState::TurningOn)) => Self::TurningOn,
         (Self::TurningOn, T::Power(PowerState::On)) => Self::On,
         (Self::TurningOn, T::Power(PowerState::Off) | T::EnableFailed) => Self::Off,

         (
            Self::On | Self::Discoverable | Self::Connected,
            T::DisableAcknowledged | T::Power(PowerState::TurningOff),
         ) => Self::TurningOff,
         (Self::TurningOff, T::Power(PowerState::Off)) => Self::Off,
         (Self::TurningOff, T::Power(PowerState::On) | T::DisableFailed) => Self::On,

         (Self::On, T::Discoverable(true)) => Self::Discoverable,
         (Self::Discoverable, T::Discoverable(false)) => Self::On,

         (Self::On | Self::Discoverable, T::FirstPeerConnected) => Self::Connected,
         (Self::Connected, T::LastPeerDisconnected) => Self::On,

         _ => return None,
      };
      Some(next)
   }
}

/// Power states reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
   Off,
   TurningOn,
   On,
   TurningOff,
}

/// Reduced input of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
   EnableAcknowledged,
   EnableFailed,
   DisableAcknowledged,
   DisableFailed,
   Power(PowerState),
   Discoverable(bool),
   FirstPeerConnected,
   LastPeerDisconnected,
   RadioLost,
   RadioRestored,
}

/// Requests a caller can make of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum SessionRequest {
   #[strum(serialize = "enable radio")]
   EnableRadio,
   #[strum(serialize = "disable radio")]
   DisableRadio,
   #[strum(serialize = "request discoverable")]
   RequestDiscoverable,
   #[strum(serialize = "list paired devices")]
   ListPairedDevices,
}

impl SessionRequest {
   /// Requests that mutate the radio and therefore need every capability.
   pub const fn is_state_changing(self) -> bool {
      !matches!(self, Self::ListPairedDevices)
   }
}

/// Asynchronous notifications delivered by the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
   /// Radio power state changed.
   Power(PowerState),
   /// Discoverability changed; `false` also covers the window timing out.
   ScanMode { discoverable: bool },
   PeerConnected(Address),
   PeerDisconnected(Address),
   BondChanged(DeviceRecord, BondState),
   DeviceFound(DeviceRecord),
   DiscoveryStarted,
   DiscoveryFinished,
   PairingRequest(Address),
   CommandAcknowledged(RadioCommand),
   CommandFailed(RadioCommand, SmolStr),
   RadioLost,
   RadioRestored(RadioSnapshot),
   /// A category this controller does not act on.
   Unrecognized(SmolStr),
}

impl Notification {
   /// Notifications describing an observed power level, walking through the
   /// transient state so the table is never bypassed.
   pub const fn power_path(powered: bool) -> [Self; 2] {
      if powered {
         [Self::Power(PowerState::TurningOn), Self::Power(PowerState::On)]
      } else {
         [Self::Power(PowerState::TurningOff), Self::Power(PowerState::Off)]
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use strum::IntoEnumIterator;

   #[test]
   fn test_power_cycle_follows_table() {
      let mut state = AdapterState::Off;
      for t in [
         Transition::EnableAcknowledged,
         Transition::Power(PowerState::On),
         Transition::DisableAcknowledged,
         Transition::Power(PowerState::Off),
      ] {
         state = state.next(t).unwrap();
      }
      assert_eq!(state, AdapterState::Off);
   }

   #[test]
   fn test_off_never_jumps_to_on() {
      assert_eq!(AdapterState::Off.next(Transition::Power(PowerState::On)), None);
      assert_eq!(AdapterState::On.next(Transition::Power(PowerState::Off)), None);
   }

   #[test]
   fn test_transient_states_only_exit_on_terminal() {
      for t in [
         Transition::Discoverable(true),
         Transition::FirstPeerConnected,
         Transition::EnableAcknowledged,
         Transition::Power(PowerState::TurningOn),
      ] {
         assert_eq!(AdapterState::TurningOn.next(t), None, "{t:?}");
      }
      assert_eq!(
         AdapterState::TurningOn.next(Transition::EnableFailed),
         Some(AdapterState::Off)
      );
      assert_eq!(
         AdapterState::TurningOff.next(Transition::DisableFailed),
         Some(AdapterState::On)
      );
   }

   #[test]
   fn test_discoverable_window() {
      let state = AdapterState::On.next(Transition::Discoverable(true)).unwrap();
      assert_eq!(state, AdapterState::Discoverable);
      assert_eq!(
         state.next(Transition::Discoverable(false)),
         Some(AdapterState::On)
      );
      assert_eq!(AdapterState::Off.next(Transition::Discoverable(true)), None);
   }

   #[test]
   fn test_radio_lost_from_every_state() {
      for state in AdapterState::iter() {
         assert_eq!(
            state.next(Transition::RadioLost),
            Some(AdapterState::Unavailable)
         );
      }
      assert_eq!(
         AdapterState::Unavailable.next(Transition::RadioRestored),
         Some(AdapterState::Off)
      );
      assert_eq!(AdapterState::On.next(Transition::RadioRestored), None);
   }

   #[test]
   fn test_state_names() {
      assert_eq!(AdapterState::TurningOn.to_str(), "turning_on");
      assert_eq!("discoverable".parse::<AdapterState>().unwrap(), AdapterState::Discoverable);
      assert_eq!(SessionRequest::EnableRadio.to_string(), "enable radio");
   }
}
