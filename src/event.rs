//! Event handling system for session status updates.
//!
//! This module provides the event infrastructure for notifying about
//! adapter state changes, discovered and bonded devices, and the pairing
//! pulse.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::session::{
   device::{BondState, DeviceRecord},
   state::{AdapterState, SessionRequest},
};

/// Events that can be emitted by the session service.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
   StateChanged {
      from: AdapterState,
      to: AdapterState,
   },
   DeviceFound(DeviceRecord),
   BondChanged(DeviceRecord, BondState),
   DiscoveryChanged(bool),
   PairingRequest(Address),
   PairingPulse(u64),
   PairingChanged(bool),
   PeerCountChanged(usize),
   RequestFailed(SessionRequest, SmolStr),
   SessionTerminated(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: SessionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
