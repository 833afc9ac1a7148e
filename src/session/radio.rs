//! Contract of the platform radio the controller drives.
//!
//! The controller never talks to hardware directly: it reads a snapshot once
//! at initialization and afterwards only submits commands. Command results
//! come back asynchronously as notifications.

use std::time::Duration;

use crate::{
   error::Result,
   session::{
      device::DeviceRecord,
      state::{Notification, SessionRequest},
   },
};

/// State of the radio at the moment it was queried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RadioSnapshot {
   pub powered: bool,
   pub discoverable: bool,
   pub discovering: bool,
   pub bonded: Vec<DeviceRecord>,
}

impl RadioSnapshot {
   pub fn connected_peers(&self) -> impl Iterator<Item = &DeviceRecord> {
      self.bonded.iter().filter(|d| d.connected)
   }
}

/// Commands the controller emits towards the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCommand {
   Enable,
   Disable,
   MakeDiscoverable { timeout: Duration },
}

impl RadioCommand {
   pub const fn request(self) -> SessionRequest {
      match self {
         Self::Enable => SessionRequest::EnableRadio,
         Self::Disable => SessionRequest::DisableRadio,
         Self::MakeDiscoverable { .. } => SessionRequest::RequestDiscoverable,
      }
   }

   /// Notifications describing the adapter once the command has succeeded.
   pub fn completion(self) -> Vec<Notification> {
      match self {
         Self::Enable => Notification::power_path(true).to_vec(),
         Self::Disable => Notification::power_path(false).to_vec(),
         Self::MakeDiscoverable { .. } => vec![Notification::ScanMode { discoverable: true }],
      }
   }
}

/// Platform radio adapter.
pub trait Radio {
   /// Queries the radio; `None` when no radio hardware is present.
   fn snapshot(&self) -> Option<RadioSnapshot>;

   /// Hands a command to the platform without waiting for it to complete.
   fn submit(&mut self, cmd: RadioCommand) -> Result<()>;
}
