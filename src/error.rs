//! Error types for the Bluetooth session service.
//!
//! This module defines all error types that can occur while controlling the
//! local adapter, including rejected session requests, Bluetooth, D-Bus,
//! I/O and configuration errors.

use thiserror::Error;

use crate::session::{
   permission::Capability,
   state::{AdapterState, SessionRequest},
};

/// Main error type for the session service.
#[derive(Error, Debug)]
pub enum SessionError {
   #[error("Bluetooth adapter unavailable")]
   AdapterUnavailable,

   #[error("Permission denied: {0}")]
   PermissionDenied(Capability),

   #[error("Cannot {request} while adapter is {state}")]
   InvalidStateTransition {
      request: SessionRequest,
      state: AdapterState,
   },

   #[error("Stop pairing first")]
   PairingActive,

   #[error("Invalid discoverable duration: {0}s")]
   InvalidDuration(u64),

   #[error("Session has been closed")]
   SessionClosed,

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Radio command channel overflow")]
   ChannelOverflow,

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl SessionError {
   /// Whether this error rejected a single request but left the session usable.
   pub const fn is_rejection(&self) -> bool {
      matches!(
         self,
         Self::PermissionDenied(_)
            | Self::InvalidStateTransition { .. }
            | Self::PairingActive
            | Self::InvalidDuration(_)
      )
   }
}

/// Convenience type alias for Results with `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;
