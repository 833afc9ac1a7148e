use std::time::Duration;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::manager::SessionManager, error::SessionError, session::permission::PermissionGrant,
};

pub struct SessionService {
   manager: SessionManager,
}

impl SessionService {
   pub const fn new(manager: SessionManager) -> Self {
      Self { manager }
   }
}

fn to_fdo(e: SessionError) -> zbus::fdo::Error {
   match e {
      SessionError::InvalidDuration(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      SessionError::PermissionDenied(_) => zbus::fdo::Error::AccessDenied(e.to_string()),
      _ => zbus::fdo::Error::Failed(e.to_string()),
   }
}

#[interface(name = "org.btsession.Controller")]
impl SessionService {
   async fn state(&self) -> String {
      self.manager.state().to_str().to_owned()
   }

   async fn request_enable(&self) -> zbus::fdo::Result<bool> {
      self.manager.request_enable().await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn request_disable(&self) -> zbus::fdo::Result<bool> {
      self.manager.request_disable().await.map_err(to_fdo)?;
      Ok(true)
   }

   /// Zero seconds selects the configured timeout.
   async fn request_discoverable(&self, seconds: u32) -> zbus::fdo::Result<bool> {
      let duration = (seconds > 0).then(|| Duration::from_secs(seconds.into()));
      self
         .manager
         .request_discoverable(duration)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn list_paired(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .manager
         .list_paired()
         .await
         .map_err(to_fdo)?
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&devices).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   /// Returns whether pairing is now active.
   async fn toggle_pairing(&self) -> zbus::fdo::Result<bool> {
      self.manager.toggle_pairing().await.map_err(to_fdo)
   }

   async fn set_permissions(
      &self,
      scan: bool,
      advertise: bool,
      connect: bool,
      legacy: bool,
   ) -> zbus::fdo::Result<bool> {
      let grant = PermissionGrant {
         scan,
         advertise,
         connect,
         legacy,
      };
      self.manager.set_permissions(grant).await.map_err(to_fdo)?;
      if grant.is_complete() {
         info!("All capabilities granted");
      } else {
         info!("Permissions updated: {grant:?}");
      }
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(
      emitter: &SignalEmitter<'_>,
      from: &str,
      to: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn bond_changed(
      emitter: &SignalEmitter<'_>,
      device: &str,
      bond: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_changed(emitter: &SignalEmitter<'_>, discovering: bool)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_request(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_pulse(emitter: &SignalEmitter<'_>, beat: u64) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn pairing_changed(emitter: &SignalEmitter<'_>, active: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn request_failed(
      emitter: &SignalEmitter<'_>,
      request: &str,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_terminated(emitter: &SignalEmitter<'_>, reason: &str)
   -> zbus::Result<()>;

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self
         .manager
         .connected_count()
         .await
         .try_into()
         .unwrap_or(u32::MAX)
   }
}
