//! `bluer`-backed implementation of the radio contract.
//!
//! Commands are queued to an executor task which performs the D-Bus calls
//! against BlueZ and reports the outcome back as notifications.

use std::time::Duration;

use bluer::{Adapter, Device, Session};
use log::{debug, info, warn};
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::mpsc::{self, error::TrySendError},
   task::JoinHandle,
   time,
};

use crate::{
   error::{Result, SessionError},
   session::{
      device::DeviceRecord,
      radio::{Radio, RadioCommand, RadioSnapshot},
      state::Notification,
   },
};

/// Maximum time a single adapter call may take
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Looks up the adapter to drive; the first adapter when no name is given.
///
/// Returns `None` when no matching adapter exists.
pub async fn resolve(session: &Session, name: Option<&str>) -> Result<Option<Adapter>> {
   let mut names = session.adapter_names().await?;
   names.sort();
   let found = match name {
      Some(name) => names.into_iter().find(|n| n == name),
      None => names.into_iter().next(),
   };
   match found {
      Some(name) => Ok(Some(session.adapter(&name)?)),
      None => Ok(None),
   }
}

/// Reads the current adapter state and its bonded devices.
pub async fn probe(adapter: &Adapter) -> Result<RadioSnapshot> {
   let mut bonded = Vec::new();
   for addr in adapter.device_addresses().await? {
      let Ok(device) = adapter.device(addr) else {
         continue;
      };
      if device.is_paired().await.unwrap_or(false) {
         bonded.push(device_record(&device).await);
      }
   }
   bonded.sort_by_key(|d| d.address);

   Ok(RadioSnapshot {
      powered: adapter.is_powered().await?,
      discoverable: adapter.is_discoverable().await?,
      discovering: adapter.is_discovering().await?,
      bonded,
   })
}

/// Builds a record from whatever properties the device exposes.
pub async fn device_record(device: &Device) -> DeviceRecord {
   DeviceRecord {
      address: device.address(),
      name: device.name().await.ok().flatten().map(SmolStr::from),
      alias: device.alias().await.map(SmolStr::from).unwrap_or_default(),
      class: device.class().await.ok().flatten(),
      connected: device.is_connected().await.unwrap_or(false),
   }
}

/// Radio handle given to the session controller.
pub struct BluerRadio {
   snapshot: Option<RadioSnapshot>,
   commands: mpsc::Sender<RadioCommand>,
}

impl BluerRadio {
   pub const fn new(snapshot: Option<RadioSnapshot>, commands: mpsc::Sender<RadioCommand>) -> Self {
      Self { snapshot, commands }
   }
}

impl Radio for BluerRadio {
   fn snapshot(&self) -> Option<RadioSnapshot> {
      self.snapshot.clone()
   }

   fn submit(&mut self, cmd: RadioCommand) -> Result<()> {
      self.commands.try_send(cmd).map_err(|e| match e {
         TrySendError::Full(_) => SessionError::ChannelOverflow,
         TrySendError::Closed(_) => SessionError::ManagerShutdown,
      })
   }
}

/// Spawns the task that executes radio commands one at a time.
///
/// Each command is acknowledged before it runs; failures are reported as
/// `CommandFailed`. Success is confirmed with the state the command leaves
/// the adapter in, since BlueZ emits no property change when the value was
/// already set. Repeats of what the monitor reports are ignored downstream.
pub fn spawn_executor(
   adapter: Adapter,
   mut commands: mpsc::Receiver<RadioCommand>,
   notify: mpsc::Sender<Notification>,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      while let Some(cmd) = commands.recv().await {
         if notify
            .send(Notification::CommandAcknowledged(cmd))
            .await
            .is_err()
         {
            break;
         }

         let reason = match time::timeout(COMMAND_TIMEOUT, execute(&adapter, cmd)).await {
            Ok(Ok(())) => {
               debug!("{}: {cmd:?} done", adapter.name());
               for n in cmd.completion() {
                  if notify.send(n).await.is_err() {
                     return;
                  }
               }
               continue;
            },
            Ok(Err(e)) => e.to_smolstr(),
            Err(_) => SmolStr::new_static("timed out"),
         };
         warn!("{}: {cmd:?} failed: {reason}", adapter.name());
         if notify
            .send(Notification::CommandFailed(cmd, reason))
            .await
            .is_err()
         {
            break;
         }
      }
      info!("Radio command executor stopped");
   })
}

async fn execute(adapter: &Adapter, cmd: RadioCommand) -> bluer::Result<()> {
   match cmd {
      RadioCommand::Enable => adapter.set_powered(true).await,
      RadioCommand::Disable => adapter.set_powered(false).await,
      RadioCommand::MakeDiscoverable { timeout } => {
         let secs = timeout.as_secs().try_into().unwrap_or(u32::MAX);
         adapter.set_discoverable_timeout(secs).await?;
         adapter.set_discoverable(true).await
      },
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_submit_reports_full_queue() {
      let (tx, mut rx) = mpsc::channel(1);
      let mut radio = BluerRadio::new(None, tx);
      assert!(radio.snapshot().is_none());

      radio.submit(RadioCommand::Enable).unwrap();
      assert!(matches!(
         radio.submit(RadioCommand::Disable),
         Err(SessionError::ChannelOverflow)
      ));
      assert_eq!(rx.try_recv().unwrap(), RadioCommand::Enable);
   }

   #[test]
   fn test_submit_after_executor_exit() {
      let (tx, rx) = mpsc::channel(4);
      drop(rx);
      let mut radio = BluerRadio::new(Some(RadioSnapshot::default()), tx);
      assert!(matches!(
         radio.submit(RadioCommand::Enable),
         Err(SessionError::ManagerShutdown)
      ));
   }
}
