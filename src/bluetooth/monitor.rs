//! Adapter event monitoring.
//!
//! Translates the BlueZ adapter event stream into session notifications.
//! BlueZ does not report device connections on the adapter stream, so
//! connected peers are found by polling instead.

use std::collections::HashSet;

use bluer::{Adapter, AdapterEvent, AdapterProperty, Address};
use futures::stream::StreamExt;
use log::{debug, warn};
use smol_str::format_smolstr;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   bluetooth::adapter::device_record,
   session::{
      device::{BondState, DeviceRecord},
      state::Notification,
   },
};

/// Spawns the task forwarding adapter events to `notify`.
///
/// When the event stream ends the adapter is reported lost.
pub fn start_adapter_monitor(adapter: Adapter, notify: mpsc::Sender<Notification>) -> JoinHandle<()> {
   tokio::spawn(async move {
      let name = adapter.name().to_owned();
      let mut events = match adapter.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Failed to get adapter events for {name}: {e}");
            let _ = notify.send(Notification::RadioLost).await;
            return;
         },
      };

      while let Some(event) = events.next().await {
         let notifications = match event {
            AdapterEvent::PropertyChanged(prop) => property_notifications(prop),
            AdapterEvent::DeviceAdded(addr) => {
               debug!("Device added on {name}: {addr}");
               vec![device_added(&adapter, addr).await]
            },
            AdapterEvent::DeviceRemoved(addr) => {
               debug!("Device removed on {name}: {addr}");
               vec![Notification::BondChanged(DeviceRecord::new(addr), BondState::None)]
            },
         };
         for n in notifications {
            if notify.send(n).await.is_err() {
               return;
            }
         }
      }

      warn!("Adapter event stream for {name} ended");
      let _ = notify.send(Notification::RadioLost).await;
   })
}

/// Maps an adapter property change to notifications.
pub fn property_notifications(prop: AdapterProperty) -> Vec<Notification> {
   match prop {
      AdapterProperty::Powered(powered) => Notification::power_path(powered).to_vec(),
      AdapterProperty::Discoverable(discoverable) => {
         vec![Notification::ScanMode { discoverable }]
      },
      AdapterProperty::Discovering(true) => vec![Notification::DiscoveryStarted],
      AdapterProperty::Discovering(false) => vec![Notification::DiscoveryFinished],
      other => vec![Notification::Unrecognized(format_smolstr!("{other:?}"))],
   }
}

async fn device_added(adapter: &Adapter, addr: Address) -> Notification {
   let Ok(device) = adapter.device(addr) else {
      return Notification::Unrecognized(format_smolstr!("device {addr}"));
   };
   let record = device_record(&device).await;
   if device.is_paired().await.unwrap_or(false) {
      Notification::BondChanged(record, BondState::Bonded)
   } else {
      Notification::DeviceFound(record)
   }
}

/// Addresses of all devices currently connected to the adapter.
pub async fn connected_devices(adapter: &Adapter) -> bluer::Result<HashSet<Address>> {
   let mut connected = HashSet::new();
   for addr in adapter.device_addresses().await? {
      if let Ok(device) = adapter.device(addr)
         && device.is_connected().await.unwrap_or(false)
      {
         connected.insert(addr);
      }
   }
   Ok(connected)
}
