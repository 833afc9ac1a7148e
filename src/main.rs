//! Bluetooth session D-Bus service.
//!
//! This service tracks the local Bluetooth adapter through its lifecycle,
//! accepts enable, disable and discoverable requests over D-Bus, and runs
//! a pairing session with a periodic pulse for the UI.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{select, signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::SessionManager;
use dbus::SessionService;
use event::{EventBus, SessionEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod session;

use crate::{dbus::SessionServiceSignals, error::Result};

const BUS_NAME: &str = "org.btsession";
const OBJECT_PATH: &str = "/org/btsession/controller";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting Bluetooth session service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration for adapter {}",
      config.adapter.as_deref().unwrap_or("(default)")
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   // Open the adapter and start the session
   let manager = SessionManager::new(event_bus.clone(), config).await?;
   let mut state = manager.subscribe();
   info!("Adapter is {}", manager.state());

   // Create D-Bus service
   let service = SessionService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("Bluetooth session service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal or the end of the session
   select! {
      res = signal::ctrl_c() => {
         res?;
         info!("Shutting down Bluetooth session service...");
      }
      () = async { while state.changed().await.is_ok() {} } => {
         warn!("Session ended, exiting");
      }
   }

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<SessionEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<SessionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<SessionService>, event: SessionEvent) -> Result<()> {
      match event {
         SessionEvent::StateChanged { from, to } => {
            iface.state_changed(from.to_str(), to.to_str()).await?;
         },
         SessionEvent::DeviceFound(device) => {
            iface.device_found(&device.to_json().to_string()).await?;
         },
         SessionEvent::BondChanged(device, bond) => {
            iface
               .bond_changed(&device.to_json().to_string(), bond.to_str())
               .await?;
         },
         SessionEvent::DiscoveryChanged(discovering) => {
            iface.discovery_changed(discovering).await?;
         },
         SessionEvent::PairingRequest(address) => {
            iface.pairing_request(&address.to_string()).await?;
         },
         SessionEvent::PairingPulse(beat) => {
            iface.pairing_pulse(beat).await?;
         },
         SessionEvent::PairingChanged(active) => {
            iface.pairing_changed(active).await?;
         },
         SessionEvent::PeerCountChanged(count) => {
            debug!("{count} peers connected");
            iface
               .get()
               .await
               .connected_count_changed(iface.signal_emitter())
               .await?;
         },
         SessionEvent::RequestFailed(request, reason) => {
            iface.request_failed(request.into(), &reason).await?;
         },
         SessionEvent::SessionTerminated(reason) => {
            iface.session_terminated(&reason).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SessionService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: SessionEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
