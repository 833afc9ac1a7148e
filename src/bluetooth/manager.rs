//! Session manager for the local adapter.
//!
//! This module owns the session controller and serializes user commands,
//! adapter notifications and periodic health checks onto a single task.

use std::time::Duration;

use bluer::{
   Adapter, Address, Session,
   agent::{Agent, AgentHandle, ReqError, ReqResult, RequestAuthorization, RequestConfirmation},
};
use futures::FutureExt;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::{
      adapter::{self, BluerRadio},
      monitor,
   },
   config::Config,
   error::{Result, SessionError},
   event::EventSender,
   session::{
      controller::{PairingToggle, Pending, SessionController},
      device::DeviceRecord,
      permission::PermissionGrant,
      radio::RadioSnapshot,
      state::{AdapterState, Notification},
   },
};

/// Maximum adapter recovery delay
const MAX_RECOVERY_DELAY: Duration = Duration::from_secs(120);
/// Time given to a background task to finish after abort
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);
/// Pending radio commands; the controller allows one in flight
const RADIO_QUEUE_SIZE: usize = 8;
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Internal events
   RecoverAdapter,
   PairingRequest(Address, oneshot::Sender<bool>),

   // User commands
   RequestEnable(oneshot::Sender<Result<()>>),
   RequestDisable(oneshot::Sender<Result<()>>),
   RequestDiscoverable(Option<Duration>, oneshot::Sender<Result<()>>),
   TogglePairing(oneshot::Sender<Result<bool>>),
   ListPaired(oneshot::Sender<Result<Vec<DeviceRecord>>>),
   SetPermissions(PermissionGrant, oneshot::Sender<Result<()>>),
   CountConnected(oneshot::Sender<usize>),
}

// === Main Manager ===

/// Handle to the session actor.
///
/// The actor stops once the handle is dropped or the session terminates;
/// state watchers observe this as a closed channel.
pub struct SessionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   state_rx: watch::Receiver<AdapterState>,
}

impl SessionManager {
   /// Opens the configured adapter and starts the session actor.
   ///
   /// Fails with `AdapterUnavailable` when there is no adapter, and with
   /// `PermissionDenied` when a hard capability is not granted.
   pub async fn new(event_tx: EventSender, config: Config) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(config, event_tx, command_rx).await?;
      let state_rx = actor.controller.subscribe();
      tokio::spawn(actor.run());
      Ok(Self {
         inbox: command_tx,
         state_rx,
      })
   }

   async fn call<T>(
      &self,
      command: impl FnOnce(oneshot::Sender<Result<T>>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| SessionError::ManagerShutdown)?;
      rx.await.map_err(|_| SessionError::ManagerShutdown)?
   }

   pub fn state(&self) -> AdapterState {
      *self.state_rx.borrow()
   }

   pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
      self.state_rx.clone()
   }

   pub async fn request_enable(&self) -> Result<()> {
      self.call(ManagerCommand::RequestEnable).await
   }

   pub async fn request_disable(&self) -> Result<()> {
      self.call(ManagerCommand::RequestDisable).await
   }

   /// Requests a discoverable window; the configured timeout when `None`.
   pub async fn request_discoverable(&self, duration: Option<Duration>) -> Result<()> {
      self
         .call(|tx| ManagerCommand::RequestDiscoverable(duration, tx))
         .await
   }

   /// Returns `true` when pairing started and `false` when it stopped.
   pub async fn toggle_pairing(&self) -> Result<bool> {
      self.call(ManagerCommand::TogglePairing).await
   }

   pub async fn list_paired(&self) -> Result<Vec<DeviceRecord>> {
      self.call(ManagerCommand::ListPaired).await
   }

   pub async fn set_permissions(&self, grant: PermissionGrant) -> Result<()> {
      self
         .call(|tx| ManagerCommand::SetPermissions(grant, tx))
         .await
   }

   pub async fn connected_count(&self) -> usize {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::CountConnected(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   notify_rx: mpsc::Receiver<Notification>,
   notify_tx: mpsc::Sender<Notification>,
   session: Session,
   adapter: Adapter,
   controller: SessionController<BluerRadio>,

   // State
   monitor_handle: Option<JoinHandle<()>>,
   executor_handle: Option<JoinHandle<()>>,
   agent: Option<AgentHandle>,
   retry_count: u32,
}

impl ManagerActor {
   async fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = adapter::resolve(&session, config.adapter.as_deref()).await?;
      let snapshot = match &adapter {
         Some(adapter) => Some(adapter::probe(adapter).await?),
         None => None,
      };

      let (radio_tx, radio_rx) = mpsc::channel(RADIO_QUEUE_SIZE);
      let radio = BluerRadio::new(snapshot, radio_tx);
      let mut controller = SessionController::new(radio, event_tx, &config);
      controller.on_permission_result(config.permissions)?;
      controller.initialize()?;
      let Some(adapter) = adapter else {
         return Err(SessionError::AdapterUnavailable);
      };
      info!("Using adapter {}", adapter.name());

      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (notify_tx, notify_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let executor_handle =
         adapter::spawn_executor(adapter.clone(), radio_rx, notify_tx.clone());
      let monitor_handle = monitor::start_adapter_monitor(adapter.clone(), notify_tx.clone());

      let agent = if config.pairing_agent {
         match register_agent(&session, loopback_tx.clone()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
               warn!("Failed to register pairing agent: {e}");
               None
            },
         }
      } else {
         None
      };

      Ok(Self {
         config,
         command_rx,
         loopback_rx,
         loopback_tx,
         notify_rx,
         notify_tx,
         session,
         adapter,
         controller,
         monitor_handle: Some(monitor_handle),
         executor_handle: Some(executor_handle),
         agent,
         retry_count: 0,
      })
   }

   async fn run(mut self) {
      info!("Session manager starting up");

      let mut health_check_interval = time::interval(self.config.health_check_interval());
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Main event loop
      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_health().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Session manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
             Some(notification) = self.notify_rx.recv() => {
                 self.handle_notification(notification);
             }
         }
         if self.controller.is_closed() {
            warn!("Session terminated");
            break;
         }
      }

      // Cleanup
      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::RecoverAdapter => {
            self.recover_adapter().await;
         },
         ManagerCommand::PairingRequest(addr, reply) => {
            self
               .controller
               .on_notification(Notification::PairingRequest(addr));
            let _ = reply.send(self.controller.pairing_active());
         },
         ManagerCommand::RequestEnable(reply) => {
            let _ = reply.send(accepted(self.controller.request_enable()));
         },
         ManagerCommand::RequestDisable(reply) => {
            let _ = reply.send(accepted(self.controller.request_disable()));
         },
         ManagerCommand::RequestDiscoverable(duration, reply) => {
            let duration = duration.unwrap_or_else(|| self.config.discoverable_timeout());
            let _ = reply.send(accepted(self.controller.request_discoverable(duration)));
         },
         ManagerCommand::TogglePairing(reply) => {
            let result = self.controller.toggle_pairing().map(|toggle| match toggle {
               PairingToggle::Started { enable } => {
                  if let Some(pending) = enable {
                     debug!("Pairing powers the adapter up: {:?}", pending.command);
                  }
                  true
               },
               PairingToggle::Stopped => false,
            });
            let _ = reply.send(result);
         },
         ManagerCommand::ListPaired(reply) => {
            let _ = reply.send(self.controller.list_paired());
         },
         ManagerCommand::SetPermissions(grant, reply) => {
            let _ = reply.send(self.set_permissions(grant));
         },
         ManagerCommand::CountConnected(reply) => {
            let _ = reply.send(self.controller.connected_count());
         },
      }
   }

   fn handle_notification(&mut self, notification: Notification) {
      if matches!(notification, Notification::RadioLost) {
         self.handle_adapter_lost();
      }
      self.controller.on_notification(notification);
   }

   fn set_permissions(&mut self, grant: PermissionGrant) -> Result<()> {
      let changed = self.controller.grants() != grant;
      self.controller.on_permission_result(grant)?;
      if changed {
         self.config.permissions = grant;
         if let Err(e) = self.config.save() {
            warn!("Failed to save permissions: {e}");
         }
      }
      Ok(())
   }

   fn handle_adapter_lost(&mut self) {
      warn!("Adapter lost: {}", self.adapter.name());

      if let Some(handle) = self.monitor_handle.take() {
         handle.abort();
      }
      self.schedule_recovery();
   }

   fn schedule_recovery(&mut self) {
      self.retry_count += 1;
      let delay = calc_retry_delay(self.retry_count);
      info!("Retrying adapter {} in {delay:?}", self.adapter.name());

      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(ManagerCommand::RecoverAdapter).await;
      });
   }

   async fn recover_adapter(&mut self) {
      if self.monitor_handle.is_some() {
         return;
      }

      // The executor keeps its handle; BlueZ reuses the object path per name.
      match reopen(&self.session, self.adapter.name()).await {
         Ok((adapter, snapshot)) => {
            info!("Adapter available: {}", adapter.name());
            self.retry_count = 0;
            self.monitor_handle = Some(monitor::start_adapter_monitor(
               adapter.clone(),
               self.notify_tx.clone(),
            ));
            self.adapter = adapter;
            self
               .controller
               .on_notification(Notification::RadioRestored(snapshot));
         },
         Err(e) => {
            debug!("Adapter recovery failed: {e}");
            self.schedule_recovery();
         },
      }
   }

   async fn check_health(&mut self) {
      if self.monitor_handle.is_none() {
         return;
      }

      // Power first, so peers found by the poll land in a powered state.
      self.reconcile().await;

      match monitor::connected_devices(&self.adapter).await {
         Ok(now) => self.controller.sync_peers(&now),
         Err(e) => debug!("Failed to poll connected devices: {e}"),
      }
   }

   /// Folds adapter changes the event stream missed into the session.
   ///
   /// Skipped while a request is in flight so a pending transition is only
   /// resolved by its own notification.
   async fn reconcile(&mut self) {
      let state = self.controller.state();
      if !self.controller.is_settled()
         || state.is_transient()
         || state == AdapterState::Unavailable
      {
         return;
      }

      let (Ok(powered), Ok(discoverable)) = (
         self.adapter.is_powered().await,
         self.adapter.is_discoverable().await,
      ) else {
         return;
      };

      if powered != state.is_powered() {
         info!("Adapter power changed behind the session ({state})");
         for n in Notification::power_path(powered) {
            self.controller.on_notification(n);
         }
      }
      if powered
         && matches!(
            (self.controller.state(), discoverable),
            (AdapterState::On, true) | (AdapterState::Discoverable, false)
         )
      {
         self
            .controller
            .on_notification(Notification::ScanMode { discoverable });
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up session manager");
      self.controller.teardown();

      // Dropping the handle unregisters the agent
      self.agent.take();

      for handle in [self.monitor_handle.take(), self.executor_handle.take()]
         .into_iter()
         .flatten()
      {
         handle.abort();
         let _ = time::timeout(CLEANUP_TIMEOUT, handle).await;
      }
   }
}

fn accepted(result: Result<Pending>) -> Result<()> {
   match result {
      Ok(pending) => {
         debug!("{} pending on {:?}", pending.request, pending.command);
         Ok(())
      },
      Err(e) if e.is_rejection() => Err(e),
      Err(e) => {
         warn!("Request could not be submitted: {e}");
         Err(e)
      },
   }
}

async fn reopen(session: &Session, name: &str) -> Result<(Adapter, RadioSnapshot)> {
   let adapter = session.adapter(name)?;
   let snapshot = adapter::probe(&adapter).await?;
   Ok((adapter, snapshot))
}

// === Pairing Agent ===

/// Registers an agent that accepts pairing only while pairing is active.
async fn register_agent(
   session: &Session,
   loopback: mpsc::Sender<ManagerCommand>,
) -> Result<AgentHandle> {
   let confirm = loopback.clone();
   let agent = Agent {
      request_default: true,
      request_confirmation: Some(Box::new(move |req: RequestConfirmation| {
         debug!("Passkey {:06} for {}", req.passkey, req.device);
         ask_pairing(confirm.clone(), req.device).boxed()
      })),
      request_authorization: Some(Box::new(move |req: RequestAuthorization| {
         ask_pairing(loopback.clone(), req.device).boxed()
      })),
      ..Default::default()
   };
   let handle = session.register_agent(agent).await?;
   info!("Pairing agent registered");
   Ok(handle)
}

async fn ask_pairing(loopback: mpsc::Sender<ManagerCommand>, device: Address) -> ReqResult<()> {
   let (tx, rx) = oneshot::channel();
   if loopback
      .send(ManagerCommand::PairingRequest(device, tx))
      .await
      .is_err()
   {
      return Err(ReqError::Canceled);
   }
   match rx.await {
      Ok(true) => Ok(()),
      Ok(false) => {
         info!("Rejecting pairing with {device}: pairing is not active");
         Err(ReqError::Rejected)
      },
      Err(_) => Err(ReqError::Canceled),
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RECOVERY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::session::{
      permission::Capability, radio::RadioCommand, state::SessionRequest,
   };

   const PHONE: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

   /// Handle wired to a stub actor answering from a fixed script.
   fn stub_manager() -> (SessionManager, JoinHandle<Vec<&'static str>>) {
      let (inbox, mut rx) = mpsc::channel(4);
      let (state_tx, state_rx) = watch::channel(AdapterState::On);
      let actor = tokio::spawn(async move {
         let mut seen = Vec::new();
         while let Some(cmd) = rx.recv().await {
            match cmd {
               ManagerCommand::RequestEnable(reply) => {
                  seen.push("enable");
                  let _ = reply.send(Err(SessionError::InvalidStateTransition {
                     request: SessionRequest::EnableRadio,
                     state: AdapterState::On,
                  }));
               },
               ManagerCommand::RequestDiscoverable(duration, reply) => {
                  seen.push("discoverable");
                  assert_eq!(duration, Some(Duration::from_secs(60)));
                  state_tx.send_replace(AdapterState::Discoverable);
                  let _ = reply.send(Ok(()));
               },
               ManagerCommand::ListPaired(reply) => {
                  seen.push("list");
                  let _ = reply.send(Ok(vec![DeviceRecord::new(PHONE)]));
               },
               ManagerCommand::SetPermissions(grant, reply) => {
                  seen.push("permissions");
                  let _ = reply.send(Err(SessionError::PermissionDenied(
                     grant.first_denied().unwrap_or(Capability::Scan),
                  )));
               },
               ManagerCommand::CountConnected(reply) => {
                  seen.push("count");
                  let _ = reply.send(2);
               },
               other => panic!("unexpected command {other:?}"),
            }
         }
         seen
      });
      (SessionManager { inbox, state_rx }, actor)
   }

   #[tokio::test]
   async fn test_handle_round_trips_commands() {
      let (manager, actor) = stub_manager();
      assert_eq!(manager.state(), AdapterState::On);

      assert!(matches!(
         manager.request_enable().await,
         Err(SessionError::InvalidStateTransition { .. })
      ));
      let mut state = manager.subscribe();
      manager
         .request_discoverable(Some(Duration::from_secs(60)))
         .await
         .unwrap();
      assert_eq!(*state.borrow_and_update(), AdapterState::Discoverable);
      assert_eq!(manager.list_paired().await.unwrap()[0].address, PHONE);
      assert!(matches!(
         manager
            .set_permissions(PermissionGrant::ALL.with(Capability::Connect, false))
            .await,
         Err(SessionError::PermissionDenied(Capability::Connect))
      ));
      assert_eq!(manager.connected_count().await, 2);

      drop(manager);
      assert_eq!(
         actor.await.unwrap(),
         ["enable", "discoverable", "list", "permissions", "count"]
      );
   }

   #[tokio::test]
   async fn test_handle_after_actor_exit() {
      let (inbox, rx) = mpsc::channel(1);
      let (_state_tx, state_rx) = watch::channel(AdapterState::Off);
      drop(rx);
      let manager = SessionManager { inbox, state_rx };

      assert!(matches!(
         manager.toggle_pairing().await,
         Err(SessionError::ManagerShutdown)
      ));
      assert_eq!(manager.connected_count().await, 0);
   }

   #[tokio::test]
   async fn test_pairing_request_answer() {
      let (tx, mut rx) = mpsc::channel(2);
      let responder = tokio::spawn(async move {
         let mut answers = [true, false].into_iter();
         while let Some(ManagerCommand::PairingRequest(addr, reply)) = rx.recv().await {
            assert_eq!(addr, PHONE);
            let _ = reply.send(answers.next().unwrap_or(false));
         }
      });

      assert!(ask_pairing(tx.clone(), PHONE).await.is_ok());
      assert!(matches!(
         ask_pairing(tx.clone(), PHONE).await,
         Err(ReqError::Rejected)
      ));
      drop(tx);
      responder.await.unwrap();
   }

   #[test]
   fn test_accepted_discards_pending() {
      let pending = Pending {
         request: SessionRequest::DisableRadio,
         command: RadioCommand::Disable,
      };
      assert!(accepted(Ok(pending)).is_ok());
      assert!(matches!(
         accepted(Err(SessionError::PairingActive)),
         Err(SessionError::PairingActive)
      ));
   }

   #[test]
   fn test_retry_delay_backs_off() {
      let first = calc_retry_delay(1);
      assert!(first >= Duration::from_secs(4) && first < Duration::from_secs(5));
      let fifth = calc_retry_delay(5);
      assert!(fifth >= Duration::from_secs(64) && fifth < Duration::from_secs(65));
      let capped = calc_retry_delay(30);
      assert!(capped >= MAX_RECOVERY_DELAY && capped < MAX_RECOVERY_DELAY + Duration::from_secs(1));
   }
}
