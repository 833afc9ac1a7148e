//! Bluetooth session controller.
//!
//! The controller owns the single `AdapterState` value. It validates user
//! requests against that state and the granted capabilities, forwards
//! accepted requests to the radio, and folds asynchronous platform
//! notifications back into the state through the transition table.
//!
//! All methods are synchronous and never block; the caller is expected to
//! feed requests and notifications one at a time.

use std::{
   collections::{BTreeMap, HashSet},
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use smol_str::{SmolStr, format_smolstr};
use tokio::sync::watch;

use crate::{
   config::Config,
   error::{Result, SessionError},
   event::{EventSender, SessionEvent},
   session::{
      device::{BondState, DeviceRecord},
      permission::{Capability, PermissionGrant},
      pulse::Pulse,
      radio::{Radio, RadioCommand, RadioSnapshot},
      state::{AdapterState, Notification, SessionRequest, Transition},
   },
};

/// Longest discoverable window the radio accepts.
const MAX_DISCOVERABLE: Duration = Duration::from_secs(3600);

/// An accepted request still waiting for the radio to act on it.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
   pub request: SessionRequest,
   pub command: RadioCommand,
}

/// Outcome of toggling the pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingToggle {
   /// Pulse started; carries the enable request issued if the radio was off.
   Started { enable: Option<Pending> },
   Stopped,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifecycle {
   Created,
   Active,
   Closed,
}

pub struct SessionController<R> {
   radio: R,
   event_tx: EventSender,
   hard_capabilities: Vec<Capability>,
   grants: PermissionGrant,
   lifecycle: Lifecycle,
   state_tx: watch::Sender<AdapterState>,

   in_flight: Option<RadioCommand>,
   discovering: bool,
   peers: HashSet<Address>,
   bonded: BTreeMap<Address, DeviceRecord>,
   pulse: Pulse,
}

impl<R: Radio> SessionController<R> {
   pub fn new(radio: R, event_tx: EventSender, config: &Config) -> Self {
      let (state_tx, _) = watch::channel(AdapterState::Unavailable);
      Self {
         radio,
         event_tx,
         hard_capabilities: config.hard_capabilities.clone(),
         grants: config.permissions,
         lifecycle: Lifecycle::Created,
         state_tx,
         in_flight: None,
         discovering: false,
         peers: HashSet::new(),
         bonded: BTreeMap::new(),
         pulse: Pulse::new(config.pulse_interval()),
      }
   }

   /// Queries the radio and seeds the session from its current state.
   pub fn initialize(&mut self) -> Result<AdapterState> {
      if self.lifecycle == Lifecycle::Closed {
         return Err(SessionError::SessionClosed);
      }
      let snapshot = self.radio.snapshot().ok_or(SessionError::AdapterUnavailable)?;
      self.lifecycle = Lifecycle::Active;
      self.seed(&snapshot);

      let state = if !snapshot.powered {
         AdapterState::Off
      } else if !self.peers.is_empty() {
         AdapterState::Connected
      } else if snapshot.discoverable {
         AdapterState::Discoverable
      } else {
         AdapterState::On
      };
      self.publish(state);
      info!(
         "Session initialized: adapter {state}, {} bonded devices",
         self.bonded.len()
      );
      Ok(state)
   }

   pub fn state(&self) -> AdapterState {
      *self.state_tx.borrow()
   }

   /// Watches the adapter state; the receiver always holds the latest value.
   pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
      self.state_tx.subscribe()
   }

   pub fn grants(&self) -> PermissionGrant {
      self.grants
   }

   pub fn pairing_active(&self) -> bool {
      self.pulse.is_active()
   }

   /// No accepted request is waiting on the radio.
   pub fn is_settled(&self) -> bool {
      self.in_flight.is_none()
   }

   pub fn is_closed(&self) -> bool {
      self.lifecycle == Lifecycle::Closed
   }

   pub fn connected_count(&self) -> usize {
      self.peers.len()
   }

   #[cfg(test)]
   pub fn radio(&self) -> &R {
      &self.radio
   }

   pub fn request_enable(&mut self) -> Result<Pending> {
      let request = SessionRequest::EnableRadio;
      self.admit(request)?;
      self.expect_state(request, |s| s == AdapterState::Off)?;
      self.dispatch(RadioCommand::Enable)
   }

   pub fn request_disable(&mut self) -> Result<Pending> {
      let request = SessionRequest::DisableRadio;
      self.admit(request)?;
      self.expect_state(request, AdapterState::is_powered)?;
      self.dispatch(RadioCommand::Disable)
   }

   pub fn request_discoverable(&mut self, duration: Duration) -> Result<Pending> {
      let request = SessionRequest::RequestDiscoverable;
      self.admit(request)?;
      if self.pulse.is_active() {
         return Err(SessionError::PairingActive);
      }
      if duration.is_zero() || duration > MAX_DISCOVERABLE {
         return Err(SessionError::InvalidDuration(duration.as_secs()));
      }
      self.expect_state(request, |s| s == AdapterState::On)?;
      if self.discovering {
         debug!("Refusing discoverable request while discovery is running");
         return Err(self.invalid(request));
      }
      self.dispatch(RadioCommand::MakeDiscoverable { timeout: duration })
   }

   /// Paired devices ordered by address; empty while the radio is not up.
   pub fn list_paired(&self) -> Result<Vec<DeviceRecord>> {
      self.ensure_active()?;
      if let Some(cap) = self.grants.first_missing([Capability::Connect]) {
         return Err(SessionError::PermissionDenied(cap));
      }
      if !self.state().is_powered() {
         return Ok(Vec::new());
      }
      Ok(self.bonded.values().cloned().collect())
   }

   /// Starts or stops the pairing session.
   pub fn toggle_pairing(&mut self) -> Result<PairingToggle> {
      if self.pulse.stop() {
         info!("Pairing stopped");
         self.event_tx.emit(SessionEvent::PairingChanged(false));
         return Ok(PairingToggle::Stopped);
      }
      self.ensure_active()?;
      if self.state() == AdapterState::Unavailable {
         return Err(SessionError::AdapterUnavailable);
      }
      let enable = if self.state() == AdapterState::Off {
         Some(self.request_enable()?)
      } else {
         None
      };
      self.start_pairing();
      Ok(PairingToggle::Started { enable })
   }

   /// Records the answer of the permission surface.
   ///
   /// Denying a hard capability ends the session.
   pub fn on_permission_result(&mut self, grant: PermissionGrant) -> Result<()> {
      self.ensure_active_or_created()?;
      self.grants = grant;
      if let Some(cap) = grant.first_missing(self.hard_capabilities.iter().copied()) {
         warn!("Hard capability {cap} denied, terminating session");
         self.terminate(format_smolstr!("{cap} permission denied"));
         return Err(SessionError::PermissionDenied(cap));
      }
      if let Some(cap) = grant.first_denied() {
         info!("Capability {cap} denied; radio commands will be rejected");
      }
      Ok(())
   }

   /// Folds one platform notification into the session.
   pub fn on_notification(&mut self, notification: Notification) {
      if self.lifecycle != Lifecycle::Active {
         debug!("Dropping notification after teardown: {notification:?}");
         return;
      }
      let peers = self.peers.len();
      self.handle(notification);
      if self.peers.len() != peers {
         self
            .event_tx
            .emit(SessionEvent::PeerCountChanged(self.peers.len()));
      }
   }

   /// Folds a poll of the currently connected peers into the session.
   pub fn sync_peers(&mut self, connected: &HashSet<Address>) {
      let mut changes: Vec<_> = connected
         .difference(&self.peers)
         .map(|addr| Notification::PeerConnected(*addr))
         .collect();
      changes.extend(
         self
            .peers
            .difference(connected)
            .map(|addr| Notification::PeerDisconnected(*addr)),
      );
      for n in changes {
         self.on_notification(n);
      }
   }

   fn handle(&mut self, notification: Notification) {
      match notification {
         Notification::Power(power) => {
            if let Some(to @ (AdapterState::On | AdapterState::Off)) =
               self.apply(Transition::Power(power))
               && matches!(self.in_flight, Some(RadioCommand::Enable | RadioCommand::Disable))
            {
               debug!("Power request settled at {to}");
               self.in_flight = None;
            }
         },
         Notification::ScanMode { discoverable } => {
            self.apply(Transition::Discoverable(discoverable));
            if discoverable
               && matches!(self.in_flight, Some(RadioCommand::MakeDiscoverable { .. }))
            {
               self.in_flight = None;
               if self.state() == AdapterState::Discoverable {
                  self.start_pairing();
               }
            }
         },
         Notification::PeerConnected(addr) => {
            if !self.state().is_powered() {
               debug!("Ignoring peer {addr} while adapter is {}", self.state());
               return;
            }
            self.set_bonded_connected(addr, true);
            let first = self.peers.is_empty();
            if self.peers.insert(addr) && first {
               self.apply(Transition::FirstPeerConnected);
            }
         },
         Notification::PeerDisconnected(addr) => {
            self.set_bonded_connected(addr, false);
            if self.peers.remove(&addr) && self.peers.is_empty() {
               self.apply(Transition::LastPeerDisconnected);
            }
         },
         Notification::BondChanged(record, bond) => {
            match bond {
               BondState::Bonded => {
                  self.bonded.insert(record.address, record.clone());
               },
               BondState::None => {
                  self.bonded.remove(&record.address);
               },
               BondState::Bonding => {},
            }
            self.event_tx.emit(SessionEvent::BondChanged(record, bond));
         },
         Notification::DeviceFound(record) => {
            debug!("Device found: {} ({})", record.display_name(), record.address);
            self.event_tx.emit(SessionEvent::DeviceFound(record));
         },
         Notification::DiscoveryStarted => self.set_discovering(true),
         Notification::DiscoveryFinished => self.set_discovering(false),
         Notification::PairingRequest(addr) => {
            info!("Pairing request from {addr}");
            self.event_tx.emit(SessionEvent::PairingRequest(addr));
         },
         Notification::CommandAcknowledged(cmd) => match cmd {
            RadioCommand::Enable => {
               self.apply(Transition::EnableAcknowledged);
            },
            RadioCommand::Disable => {
               self.apply(Transition::DisableAcknowledged);
            },
            RadioCommand::MakeDiscoverable { timeout } => {
               debug!("Discoverable request accepted for {timeout:?}");
            },
         },
         Notification::CommandFailed(cmd, reason) => {
            warn!("Radio command {cmd:?} failed: {reason}");
            match cmd {
               RadioCommand::Enable => {
                  self.apply(Transition::EnableFailed);
               },
               RadioCommand::Disable => {
                  self.apply(Transition::DisableFailed);
               },
               RadioCommand::MakeDiscoverable { .. } => {},
            }
            if self.in_flight == Some(cmd) {
               self.in_flight = None;
            }
            self
               .event_tx
               .emit(SessionEvent::RequestFailed(cmd.request(), reason));
         },
         Notification::RadioLost => {
            self.apply(Transition::RadioLost);
            self.in_flight = None;
            self.peers.clear();
            self.set_discovering(false);
         },
         Notification::RadioRestored(snapshot) => {
            if self.apply(Transition::RadioRestored).is_none() {
               return;
            }
            self.seed(&snapshot);
            let peers: Vec<_> = snapshot.connected_peers().map(|d| d.address).collect();
            self.peers.clear();
            for n in Notification::power_path(snapshot.powered) {
               self.handle(n);
            }
            if snapshot.discoverable {
               self.handle(Notification::ScanMode { discoverable: true });
            }
            for addr in peers {
               self.handle(Notification::PeerConnected(addr));
            }
         },
         Notification::Unrecognized(category) => {
            debug!("Ignoring unrecognized notification: {category}");
         },
      }
   }

   /// Unsubscribes from the platform; the session ignores everything after.
   pub fn teardown(&mut self) {
      if self.lifecycle == Lifecycle::Closed {
         return;
      }
      self.lifecycle = Lifecycle::Closed;
      self.pulse.stop();
      self.in_flight = None;
      info!("Session torn down");
   }

   fn terminate(&mut self, reason: SmolStr) {
      self.teardown();
      self.event_tx.emit(SessionEvent::SessionTerminated(reason));
   }

   fn seed(&mut self, snapshot: &RadioSnapshot) {
      self.bonded = snapshot
         .bonded
         .iter()
         .map(|d| (d.address, d.clone()))
         .collect();
      self.peers = snapshot.connected_peers().map(|d| d.address).collect();
      self.discovering = snapshot.discovering;
   }

   fn start_pairing(&mut self) {
      if self.pulse.start(&self.event_tx) {
         info!("Pairing started");
         self.event_tx.emit(SessionEvent::PairingChanged(true));
      }
   }

   fn set_discovering(&mut self, discovering: bool) {
      if self.discovering != discovering {
         self.discovering = discovering;
         self.event_tx.emit(SessionEvent::DiscoveryChanged(discovering));
      }
   }

   fn set_bonded_connected(&mut self, addr: Address, connected: bool) {
      if let Some(record) = self.bonded.get_mut(&addr) {
         record.connected = connected;
      }
   }

   fn apply(&mut self, transition: Transition) -> Option<AdapterState> {
      let from = self.state();
      match from.next(transition) {
         Some(to) if to != from => {
            info!("Adapter state {from} -> {to}");
            self.publish(to);
            if matches!(to, AdapterState::Off | AdapterState::Unavailable) {
               self.peers.clear();
            }
            self.release_abandoned(from, to);
            Some(to)
         },
         _ => {
            debug!("Ignoring {transition:?} in state {from}");
            None
         },
      }
   }

   /// Drops an in-flight command whose outcome can no longer arrive in the
   /// state it was issued from.
   fn release_abandoned(&mut self, from: AdapterState, to: AdapterState) {
      let Some(cmd) = self.in_flight else {
         return;
      };
      let abandoned = match cmd {
         _ if matches!(to, AdapterState::Off | AdapterState::Unavailable) => true,
         RadioCommand::MakeDiscoverable { .. } => {
            from == AdapterState::On && to != AdapterState::Discoverable
         },
         RadioCommand::Enable | RadioCommand::Disable => false,
      };
      if abandoned {
         debug!("Releasing {cmd:?} after {from} -> {to}");
         self.in_flight = None;
      }
   }

   fn publish(&self, to: AdapterState) {
      let from = self.state_tx.send_replace(to);
      if from != to {
         self.event_tx.emit(SessionEvent::StateChanged { from, to });
      }
   }

   fn ensure_active(&self) -> Result<()> {
      match self.lifecycle {
         Lifecycle::Active => Ok(()),
         Lifecycle::Created => Err(SessionError::AdapterUnavailable),
         Lifecycle::Closed => Err(SessionError::SessionClosed),
      }
   }

   fn ensure_active_or_created(&self) -> Result<()> {
      if self.lifecycle == Lifecycle::Closed {
         return Err(SessionError::SessionClosed);
      }
      Ok(())
   }

   /// Checks lifecycle, radio presence and capabilities for a request.
   fn admit(&self, request: SessionRequest) -> Result<()> {
      self.ensure_active()?;
      if self.state() == AdapterState::Unavailable {
         return Err(SessionError::AdapterUnavailable);
      }
      let missing = if request.is_state_changing() {
         self.grants.first_denied()
      } else {
         self.grants.first_missing([Capability::Connect])
      };
      if let Some(cap) = missing {
         info!("Rejecting {request}: {cap} not granted");
         return Err(SessionError::PermissionDenied(cap));
      }
      if let Some(cmd) = self.in_flight {
         debug!("Rejecting {request}: {cmd:?} still pending");
         return Err(self.invalid(request));
      }
      Ok(())
   }

   fn expect_state(&self, request: SessionRequest, ok: impl Fn(AdapterState) -> bool) -> Result<()> {
      if ok(self.state()) {
         Ok(())
      } else {
         Err(self.invalid(request))
      }
   }

   fn invalid(&self, request: SessionRequest) -> SessionError {
      SessionError::InvalidStateTransition {
         request,
         state: self.state(),
      }
   }

   fn dispatch(&mut self, command: RadioCommand) -> Result<Pending> {
      self.radio.submit(command)?;
      self.in_flight = Some(command);
      debug!("Submitted {command:?}");
      Ok(Pending {
         request: command.request(),
         command,
      })
   }
}
