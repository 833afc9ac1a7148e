//! Periodic pairing pulse.
//!
//! While a pairing session is active the service emits a pulse event at a
//! fixed period so front-ends can animate an indicator. The pulse is a
//! cancellable tokio task; stopping it aborts the task.

use std::time::Duration;

use log::debug;
use tokio::{
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::event::{EventSender, SessionEvent};

/// Handle to the pairing pulse task.
#[derive(Debug)]
pub struct Pulse {
   period: Duration,
   handle: Option<JoinHandle<()>>,
}

impl Pulse {
   pub const fn new(period: Duration) -> Self {
      Self {
         period,
         handle: None,
      }
   }

   pub fn is_active(&self) -> bool {
      self.handle.as_ref().is_some_and(|h| !h.is_finished())
   }

   /// Starts pulsing; the first beat fires immediately. Returns `false` if
   /// the pulse was already running.
   ///
   /// Must be called from within a tokio runtime.
   pub fn start(&mut self, event_tx: &EventSender) -> bool {
      if self.is_active() {
         return false;
      }
      let period = self.period;
      let event_tx = event_tx.clone();
      self.handle = Some(tokio::spawn(async move {
         let mut interval = time::interval(period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         let mut beat = 0u64;
         loop {
            interval.tick().await;
            event_tx.emit(SessionEvent::PairingPulse(beat));
            beat = beat.wrapping_add(1);
         }
      }));
      debug!("Pairing pulse started ({period:?})");
      true
   }

   /// Cancels the pulse. Returns `false` if it was not running.
   pub fn stop(&mut self) -> bool {
      let Some(handle) = self.handle.take() else {
         return false;
      };
      handle.abort();
      debug!("Pairing pulse stopped");
      true
   }
}

impl Drop for Pulse {
   fn drop(&mut self) {
      self.stop();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::event::testing::RecordingBus;

   #[tokio::test(start_paused = true)]
   async fn test_pulse_ticks_until_stopped() {
      let (bus, tx) = RecordingBus::new();
      let mut pulse = Pulse::new(Duration::from_millis(1500));

      assert!(pulse.start(&tx));
      assert!(pulse.is_active());
      assert!(!pulse.start(&tx));

      // Beats at 0ms, 1500ms and 3000ms.
      time::sleep(Duration::from_millis(3100)).await;
      assert_eq!(bus.pulses(), 3);

      assert!(pulse.stop());
      assert!(!pulse.is_active());
      time::sleep(Duration::from_secs(10)).await;
      assert_eq!(bus.pulses(), 3);
      assert!(!pulse.stop());
   }

   #[tokio::test(start_paused = true)]
   async fn test_pulse_restarts_from_zero() {
      let (bus, tx) = RecordingBus::new();
      let mut pulse = Pulse::new(Duration::from_secs(1));

      pulse.start(&tx);
      time::sleep(Duration::from_millis(1500)).await;
      pulse.stop();
      bus.take();

      pulse.start(&tx);
      time::sleep(Duration::from_millis(10)).await;
      assert_eq!(bus.take(), vec![SessionEvent::PairingPulse(0)]);
   }
}
