//! Radio power tracking.

use log::{debug, info, warn};

use super::{Loopback, ManagerActor};
use crate::{
   driver::{RadioDriver, Subscription},
   event::SessionEvent,
};

/// Tracks whether the radio is enabled and holds the driver subscriptions
/// that report transitions.
#[derive(Default)]
pub(super) struct RadioStateMonitor {
   enabled: bool,
   subscriptions: Vec<Subscription>,
}

impl RadioStateMonitor {
   pub const fn is_enabled(&self) -> bool {
      self.enabled
   }

   /// Unregisters the driver callbacks.
   pub fn release(&mut self) {
      if !self.subscriptions.is_empty() {
         debug!("Releasing {} radio subscriptions", self.subscriptions.len());
      }
      for sub in self.subscriptions.drain(..) {
         sub.remove();
      }
   }
}

impl<D: RadioDriver> ManagerActor<D> {
   /// Subscribes to radio transitions, then establishes the initial state.
   pub(super) async fn start_monitor(&mut self) {
      let loopback = self.loopback_tx.clone();
      let on = self.driver.on_enabled(Box::new(move || {
         let _ = loopback.send(Loopback::RadioChanged(true));
      }));
      let loopback = self.loopback_tx.clone();
      let off = self.driver.on_disabled(Box::new(move || {
         let _ = loopback.send(Loopback::RadioChanged(false));
      }));
      self.radio.subscriptions = vec![on, off];

      self.radio.enabled = match self.driver.is_enabled().await {
         Ok(enabled) => enabled,
         Err(e) => {
            warn!("Could not query radio state, assuming disabled: {e}");
            false
         },
      };
      info!(
         "Radio is {}",
         if self.radio.enabled {
            "enabled"
         } else {
            "disabled"
         }
      );
   }

   pub(super) fn on_radio_changed(&mut self, enabled: bool) {
      if self.radio.enabled == enabled {
         debug!("Ignoring repeated radio transition (enabled={enabled})");
         return;
      }

      if enabled {
         info!("Radio enabled");
      } else {
         info!("Radio disabled, tearing down discovery, accept and session");
         self.force_cancel_discovery();
         self.force_cancel_accept();
         self.force_disconnect();
         self.set_selected(None);
      }
      self.radio.enabled = enabled;
      self.emit(SessionEvent::RadioStateChanged { enabled });
   }
}
