//! Exclusive discovery scans.

use log::{debug, info, warn};
use smol_str::ToSmolStr;

use super::{Loopback, ManagerActor, Reply, Ticket, pending::PendingOp};
use crate::{
   device::Device,
   driver::RadioDriver,
   error::{DriverError, DriverResult, Result, SessionError},
   event::SessionEvent,
};

type Scan = PendingOp<Vec<Device>, Vec<Device>>;

/// At most one scan runs at a time; a second `start` is refused, not queued.
#[derive(Default)]
pub(super) struct DiscoveryController {
   scan: Option<Scan>,
}

impl DiscoveryController {
   pub const fn is_active(&self) -> bool {
      self.scan.is_some()
   }
}

impl<D: RadioDriver> ManagerActor<D> {
   fn check_can_discover(&self) -> Result<()> {
      if self.discovery.is_active() {
         return Err(SessionError::AlreadyActive);
      }
      if !self.radio.is_enabled() {
         return Err(SessionError::Radio(DriverError::PoweredOff));
      }
      if self.connection.is_connecting() {
         return Err(SessionError::RadioBusy);
      }
      Ok(())
   }

   pub(super) fn start_discovery(&mut self, reply: Reply<Vec<Device>>) {
      if let Err(e) = self.check_can_discover() {
         self.reply("discovery", reply, Err(e));
         return;
      }

      let ticket = self.ticket();
      let driver = self.driver.clone();
      let task = self.spawn_op(async move {
         Loopback::DiscoveryFinished(ticket, driver.start_discovery().await)
      });
      self.discovery.scan = Some(PendingOp::new(ticket, reply, task));

      info!("Discovery started");
      self.emit(SessionEvent::DiscoveryStateChanged { active: true });
   }

   pub(super) fn cancel_discovery(&mut self, reply: Reply<bool>) {
      let Some(scan) = self.discovery.scan.as_mut() else {
         let _ = reply.send(Ok(false));
         return;
      };

      if scan.add_cancel_waiter(reply) {
         debug!("Requesting discovery cancellation");
         let ticket = scan.ticket;
         let driver = self.driver.clone();
         // Detached: completion arrives as `DiscoveryCancelled`.
         drop(self.spawn_op(async move {
            Loopback::DiscoveryCancelled(ticket, driver.cancel_discovery().await)
         }));
      }
   }

   pub(super) fn on_discovery_finished(&mut self, ticket: Ticket, result: DriverResult<Vec<Device>>) {
      let Some(scan) = self.discovery.scan.as_mut().filter(|s| s.ticket == ticket) else {
         debug!("Dropping result of superseded scan");
         return;
      };

      if scan.is_cancelling() {
         // The cancel verdict decides whether this result counts.
         scan.parked = Some(result);
         return;
      }

      if let Some(scan) = self.discovery.scan.take() {
         self.complete_discovery(scan, result);
      }
   }

   pub(super) fn on_discovery_cancelled(&mut self, ticket: Ticket, verdict: DriverResult<bool>) {
      let Some(mut scan) = self.discovery.scan.take_if(|s| s.ticket == ticket) else {
         return;
      };

      scan.answer_cancel(&verdict);
      match verdict {
         Ok(true) => {
            info!("Discovery cancelled, discarding partial results");
            self.finish_cancelled_discovery(scan);
         },
         other => {
            if let Err(e) = other {
               warn!("Driver failed to cancel discovery: {e}");
               self.emit(SessionEvent::OperationFailed {
                  operation: "cancel_discovery",
                  message: e.to_smolstr(),
               });
            }
            match scan.parked.take() {
               Some(result) => self.complete_discovery(scan, result),
               None => self.discovery.scan = Some(scan),
            }
         },
      }
   }

   fn complete_discovery(&mut self, mut scan: Scan, result: DriverResult<Vec<Device>>) {
      let outcome = match result {
         Ok(found) => {
            self.registry.merge_discovered(found);
            // The connected device may have been re-reported as idle.
            if let Some(device) = self.connection.connected_device()
               && let Some(entry) = self.registry.get(device.address)
               && !entry.connected
            {
               let entry = entry.clone().connected(true);
               self.registry.upsert(entry);
            }
            info!(
               "Discovery finished, {} unpaired devices",
               self.registry.discovered().len()
            );
            self.publish_registry();
            Ok(self.registry.discovered().to_vec())
         },
         Err(e) => Err(SessionError::Discovery(e)),
      };

      self.emit(SessionEvent::DiscoveryStateChanged { active: false });
      if let Some(reply) = scan.reply.take() {
         self.reply("discovery", reply, outcome);
      }
   }

   fn finish_cancelled_discovery(&mut self, mut scan: Scan) {
      self.emit(SessionEvent::DiscoveryStateChanged { active: false });
      if let Some(reply) = scan.reply.take() {
         let _ = reply.send(Err(SessionError::Cancelled));
      }
   }

   /// Ends any scan immediately; the driver is told best-effort.
   pub(super) fn force_cancel_discovery(&mut self) {
      let Some(mut scan) = self.discovery.scan.take() else {
         return;
      };

      scan.answer_cancel(&Ok(true));
      let driver = self.driver.clone();
      tokio::spawn(async move {
         if let Err(e) = driver.cancel_discovery().await {
            debug!("Best-effort discovery cancel failed: {e}");
         }
      });
      self.finish_cancelled_discovery(scan);
   }
}
