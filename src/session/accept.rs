//! Listening for one inbound connection.

use std::sync::Arc;

use log::{debug, info, warn};
use smol_str::ToSmolStr;

use super::{Loopback, ManagerActor, Reply, Ticket, pending::PendingOp};
use crate::{
   device::{ConnectOptions, Device},
   driver::{RadioConnection, RadioDriver},
   error::{DriverError, DriverResult, Result, SessionError},
   event::SessionEvent,
};

type Listen<C> = PendingOp<C, Device>;

pub(super) struct AcceptController<C> {
   listen: Option<Listen<C>>,
}

impl<C> Default for AcceptController<C> {
   fn default() -> Self {
      Self { listen: None }
   }
}

impl<C> AcceptController<C> {
   pub const fn is_active(&self) -> bool {
      self.listen.is_some()
   }
}

impl<D: RadioDriver> ManagerActor<D> {
   fn check_can_accept(&self) -> Result<()> {
      if self.accept.is_active() {
         return Err(SessionError::AlreadyActive);
      }
      if !self.radio.is_enabled() {
         return Err(SessionError::Radio(DriverError::PoweredOff));
      }
      // A session in any state, including a pending connect, owns the link.
      if self.connection.is_active() {
         return Err(SessionError::AlreadyConnected);
      }
      Ok(())
   }

   pub(super) fn accept(&mut self, options: ConnectOptions, reply: Reply<Device>) {
      if let Err(e) = self.check_can_accept() {
         self.reply("accept", reply, Err(e));
         return;
      }

      let ticket = self.ticket();
      let driver = self.driver.clone();
      let task = self.spawn_op(async move {
         Loopback::AcceptFinished(ticket, driver.accept(&options).await)
      });
      self.accept.listen = Some(PendingOp::new(ticket, reply, task));

      info!("Waiting for an inbound connection");
      self.emit(SessionEvent::AcceptStateChanged { active: true });
   }

   pub(super) fn cancel_accept(&mut self, reply: Reply<bool>) {
      let Some(listen) = self.accept.listen.as_mut() else {
         let _ = reply.send(Ok(false));
         return;
      };

      if listen.add_cancel_waiter(reply) {
         debug!("Requesting accept cancellation");
         let ticket = listen.ticket;
         let driver = self.driver.clone();
         drop(self.spawn_op(async move {
            Loopback::AcceptCancelled(ticket, driver.cancel_accept().await)
         }));
      }
   }

   pub(super) fn on_accept_finished(&mut self, ticket: Ticket, result: DriverResult<D::Connection>) {
      let Some(listen) = self.accept.listen.as_mut().filter(|l| l.ticket == ticket) else {
         if let Ok(link) = result {
            debug!("Closing inbound link of a superseded accept");
            self.close_detached(Arc::new(link));
         }
         return;
      };

      if listen.is_cancelling() {
         listen.parked = Some(result);
         return;
      }

      if let Some(listen) = self.accept.listen.take() {
         self.complete_accept(listen, result);
      }
   }

   pub(super) fn on_accept_cancelled(&mut self, ticket: Ticket, verdict: DriverResult<bool>) {
      let Some(mut listen) = self.accept.listen.take_if(|l| l.ticket == ticket) else {
         return;
      };

      listen.answer_cancel(&verdict);
      match verdict {
         Ok(true) => {
            info!("Accept cancelled");
            if let Some(Ok(link)) = listen.parked.take() {
               self.close_detached(Arc::new(link));
            }
            self.finish_cancelled_accept(listen);
         },
         other => {
            if let Err(e) = other {
               warn!("Driver failed to cancel accept: {e}");
               self.emit(SessionEvent::OperationFailed {
                  operation: "cancel_accept",
                  message: e.to_smolstr(),
               });
            }
            match listen.parked.take() {
               Some(result) => self.complete_accept(listen, result),
               None => self.accept.listen = Some(listen),
            }
         },
      }
   }

   fn complete_accept(&mut self, mut listen: Listen<D::Connection>, result: DriverResult<D::Connection>) {
      let reply = listen.reply.take();
      let ticket = listen.ticket;
      drop(listen);
      self.emit(SessionEvent::AcceptStateChanged { active: false });

      let outcome = match result {
         Ok(link) if self.connection.is_active() => {
            warn!(
               "Rejecting inbound connection from {}: a session already exists",
               link.device().address
            );
            self.close_detached(Arc::new(link));
            Err(SessionError::AlreadyConnected)
         },
         Ok(link) => {
            let peer = link.device();
            info!("Accepted connection from {}", peer.address);
            let session = self.establish(ticket, peer, link);
            self.set_selected(Some(session.device.clone()));
            Ok(session.device)
         },
         Err(e) => Err(SessionError::Connection(e)),
      };

      if let Some(reply) = reply {
         self.reply("accept", reply, outcome);
      }
   }

   fn finish_cancelled_accept(&mut self, mut listen: Listen<D::Connection>) {
      self.emit(SessionEvent::AcceptStateChanged { active: false });
      if let Some(reply) = listen.reply.take() {
         let _ = reply.send(Err(SessionError::Cancelled));
      }
   }

   /// Stops listening immediately; the driver is told best-effort.
   pub(super) fn force_cancel_accept(&mut self) {
      let Some(mut listen) = self.accept.listen.take() else {
         return;
      };

      listen.answer_cancel(&Ok(true));
      if let Some(Ok(link)) = listen.parked.take() {
         self.close_detached(Arc::new(link));
      }
      let driver = self.driver.clone();
      tokio::spawn(async move {
         if let Err(e) = driver.cancel_accept().await {
            debug!("Best-effort accept cancel failed: {e}");
         }
      });
      self.finish_cancelled_accept(listen);
   }
}
