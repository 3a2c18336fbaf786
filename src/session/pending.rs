use tokio::task::JoinHandle;

use super::{Reply, Ticket};
use crate::error::{DriverResult, SessionError};

/// A cancellable driver operation (scan or accept) owned by the actor.
///
/// While a driver-level cancel is in flight the operation's own result is
/// parked: whether it is delivered or discarded depends on the cancel verdict.
pub(super) struct PendingOp<T, R> {
   pub ticket: Ticket,
   pub reply: Option<Reply<R>>,
   pub parked: Option<DriverResult<T>>,
   task: JoinHandle<()>,
   cancel_waiters: Vec<Reply<bool>>,
}

impl<T, R> PendingOp<T, R> {
   pub fn new(ticket: Ticket, reply: Reply<R>, task: JoinHandle<()>) -> Self {
      Self {
         ticket,
         reply: Some(reply),
         parked: None,
         task,
         cancel_waiters: Vec::new(),
      }
   }

   pub fn is_cancelling(&self) -> bool {
      !self.cancel_waiters.is_empty()
   }

   /// Queues a cancel caller. Returns true if the driver must be asked, i.e.
   /// no cancel request is in flight yet.
   pub fn add_cancel_waiter(&mut self, waiter: Reply<bool>) -> bool {
      self.cancel_waiters.push(waiter);
      self.cancel_waiters.len() == 1
   }

   /// Answers every queued cancel caller with the driver's verdict.
   pub fn answer_cancel(&mut self, verdict: &DriverResult<bool>) {
      for waiter in self.cancel_waiters.drain(..) {
         let answer = match verdict {
            Ok(confirmed) => Ok(*confirmed),
            Err(e) => Err(SessionError::Radio(e.replicate())),
         };
         let _ = waiter.send(answer);
      }
   }
}

impl<T, R> Drop for PendingOp<T, R> {
   fn drop(&mut self) {
      self.task.abort();
      // Cancel callers still queued lost the race with completion.
      for waiter in self.cancel_waiters.drain(..) {
         let _ = waiter.send(Ok(false));
      }
   }
}
