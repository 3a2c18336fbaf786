//! The single connection session, outbound or accepted.

use std::{sync::Arc, time::SystemTime};

use bluer::Address;
use log::{debug, info, warn};
use smol_str::ToSmolStr;
use tokio::{task::JoinHandle, time};

use super::{DISCONNECT_TIMEOUT, Loopback, ManagerActor, Reply, Ticket};
use crate::{
   device::{ConnectOptions, ConnectionSession, ConnectionState, Device, Message},
   driver::{RadioConnection, RadioDriver},
   error::{DriverError, DriverResult, SessionError},
   event::SessionEvent,
};

/// State of the one active session.
struct ActiveSession<C> {
   ticket: Ticket,
   device: Device,
   state: ConnectionState,
   established_at: Option<SystemTime>,
   link: Option<Arc<C>>,
   reader: Option<JoinHandle<()>>,
   connect_reply: Option<Reply<ConnectionSession>>,
   disconnect_waiters: Vec<Reply<()>>,
}

impl<C> ActiveSession<C> {
   fn snapshot(&self) -> ConnectionSession {
      ConnectionSession {
         device: self.device.clone(),
         state: self.state,
         established_at: self.established_at,
      }
   }
}

impl<C> Drop for ActiveSession<C> {
   fn drop(&mut self) {
      if let Some(reader) = self.reader.take() {
         reader.abort();
      }
   }
}

/// Holds zero or one session; every connect and accept goes through it.
pub(super) struct ConnectionController<C> {
   session: Option<ActiveSession<C>>,
}

impl<C> Default for ConnectionController<C> {
   fn default() -> Self {
      Self { session: None }
   }
}

impl<C> ConnectionController<C> {
   pub fn is_active(&self) -> bool {
      self.session.is_some()
   }

   pub fn is_connecting(&self) -> bool {
      self
         .session
         .as_ref()
         .is_some_and(|s| s.state == ConnectionState::Connecting)
   }

   pub fn connected_device(&self) -> Option<&Device> {
      self
         .session
         .as_ref()
         .filter(|s| s.state == ConnectionState::Connected)
         .map(|s| &s.device)
   }

   pub fn connected_address(&self) -> Option<Address> {
      self.connected_device().map(|d| d.address)
   }

   pub fn snapshot(&self) -> Option<ConnectionSession> {
      self.session.as_ref().map(ActiveSession::snapshot)
   }
}

fn disconnected(device: Device) -> ConnectionSession {
   ConnectionSession {
      device,
      state: ConnectionState::Disconnected,
      established_at: None,
   }
}

impl<D: RadioDriver> ManagerActor<D> {
   pub(super) fn connect(
      &mut self,
      device: Device,
      options: ConnectOptions,
      reply: Reply<ConnectionSession>,
   ) {
      let refused = if self.connection.is_active() {
         Some(SessionError::AlreadyConnected)
      } else if !self.radio.is_enabled() {
         Some(SessionError::Radio(DriverError::PoweredOff))
      } else if self.discovery.is_active() || self.accept.is_active() {
         Some(SessionError::RadioBusy)
      } else {
         None
      };
      if let Some(e) = refused {
         self.reply("connect", reply, Err(e));
         return;
      }

      info!("Connecting to {} ({})", device.name, device.address);
      let ticket = self.ticket();
      let driver = self.driver.clone();
      let address = device.address;
      // Not aborted on teardown: a link that completes late loops back and
      // is closed.
      drop(self.spawn_op(async move {
         Loopback::Connected(ticket, driver.connect(address, &options).await)
      }));

      let session = ActiveSession {
         ticket,
         device,
         state: ConnectionState::Connecting,
         established_at: None,
         link: None,
         reader: None,
         connect_reply: Some(reply),
         disconnect_waiters: Vec::new(),
      };
      self.emit(SessionEvent::SessionChanged(session.snapshot()));
      self.connection.session = Some(session);
   }

   pub(super) fn on_connected(&mut self, ticket: Ticket, result: DriverResult<D::Connection>) {
      let Some(mut session) = self
         .connection
         .session
         .take_if(|s| s.ticket == ticket && s.state == ConnectionState::Connecting)
      else {
         // Attempt was cancelled or torn down while the driver was working.
         if let Ok(link) = result {
            self.close_detached(Arc::new(link));
         }
         return;
      };

      let reply = session.connect_reply.take();
      let outcome = match result {
         Ok(link) => {
            let device = session.device.clone();
            drop(session);
            Ok(self.establish(ticket, device, link))
         },
         Err(e) => {
            warn!("Failed to connect to {}: {e}", session.device.address);
            self.emit(SessionEvent::SessionChanged(disconnected(session.device.clone())));
            Err(SessionError::Connection(e))
         },
      };
      if let Some(reply) = reply {
         self.reply("connect", reply, outcome);
      }
   }

   /// Installs a freshly opened link as the `Connected` session.
   pub(super) fn establish(
      &mut self,
      ticket: Ticket,
      device: Device,
      link: D::Connection,
   ) -> ConnectionSession {
      // Registry snapshot wins over the caller's or driver's copy.
      let device = self
         .registry
         .get(device.address)
         .cloned()
         .unwrap_or(device)
         .connected(true);
      let link = Arc::new(link);
      let reader = self.spawn_reader(ticket, device.address, link.clone());

      let session = ActiveSession {
         ticket,
         device: device.clone(),
         state: ConnectionState::Connected,
         established_at: Some(SystemTime::now()),
         link: Some(link),
         reader: Some(reader),
         connect_reply: None,
         disconnect_waiters: Vec::new(),
      };
      let snapshot = session.snapshot();
      self.connection.session = Some(session);

      info!("Connected to {} ({})", device.name, device.address);
      self.upsert_device(device.clone());
      self.emit(SessionEvent::DeviceConnected(device));
      self.emit(SessionEvent::SessionChanged(snapshot.clone()));
      snapshot
   }

   fn spawn_reader(&self, ticket: Ticket, address: Address, link: Arc<D::Connection>) -> JoinHandle<()> {
      let loopback = self.loopback_tx.clone();
      let event_tx = self.event_tx.clone();
      tokio::spawn(async move {
         loop {
            match link.recv().await {
               Some(Ok(data)) => event_tx.emit(SessionEvent::MessageReceived { address, data }),
               Some(Err(e)) => {
                  warn!("Link to {address} failed: {e}");
                  break;
               },
               None => {
                  info!("Link to {address} closed by peer");
                  break;
               },
            }
         }
         let _ = loopback.send(Loopback::LinkClosed(ticket));
      })
   }

   pub(super) fn disconnect(&mut self, reply: Reply<()>) {
      let Some(session) = self.connection.session.as_mut() else {
         let _ = reply.send(Ok(()));
         return;
      };

      match session.state {
         ConnectionState::Connecting => {
            info!("Cancelling connection attempt to {}", session.device.address);
            if let Some(session) = self.connection.session.take() {
               self.finish_teardown(session, false);
            }
            let _ = reply.send(Ok(()));
         },
         ConnectionState::Connected => {
            info!("Disconnecting from {}", session.device.address);
            session.state = ConnectionState::Disconnecting;
            session.disconnect_waiters.push(reply);
            if let Some(reader) = session.reader.take() {
               reader.abort();
            }

            let ticket = session.ticket;
            let link = session.link.take();
            let snapshot = session.snapshot();
            drop(self.spawn_op(async move {
               let result = match link {
                  Some(link) => time::timeout(DISCONNECT_TIMEOUT, link.disconnect())
                     .await
                     .unwrap_or(Err(DriverError::Timeout)),
                  None => Ok(()),
               };
               Loopback::Disconnected(ticket, result)
            }));
            self.emit(SessionEvent::SessionChanged(snapshot));
         },
         ConnectionState::Disconnecting | ConnectionState::Disconnected => {
            session.disconnect_waiters.push(reply);
         },
      }
   }

   pub(super) fn on_disconnected(&mut self, ticket: Ticket, result: DriverResult<()>) {
      let Some(mut session) = self
         .connection
         .session
         .take_if(|s| s.ticket == ticket && s.state == ConnectionState::Disconnecting)
      else {
         return;
      };

      let waiters = std::mem::take(&mut session.disconnect_waiters);
      if let Err(e) = &result {
         warn!("Error closing link to {}: {e}", session.device.address);
      }
      self.finish_teardown(session, true);

      for waiter in waiters {
         let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(SessionError::Connection(e.replicate())),
         };
         self.reply("disconnect", waiter, outcome);
      }
   }

   pub(super) fn on_link_closed(&mut self, ticket: Ticket) {
      let Some(mut session) = self
         .connection
         .session
         .take_if(|s| s.ticket == ticket && s.state == ConnectionState::Connected)
      else {
         return;
      };

      // The reader is the one reporting; it has already finished.
      session.reader.take();
      if let Some(link) = session.link.take() {
         self.close_detached(link);
      }
      self.finish_teardown(session, true);
   }

   /// Forces the session to `Disconnected` right away; used when the radio
   /// goes down. Any link is closed in the background.
   pub(super) fn force_disconnect(&mut self) {
      let Some(mut session) = self.connection.session.take() else {
         return;
      };

      let was_established = session.state != ConnectionState::Connecting;
      if let Some(link) = session.link.take() {
         self.close_detached(link);
      }
      for waiter in session.disconnect_waiters.drain(..) {
         let _ = waiter.send(Ok(()));
      }
      self.finish_teardown(session, was_established);
   }

   /// Final step of every teardown path: clears the session, resolves a
   /// pending connect with `Cancelled` and publishes the new state.
   fn finish_teardown(&mut self, mut session: ActiveSession<D::Connection>, was_established: bool) {
      if let Some(reply) = session.connect_reply.take() {
         let _ = reply.send(Err(SessionError::Cancelled));
      }

      let device = session.device.clone();
      drop(session);

      if was_established {
         let device = self
            .registry
            .get(device.address)
            .cloned()
            .unwrap_or(device)
            .connected(false);
         info!("Disconnected from {}", device.address);
         self.upsert_device(device.clone());
         self.emit(SessionEvent::DeviceDisconnected(device.clone()));
         self.emit(SessionEvent::SessionChanged(disconnected(device)));
      } else {
         debug!("Connection attempt to {} abandoned", device.address);
         self.emit(SessionEvent::SessionChanged(disconnected(device)));
      }
   }

   pub(super) fn write(&self, data: Message, reply: Reply<()>) {
      let Some(link) = self
         .connection
         .session
         .as_ref()
         .filter(|s| s.state == ConnectionState::Connected)
         .and_then(|s| s.link.clone())
      else {
         self.reply("write", reply, Err(SessionError::NotConnected));
         return;
      };

      let event_tx = self.event_tx.clone();
      tokio::spawn(async move {
         let result = link.write(&data).await.map_err(SessionError::Connection);
         if let Err(e) = &result {
            warn!("write failed: {e}");
            event_tx.emit(SessionEvent::OperationFailed {
               operation: "write",
               message: e.to_smolstr(),
            });
         }
         let _ = reply.send(result);
      });
   }
}
