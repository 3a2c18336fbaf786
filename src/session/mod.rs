//! Bluetooth Classic session manager.
//!
//! `SessionManager` is a cheap handle; all state lives in a single actor task
//! that owns the device registry and the discovery, connection, accept and
//! radio controllers. Long-running driver calls run in spawned tasks and
//! report back through a loopback channel tagged with a `Ticket`, so the actor
//! keeps serving cancel and disconnect requests while they are pending, and
//! results of superseded operations are recognised and dropped.

use std::{future::Future, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use serde_json::json;
use smol_str::ToSmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::{
   device::{ConnectOptions, ConnectionSession, Device, Message},
   driver::{RadioConnection, RadioDriver},
   error::{DriverResult, Result, SessionError},
   event::{EventSender, SessionEvent},
};

mod accept;
mod connection;
mod discovery;
mod pending;
mod radio;
pub mod registry;

use accept::AcceptController;
use connection::ConnectionController;
use discovery::DiscoveryController;
use radio::RadioStateMonitor;
pub use registry::DeviceRegistry;

/// Command channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Upper bound on closing a link before teardown completes anyway
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T>>;

/// Identifies one spawned driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket(u64);

/// Point-in-time view of the manager's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerState {
   pub radio_enabled: bool,
   pub discovering: bool,
   pub accepting: bool,
   pub session: Option<ConnectionSession>,
   pub selected: Option<Device>,
}

impl ManagerState {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "radio_enabled": self.radio_enabled,
          "discovering": self.discovering,
          "accepting": self.accepting,
          "session": self.session.as_ref().map(ConnectionSession::to_json),
          "selected": self.selected.as_ref().map(Device::to_json),
      })
   }
}

// === Commands ===

enum Command {
   LoadBonded(Reply<Vec<Device>>),
   StartDiscovery(Reply<Vec<Device>>),
   CancelDiscovery(Reply<bool>),
   Connect(Device, ConnectOptions, Reply<ConnectionSession>),
   Disconnect(Reply<()>),
   Accept(ConnectOptions, Reply<Device>),
   CancelAccept(Reply<bool>),
   Write(Message, Reply<()>),
   SelectDevice(Option<Address>, Reply<Option<Device>>),
   GetDevices(oneshot::Sender<Vec<Device>>),
   GetState(oneshot::Sender<ManagerState>),
}

/// Completions reported back to the actor by spawned tasks and callbacks.
enum Loopback<C> {
   RadioChanged(bool),
   BondedLoaded(DriverResult<Vec<Device>>, Reply<Vec<Device>>),
   DiscoveryFinished(Ticket, DriverResult<Vec<Device>>),
   DiscoveryCancelled(Ticket, DriverResult<bool>),
   Connected(Ticket, DriverResult<C>),
   Disconnected(Ticket, DriverResult<()>),
   LinkClosed(Ticket),
   AcceptFinished(Ticket, DriverResult<C>),
   AcceptCancelled(Ticket, DriverResult<bool>),
}

// === Handle ===

/// Handle to the session manager.
///
/// This type is cheaply cloneable; the manager shuts down once every handle
/// is dropped.
#[derive(Clone)]
pub struct SessionManager {
   inbox: mpsc::Sender<Command>,
}

impl SessionManager {
   /// Starts the manager on top of `driver`.
   ///
   /// The initial radio state is queried before this returns.
   pub async fn new<D: RadioDriver>(driver: Arc<D>, event_tx: EventSender) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let mut actor = ManagerActor::new(driver, event_tx, command_rx);
      actor.start_monitor().await;
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| SessionError::ManagerShutdown)?;
      rx.await.map_err(|_| SessionError::ManagerShutdown)?
   }

   /// Fetches paired devices and replaces the bonded segment of the registry.
   pub async fn load_bonded(&self) -> Result<Vec<Device>> {
      self.request(Command::LoadBonded).await
   }

   /// Runs a discovery scan; resolves with the discovered segment.
   pub async fn start_discovery(&self) -> Result<Vec<Device>> {
      self.request(Command::StartDiscovery).await
   }

   pub async fn cancel_discovery(&self) -> Result<bool> {
      self.request(Command::CancelDiscovery).await
   }

   pub async fn connect(
      &self,
      device: Device,
      options: ConnectOptions,
   ) -> Result<ConnectionSession> {
      self
         .request(|tx| Command::Connect(device, options, tx))
         .await
   }

   /// Tears down the session. Resolves once it is `Disconnected`, with the
   /// driver's close error if there was one.
   pub async fn disconnect(&self) -> Result<()> {
      self.request(Command::Disconnect).await
   }

   /// Waits for one inbound connection and makes it the session.
   pub async fn accept(&self, options: ConnectOptions) -> Result<Device> {
      self.request(|tx| Command::Accept(options, tx)).await
   }

   pub async fn cancel_accept(&self) -> Result<bool> {
      self.request(Command::CancelAccept).await
   }

   /// Writes raw bytes to the connected link.
   pub async fn write(&self, data: &[u8]) -> Result<()> {
      let data = Message::from_slice(data);
      self.request(|tx| Command::Write(data, tx)).await
   }

   /// Marks a registry device as the current one, or clears the selection.
   pub async fn select_device(&self, address: Option<Address>) -> Result<Option<Device>> {
      self
         .request(|tx| Command::SelectDevice(address, tx))
         .await
   }

   pub async fn devices(&self) -> Vec<Device> {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(Command::GetDevices(tx)).await.is_err() {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn state(&self) -> ManagerState {
      let (tx, rx) = oneshot::channel();
      if self.inbox.send(Command::GetState(tx)).await.is_err() {
         return ManagerState::default();
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor<D: RadioDriver> {
   driver: Arc<D>,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::UnboundedReceiver<Loopback<D::Connection>>,
   loopback_tx: mpsc::UnboundedSender<Loopback<D::Connection>>,
   next_ticket: u64,

   // State
   registry: DeviceRegistry,
   radio: RadioStateMonitor,
   discovery: DiscoveryController,
   connection: ConnectionController<D::Connection>,
   accept: AcceptController<D::Connection>,
   selected: Option<Device>,
}

impl<D: RadioDriver> ManagerActor<D> {
   fn new(driver: Arc<D>, event_tx: EventSender, command_rx: mpsc::Receiver<Command>) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      Self {
         driver,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         next_ticket: 0,
         registry: DeviceRegistry::new(),
         radio: RadioStateMonitor::default(),
         discovery: DiscoveryController::default(),
         connection: ConnectionController::default(),
         accept: AcceptController::default(),
         selected: None,
      }
   }

   async fn run(mut self) {
      info!("Session manager running");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Session manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(msg) = self.loopback_rx.recv() => {
                 self.handle_loopback(msg);
             }
         }
      }

      self.cleanup();
   }

   fn handle_command(&mut self, cmd: Command) {
      match cmd {
         Command::LoadBonded(reply) => self.load_bonded(reply),
         Command::StartDiscovery(reply) => self.start_discovery(reply),
         Command::CancelDiscovery(reply) => self.cancel_discovery(reply),
         Command::Connect(device, options, reply) => self.connect(device, options, reply),
         Command::Disconnect(reply) => self.disconnect(reply),
         Command::Accept(options, reply) => self.accept(options, reply),
         Command::CancelAccept(reply) => self.cancel_accept(reply),
         Command::Write(data, reply) => self.write(data, reply),
         Command::SelectDevice(address, reply) => {
            let result = self.select_device(address);
            self.reply("select", reply, result);
         },
         Command::GetDevices(reply) => {
            let _ = reply.send(self.registry.devices());
         },
         Command::GetState(reply) => {
            let _ = reply.send(self.state());
         },
      }
   }

   fn handle_loopback(&mut self, msg: Loopback<D::Connection>) {
      match msg {
         Loopback::RadioChanged(enabled) => self.on_radio_changed(enabled),
         Loopback::BondedLoaded(result, reply) => self.on_bonded_loaded(result, reply),
         Loopback::DiscoveryFinished(ticket, result) => self.on_discovery_finished(ticket, result),
         Loopback::DiscoveryCancelled(ticket, verdict) => {
            self.on_discovery_cancelled(ticket, verdict);
         },
         Loopback::Connected(ticket, result) => self.on_connected(ticket, result),
         Loopback::Disconnected(ticket, result) => self.on_disconnected(ticket, result),
         Loopback::LinkClosed(ticket) => self.on_link_closed(ticket),
         Loopback::AcceptFinished(ticket, result) => self.on_accept_finished(ticket, result),
         Loopback::AcceptCancelled(ticket, verdict) => self.on_accept_cancelled(ticket, verdict),
      }
   }

   fn load_bonded(&self, reply: Reply<Vec<Device>>) {
      let driver = self.driver.clone();
      drop(self.spawn_op(async move {
         Loopback::BondedLoaded(driver.bonded_devices().await, reply)
      }));
   }

   fn on_bonded_loaded(&mut self, result: DriverResult<Vec<Device>>, reply: Reply<Vec<Device>>) {
      let result = match result {
         Ok(bonded) => {
            let connected = self.connection.connected_address();
            self.registry.replace_bonded(bonded.into_iter().map(|d| {
               let is_connected = Some(d.address) == connected;
               d.connected(is_connected)
            }));
            info!("Loaded {} bonded devices", self.registry.bonded().len());
            self.publish_registry();
            Ok(self.registry.bonded().to_vec())
         },
         Err(e) => Err(SessionError::Radio(e)),
      };
      self.reply("load_bonded", reply, result);
   }

   fn select_device(&mut self, address: Option<Address>) -> Result<Option<Device>> {
      let selected = match address {
         Some(address) => Some(
            self
               .registry
               .get(address)
               .cloned()
               .ok_or(SessionError::DeviceNotFound(address))?,
         ),
         None => None,
      };
      self.set_selected(selected.clone());
      Ok(selected)
   }

   fn set_selected(&mut self, device: Option<Device>) {
      if self.selected != device {
         debug!("Selected device: {:?}", device.as_ref().map(|d| d.address));
         self.selected = device.clone();
         self.emit(SessionEvent::DeviceSelected(device));
      }
   }

   /// Replaces a registry entry and keeps the selection snapshot in step.
   fn upsert_device(&mut self, device: Device) {
      if let Some(selected) = &mut self.selected
         && selected.address == device.address
      {
         *selected = device.clone();
      }
      self.registry.upsert(device);
      self.publish_registry();
   }

   fn state(&self) -> ManagerState {
      ManagerState {
         radio_enabled: self.radio.is_enabled(),
         discovering: self.discovery.is_active(),
         accepting: self.accept.is_active(),
         session: self.connection.snapshot(),
         selected: self.selected.clone(),
      }
   }

   fn ticket(&mut self) -> Ticket {
      self.next_ticket += 1;
      Ticket(self.next_ticket)
   }

   /// Runs a driver operation in the background and loops its completion
   /// back into the actor.
   fn spawn_op<F>(&self, op: F) -> JoinHandle<()>
   where
      F: Future<Output = Loopback<D::Connection>> + Send + 'static,
   {
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let _ = loopback.send(op.await);
      })
   }

   /// Closes a link nobody owns any more, in the background.
   fn close_detached(&self, link: Arc<D::Connection>) {
      tokio::spawn(async move {
         let address = link.device().address;
         match tokio::time::timeout(DISCONNECT_TIMEOUT, link.disconnect()).await {
            Ok(Ok(())) => debug!("Closed orphaned link to {address}"),
            Ok(Err(e)) => warn!("Failed to close link to {address}: {e}"),
            Err(_) => warn!("Closing link to {address} timed out"),
         }
      });
   }

   fn emit(&self, event: SessionEvent) {
      self.event_tx.emit(event);
   }

   fn publish_registry(&self) {
      self.emit(SessionEvent::RegistryChanged(self.registry.devices()));
   }

   /// Answers a caller, surfacing failures as a transient notification.
   fn reply<T>(&self, operation: &'static str, reply: Reply<T>, result: Result<T>) {
      if let Err(e) = &result
         && !e.is_cancelled()
      {
         warn!("{operation} failed: {e}");
         self.emit(SessionEvent::OperationFailed {
            operation,
            message: e.to_smolstr(),
         });
      }
      let _ = reply.send(result);
   }

   fn cleanup(&mut self) {
      info!("Cleaning up session manager");
      self.force_cancel_discovery();
      self.force_cancel_accept();
      self.force_disconnect();
      self.radio.release();
   }
}
