//! Scripted radio driver for tests.
//!
//! Blocking operations (scan, connect, accept) wait until the test pushes an
//! outcome for them; everything else answers from configurable state unless
//! the test holds it, in which case it waits for a released outcome too.

use std::sync::{
   Arc,
   atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bluer::Address;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use super::{RadioCallback, RadioConnection, RadioDriver, RadioListeners, RadioTransition, Subscription};
use crate::{
   device::{ConnectOptions, Device, Message},
   error::{DriverError, DriverResult},
   event::{EventBus, SessionEvent},
};

/// Queue of outcomes released one per driver call.
struct Script<T> {
   tx: mpsc::UnboundedSender<T>,
   rx: AsyncMutex<mpsc::UnboundedReceiver<T>>,
   delivered: AtomicUsize,
}

impl<T> Script<T> {
   fn new() -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      Self {
         tx,
         rx: AsyncMutex::new(rx),
         delivered: AtomicUsize::new(0),
      }
   }

   fn push(&self, value: T) {
      let _ = self.tx.send(value);
   }

   async fn next(&self) -> Option<T> {
      let value = self.rx.lock().await.recv().await;
      self.delivered.fetch_add(1, Ordering::SeqCst);
      value
   }

   fn delivered(&self) -> usize {
      self.delivered.load(Ordering::SeqCst)
   }
}

pub struct MockDriver {
   listeners: Arc<RadioListeners>,
   enabled: Mutex<Option<bool>>,
   bonded: Mutex<Option<Vec<Device>>>,
   hold_bonded: AtomicBool,
   bonded_loads: Script<DriverResult<Vec<Device>>>,
   scans: Script<DriverResult<Vec<Device>>>,
   connects: Script<DriverResult<MockLink>>,
   accepts: Script<DriverResult<MockLink>>,
   cancel_discovery_reply: Mutex<Option<bool>>,
   cancel_accept_reply: Mutex<Option<bool>>,
   hold_cancels: AtomicBool,
   discovery_cancels: Script<DriverResult<bool>>,
   accept_cancels: Script<DriverResult<bool>>,
   pub scan_calls: AtomicUsize,
   pub connect_calls: AtomicUsize,
   pub cancel_discovery_calls: AtomicUsize,
   pub cancel_accept_calls: AtomicUsize,
}

impl MockDriver {
   pub fn new(enabled: bool) -> Arc<Self> {
      Arc::new(Self {
         listeners: RadioListeners::new(),
         enabled: Mutex::new(Some(enabled)),
         bonded: Mutex::new(Some(Vec::new())),
         hold_bonded: AtomicBool::new(false),
         bonded_loads: Script::new(),
         scans: Script::new(),
         connects: Script::new(),
         accepts: Script::new(),
         cancel_discovery_reply: Mutex::new(Some(true)),
         cancel_accept_reply: Mutex::new(Some(true)),
         hold_cancels: AtomicBool::new(false),
         discovery_cancels: Script::new(),
         accept_cancels: Script::new(),
         scan_calls: AtomicUsize::new(0),
         connect_calls: AtomicUsize::new(0),
         cancel_discovery_calls: AtomicUsize::new(0),
         cancel_accept_calls: AtomicUsize::new(0),
      })
   }

   /// `None` makes `is_enabled` fail.
   pub fn set_enabled(&self, enabled: Option<bool>) {
      *self.enabled.lock() = enabled;
   }

   /// Flips the radio and notifies subscribers.
   pub fn power(&self, enabled: bool) {
      *self.enabled.lock() = Some(enabled);
      self.listeners.notify(if enabled {
         RadioTransition::Enabled
      } else {
         RadioTransition::Disabled
      });
   }

   /// `None` makes `bonded_devices` fail.
   pub fn set_bonded(&self, devices: Option<Vec<Device>>) {
      *self.bonded.lock() = devices;
   }

   /// Makes `bonded_devices` wait for `release_bonded`.
   pub fn hold_bonded(&self) {
      self.hold_bonded.store(true, Ordering::SeqCst);
   }

   pub fn release_bonded(&self, result: DriverResult<Vec<Device>>) {
      self.bonded_loads.push(result);
   }

   pub fn push_scan(&self, result: DriverResult<Vec<Device>>) {
      self.scans.push(result);
   }

   /// Scan outcomes the driver has handed back so far.
   pub fn scans_delivered(&self) -> usize {
      self.scans.delivered()
   }

   pub fn push_connect(&self, result: DriverResult<MockLink>) {
      self.connects.push(result);
   }

   pub fn push_accept(&self, result: DriverResult<MockLink>) {
      self.accepts.push(result);
   }

   /// Accept outcomes the driver has handed back so far.
   pub fn accepts_delivered(&self) -> usize {
      self.accepts.delivered()
   }

   /// `None` makes `cancel_discovery` fail.
   pub fn set_cancel_discovery(&self, reply: Option<bool>) {
      *self.cancel_discovery_reply.lock() = reply;
   }

   /// `None` makes `cancel_accept` fail.
   pub fn set_cancel_accept(&self, reply: Option<bool>) {
      *self.cancel_accept_reply.lock() = reply;
   }

   /// Makes both cancel calls wait for a released verdict instead of
   /// answering from `set_cancel_*`.
   pub fn hold_cancels(&self) {
      self.hold_cancels.store(true, Ordering::SeqCst);
   }

   pub fn release_cancel_discovery(&self, verdict: DriverResult<bool>) {
      self.discovery_cancels.push(verdict);
   }

   pub fn release_cancel_accept(&self, verdict: DriverResult<bool>) {
      self.accept_cancels.push(verdict);
   }

   pub fn subscribers(&self) -> usize {
      self.listeners.len()
   }
}

fn scripted<T>(value: Option<T>) -> DriverResult<T> {
   value.ok_or_else(|| DriverError::Unavailable("scripted failure".into()))
}

impl RadioDriver for MockDriver {
   type Connection = MockLink;

   async fn is_enabled(&self) -> DriverResult<bool> {
      scripted(*self.enabled.lock())
   }

   fn on_enabled(&self, callback: RadioCallback) -> Subscription {
      self.listeners.subscribe(RadioTransition::Enabled, callback)
   }

   fn on_disabled(&self, callback: RadioCallback) -> Subscription {
      self.listeners.subscribe(RadioTransition::Disabled, callback)
   }

   async fn bonded_devices(&self) -> DriverResult<Vec<Device>> {
      if self.hold_bonded.load(Ordering::SeqCst) {
         return self.bonded_loads.next().await.unwrap_or(Err(DriverError::Closed));
      }
      scripted(self.bonded.lock().clone())
   }

   async fn start_discovery(&self) -> DriverResult<Vec<Device>> {
      self.scan_calls.fetch_add(1, Ordering::SeqCst);
      self.scans.next().await.unwrap_or(Err(DriverError::Closed))
   }

   async fn cancel_discovery(&self) -> DriverResult<bool> {
      self.cancel_discovery_calls.fetch_add(1, Ordering::SeqCst);
      if self.hold_cancels.load(Ordering::SeqCst) {
         return self.discovery_cancels.next().await.unwrap_or(Err(DriverError::Closed));
      }
      scripted(*self.cancel_discovery_reply.lock())
   }

   async fn connect(&self, _address: Address, _options: &ConnectOptions) -> DriverResult<MockLink> {
      self.connect_calls.fetch_add(1, Ordering::SeqCst);
      self.connects.next().await.unwrap_or(Err(DriverError::Closed))
   }

   async fn accept(&self, _options: &ConnectOptions) -> DriverResult<MockLink> {
      self.accepts.next().await.unwrap_or(Err(DriverError::Closed))
   }

   async fn cancel_accept(&self) -> DriverResult<bool> {
      self.cancel_accept_calls.fetch_add(1, Ordering::SeqCst);
      if self.hold_cancels.load(Ordering::SeqCst) {
         return self.accept_cancels.next().await.unwrap_or(Err(DriverError::Closed));
      }
      scripted(*self.cancel_accept_reply.lock())
   }
}

/// Observable side of a `MockLink`.
#[derive(Default)]
pub struct LinkState {
   pub written: Mutex<Vec<u8>>,
   pub disconnects: AtomicUsize,
   pub fail_disconnect: AtomicBool,
   hold_close: AtomicBool,
   close_released: Notify,
}

pub struct MockLink {
   device: Device,
   inbound: AsyncMutex<mpsc::UnboundedReceiver<DriverResult<Message>>>,
   state: Arc<LinkState>,
}

/// Test-side end of a `MockLink`; dropping it closes the link from the peer.
pub struct LinkHandle {
   inbound: mpsc::UnboundedSender<DriverResult<Message>>,
   pub state: Arc<LinkState>,
}

impl MockLink {
   pub fn new(device: Device) -> (Self, LinkHandle) {
      let (tx, rx) = mpsc::unbounded_channel();
      let state = Arc::new(LinkState::default());
      (
         Self {
            device,
            inbound: AsyncMutex::new(rx),
            state: state.clone(),
         },
         LinkHandle { inbound: tx, state },
      )
   }
}

impl LinkHandle {
   pub fn send(&self, data: &[u8]) {
      let _ = self.inbound.send(Ok(Message::from_slice(data)));
   }

   pub fn fail(&self) {
      let _ = self.inbound.send(Err(DriverError::Closed));
   }

   pub fn disconnects(&self) -> usize {
      self.state.disconnects.load(Ordering::SeqCst)
   }

   /// Makes the next close wait for `release_close`.
   pub fn hold_close(&self) {
      self.state.hold_close.store(true, Ordering::SeqCst);
   }

   pub fn release_close(&self) {
      self.state.close_released.notify_one();
   }
}

impl RadioConnection for MockLink {
   fn device(&self) -> Device {
      self.device.clone()
   }

   async fn recv(&self) -> Option<DriverResult<Message>> {
      self.inbound.lock().await.recv().await
   }

   async fn write(&self, data: &[u8]) -> DriverResult<()> {
      self.state.written.lock().extend_from_slice(data);
      Ok(())
   }

   async fn disconnect(&self) -> DriverResult<()> {
      self.state.disconnects.fetch_add(1, Ordering::SeqCst);
      if self.state.hold_close.swap(false, Ordering::SeqCst) {
         self.state.close_released.notified().await;
      }
      if self.state.fail_disconnect.load(Ordering::SeqCst) {
         return Err(DriverError::Unavailable("close failed".into()));
      }
      Ok(())
   }
}

/// Event bus that keeps everything it is given.
#[derive(Default)]
pub struct Recorder {
   events: Mutex<Vec<SessionEvent>>,
}

impl Recorder {
   pub fn new() -> Arc<Self> {
      Arc::default()
   }

   pub fn events(&self) -> Vec<SessionEvent> {
      self.events.lock().clone()
   }

   pub fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
      self.events.lock().iter().filter(|&e| pred(e)).count()
   }
}

impl EventBus for Recorder {
   fn emit(&self, event: SessionEvent) {
      self.events.lock().push(event);
   }
}
