//! Radio driver capability consumed by the session manager.
//!
//! The session manager never talks to a Bluetooth stack directly; it drives a
//! `RadioDriver`. `bluez` implements it on top of BlueZ, `mock` is a scripted
//! driver for tests.

use std::{
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use bluer::Address;
use log::debug;

use crate::{
   device::{ConnectOptions, Device, Message},
   error::DriverResult,
};

pub mod bluez;
pub mod framing;
#[cfg(test)]
pub mod mock;

/// Callback invoked on a radio power transition.
pub type RadioCallback = Box<dyn Fn() + Send + Sync>;

/// Abstract Bluetooth Classic radio.
pub trait RadioDriver: Send + Sync + 'static {
   type Connection: RadioConnection;

   fn is_enabled(&self) -> impl Future<Output = DriverResult<bool>> + Send;

   fn on_enabled(&self, callback: RadioCallback) -> Subscription;

   fn on_disabled(&self, callback: RadioCallback) -> Subscription;

   fn bonded_devices(&self) -> impl Future<Output = DriverResult<Vec<Device>>> + Send;

   /// Runs one discovery scan and returns the unpaired devices it found.
   fn start_discovery(&self) -> impl Future<Output = DriverResult<Vec<Device>>> + Send;

   /// Returns true if a running scan was cancelled.
   fn cancel_discovery(&self) -> impl Future<Output = DriverResult<bool>> + Send;

   fn connect(
      &self,
      address: Address,
      options: &ConnectOptions,
   ) -> impl Future<Output = DriverResult<Self::Connection>> + Send;

   /// Waits for a single inbound connection.
   fn accept(
      &self,
      options: &ConnectOptions,
   ) -> impl Future<Output = DriverResult<Self::Connection>> + Send;

   /// Returns true if a pending accept was cancelled.
   fn cancel_accept(&self) -> impl Future<Output = DriverResult<bool>> + Send;
}

/// An established link to a remote device.
pub trait RadioConnection: Send + Sync + 'static {
   /// The remote peer.
   fn device(&self) -> Device;

   /// Next delimited message; `None` once the link has closed.
   fn recv(&self) -> impl Future<Output = Option<DriverResult<Message>>> + Send;

   fn write(&self, data: &[u8]) -> impl Future<Output = DriverResult<()>> + Send;

   /// Best-effort close of the link.
   fn disconnect(&self) -> impl Future<Output = DriverResult<()>> + Send;
}

/// Handle to a registered radio callback.
///
/// The callback stays registered until `remove` is called or the handle is
/// dropped.
#[must_use = "dropping a subscription unregisters its callback"]
pub struct Subscription {
   remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
   pub fn new(remover: impl FnOnce() + Send + Sync + 'static) -> Self {
      Self {
         remover: Some(Box::new(remover)),
      }
   }

   pub fn remove(mut self) {
      self.release();
   }

   fn release(&mut self) {
      if let Some(remover) = self.remover.take() {
         remover();
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      self.release();
   }
}

/// Radio power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RadioTransition {
   Enabled,
   Disabled,
}

struct Listener {
   id: u64,
   transition: RadioTransition,
   callback: Arc<dyn Fn() + Send + Sync>,
}

/// Table of radio callbacks shared by driver implementations.
#[derive(Default)]
pub struct RadioListeners {
   next_id: AtomicU64,
   listeners: parking_lot::Mutex<Vec<Listener>>,
}

impl RadioListeners {
   pub fn new() -> Arc<Self> {
      Arc::default()
   }

   pub fn subscribe(
      self: &Arc<Self>,
      transition: RadioTransition,
      callback: RadioCallback,
   ) -> Subscription {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      self.listeners.lock().push(Listener {
         id,
         transition,
         callback: Arc::from(callback),
      });

      let weak = Arc::downgrade(self);
      Subscription::new(move || {
         if let Some(this) = weak.upgrade() {
            this.listeners.lock().retain(|l| l.id != id);
            debug!("Removed {transition} listener {id}");
         }
      })
   }

   /// Invokes every callback registered for `transition`.
   pub fn notify(&self, transition: RadioTransition) {
      // Callbacks run outside the lock so they may unsubscribe.
      let callbacks: Vec<_> = self
         .listeners
         .lock()
         .iter()
         .filter(|l| l.transition == transition)
         .map(|l| l.callback.clone())
         .collect();
      for callback in callbacks {
         callback();
      }
   }

   pub fn len(&self) -> usize {
      self.listeners.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}
