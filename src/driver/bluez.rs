//! BlueZ radio driver.
//!
//! Talks to `bluetoothd` through `bluer`: adapter power and discovery over
//! D-Bus, links as RFCOMM streams on a fixed channel.

use std::{sync::Arc, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Session,
   rfcomm::{
      Listener, SocketAddr, Stream,
      stream::{OwnedReadHalf, OwnedWriteHalf},
   },
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   io::{AsyncReadExt, AsyncWriteExt},
   select,
   sync::{Mutex as AsyncMutex, mpsc, oneshot},
   task::JoinHandle,
   time,
};

use super::{
   RadioCallback, RadioConnection, RadioDriver, RadioListeners, RadioTransition, Subscription,
   framing::FrameSplitter,
};
use crate::{
   config::Config,
   device::{ConnectOptions, Device, Message},
   error::{DriverError, DriverResult},
};

/// Size of a single socket read
const READ_BUFFER_SIZE: usize = 1024;
/// Inbound messages buffered per link
const INBOUND_QUEUE: usize = 128;

/// Radio driver backed by a BlueZ adapter.
pub struct BluezDriver {
   _session: Session,
   adapter: Adapter,
   listeners: Arc<RadioListeners>,
   monitor: JoinHandle<()>,
   channel: u8,
   discovery_window: Duration,
   connect_timeout: Duration,
   config: Config,
   discovery_cancel: Mutex<Option<oneshot::Sender<()>>>,
   accept_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl BluezDriver {
   pub async fn new(config: &Config) -> DriverResult<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using adapter {}", adapter.name());

      let listeners = RadioListeners::new();
      let monitor = Self::start_power_monitor(&adapter, listeners.clone()).await?;

      Ok(Self {
         _session: session,
         adapter,
         listeners,
         monitor,
         channel: config.rfcomm_channel,
         discovery_window: config.discovery_window(),
         connect_timeout: config.connect_timeout(),
         config: config.clone(),
         discovery_cancel: Mutex::new(None),
         accept_cancel: Mutex::new(None),
      })
   }

   async fn start_power_monitor(
      adapter: &Adapter,
      listeners: Arc<RadioListeners>,
   ) -> DriverResult<JoinHandle<()>> {
      let mut events = adapter.events().await?;
      let name = adapter.name().to_string();
      Ok(tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
               info!("Adapter {name} powered: {powered}");
               listeners.notify(if powered {
                  RadioTransition::Enabled
               } else {
                  RadioTransition::Disabled
               });
            }
         }
         warn!("Event stream of adapter {name} ended");
      }))
   }

   /// Builds the `Device` for `address`, preferring the configured name.
   async fn describe(&self, address: Address) -> Device {
      if let Some(name) = self.config.known_name(&address.to_string()) {
         return Device::new(address, name);
      }
      let name = match self.adapter.device(address) {
         Ok(device) => device.name().await.ok().flatten(),
         Err(_) => None,
      };
      match name {
         Some(name) => Device::new(address, name),
         None => Device::unnamed(address),
      }
   }
}

impl Drop for BluezDriver {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

impl RadioDriver for BluezDriver {
   type Connection = RfcommLink;

   async fn is_enabled(&self) -> DriverResult<bool> {
      Ok(self.adapter.is_powered().await?)
   }

   fn on_enabled(&self, callback: RadioCallback) -> Subscription {
      self.listeners.subscribe(RadioTransition::Enabled, callback)
   }

   fn on_disabled(&self, callback: RadioCallback) -> Subscription {
      self.listeners.subscribe(RadioTransition::Disabled, callback)
   }

   async fn bonded_devices(&self) -> DriverResult<Vec<Device>> {
      let mut devices = Vec::new();
      for address in self.adapter.device_addresses().await? {
         let device = self.adapter.device(address)?;
         if !device.is_paired().await? {
            continue;
         }
         let connected = device.is_connected().await.unwrap_or(false);
         devices.push(self.describe(address).await.bonded(true).connected(connected));
      }
      debug!("Adapter reports {} paired devices", devices.len());
      Ok(devices)
   }

   async fn start_discovery(&self) -> DriverResult<Vec<Device>> {
      let (cancel_tx, mut cancel_rx) = oneshot::channel();
      *self.discovery_cancel.lock() = Some(cancel_tx);

      let events = self.adapter.discover_devices().await?;
      pin_mut!(events);
      let window = time::sleep(self.discovery_window);
      tokio::pin!(window);

      let mut seen = Vec::new();
      loop {
         select! {
            () = &mut window => break,
            _ = &mut cancel_rx => {
               debug!("Discovery window closed early");
               break;
            }
            event = events.next() => match event {
               Some(AdapterEvent::DeviceAdded(address)) => {
                  if !seen.contains(&address) {
                     debug!("Discovered {address}");
                     seen.push(address);
                  }
               },
               Some(_) => {},
               None => break,
            },
         }
      }
      self.discovery_cancel.lock().take();

      let mut found = Vec::with_capacity(seen.len());
      for address in seen {
         let paired = match self.adapter.device(address) {
            Ok(device) => device.is_paired().await.unwrap_or(false),
            Err(_) => false,
         };
         if !paired {
            found.push(self.describe(address).await);
         }
      }
      Ok(found)
   }

   async fn cancel_discovery(&self) -> DriverResult<bool> {
      Ok(self
         .discovery_cancel
         .lock()
         .take()
         .is_some_and(|tx| tx.send(()).is_ok()))
   }

   async fn connect(&self, address: Address, options: &ConnectOptions) -> DriverResult<RfcommLink> {
      debug!("Opening RFCOMM channel {} to {address}", self.channel);
      let target = SocketAddr::new(address, self.channel);
      let stream = time::timeout(self.connect_timeout, Stream::connect(target))
         .await
         .map_err(|_| DriverError::Timeout)??;
      let device = self.describe(address).await;
      Ok(RfcommLink::new(device, stream, FrameSplitter::new(options.delimiter.clone())))
   }

   async fn accept(&self, options: &ConnectOptions) -> DriverResult<RfcommLink> {
      let listener = Listener::bind(SocketAddr::new(Address::any(), self.channel)).await?;
      debug!("Listening on RFCOMM channel {}", self.channel);

      let (cancel_tx, cancel_rx) = oneshot::channel();
      *self.accept_cancel.lock() = Some(cancel_tx);
      let accepted = select! {
         accepted = listener.accept() => accepted.map_err(DriverError::from),
         _ = cancel_rx => Err(DriverError::Closed),
      };
      self.accept_cancel.lock().take();

      let (stream, peer) = accepted?;
      let device = self.describe(peer.addr).await;
      Ok(RfcommLink::new(device, stream, FrameSplitter::new(options.delimiter.clone())))
   }

   async fn cancel_accept(&self) -> DriverResult<bool> {
      Ok(self
         .accept_cancel
         .lock()
         .take()
         .is_some_and(|tx| tx.send(()).is_ok()))
   }
}

/// An open RFCOMM stream, split into a framed reader task and a writer.
pub struct RfcommLink {
   device: Device,
   writer: AsyncMutex<Option<OwnedWriteHalf>>,
   inbound: AsyncMutex<mpsc::Receiver<DriverResult<Message>>>,
   reader: JoinHandle<()>,
}

impl RfcommLink {
   fn new(device: Device, stream: Stream, splitter: FrameSplitter) -> Self {
      let (read_half, write_half) = stream.into_split();
      let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
      let reader = tokio::spawn(read_loop(device.address, read_half, splitter, tx));
      Self {
         device,
         writer: AsyncMutex::new(Some(write_half)),
         inbound: AsyncMutex::new(rx),
         reader,
      }
   }
}

async fn read_loop(
   address: Address,
   mut read_half: OwnedReadHalf,
   mut splitter: FrameSplitter,
   tx: mpsc::Sender<DriverResult<Message>>,
) {
   let mut buf = [0u8; READ_BUFFER_SIZE];
   loop {
      match read_half.read(&mut buf).await {
         Ok(0) => {
            if !splitter.pending().is_empty() {
               debug!(
                  "Dropping {} undelimited bytes from {address}",
                  splitter.pending().len()
               );
            }
            return;
         },
         Ok(n) => {
            debug!("← {address}: {}", hex::encode(&buf[..n]));
            for message in splitter.push(&buf[..n]) {
               if tx.send(Ok(message)).await.is_err() {
                  return;
               }
            }
         },
         Err(e) => {
            warn!("Read from {address} failed: {e}");
            let _ = tx.send(Err(e.into())).await;
            return;
         },
      }
   }
}

impl RadioConnection for RfcommLink {
   fn device(&self) -> Device {
      self.device.clone()
   }

   async fn recv(&self) -> Option<DriverResult<Message>> {
      self.inbound.lock().await.recv().await
   }

   async fn write(&self, data: &[u8]) -> DriverResult<()> {
      let mut writer = self.writer.lock().await;
      let writer = writer.as_mut().ok_or(DriverError::Closed)?;
      debug!("→ {}: {}", self.device.address, hex::encode(data));
      writer.write_all(data).await?;
      Ok(())
   }

   async fn disconnect(&self) -> DriverResult<()> {
      self.reader.abort();
      let Some(mut writer) = self.writer.lock().await.take() else {
         return Ok(());
      };
      debug!("Closing RFCOMM link to {}", self.device.address);
      writer.shutdown().await?;
      Ok(())
   }
}

impl Drop for RfcommLink {
   fn drop(&mut self) {
      self.reader.abort();
   }
}
