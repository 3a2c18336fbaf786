//! Bluetooth Classic session manager daemon.
//!
//! Exposes the session manager on the session bus: device registry, discovery,
//! outbound and accepted RFCOMM sessions, and raw message exchange.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use btclassic::{
   SessionError, SessionEvent, SessionManager,
   config::Config,
   dbus::{BUS_NAME, OBJECT_PATH, SessionService, SessionServiceSignals, StateProperty},
   driver::bluez::BluezDriver,
   error::Result,
   event::EventBus,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btclassicd...");

   let config = Config::load()?;
   info!(
      "Loaded configuration: channel {}, {} known devices",
      config.rfcomm_channel,
      config.known_devices.len()
   );
   let default_options = config.connect_options()?;

   let event_bus = EventProcessor::new();

   let driver = BluezDriver::new(&config)
      .await
      .map_err(SessionError::Radio)?;
   let manager = SessionManager::new(Arc::new(driver), event_bus.clone()).await;

   if config.load_bonded_on_startup {
      match manager.load_bonded().await {
         Ok(bonded) => info!("Loaded {} bonded devices", bonded.len()),
         Err(e) => warn!("Failed to load bonded devices: {e}"),
      }
   }

   let service = SessionService::new(manager, default_options);

   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btclassicd D-Bus service started at {BUS_NAME}");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down btclassicd...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<SessionEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<SessionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<SessionService>, event: SessionEvent) -> Result<()> {
      let property = StateProperty::affected_by(&event);
      match event {
         SessionEvent::RadioStateChanged { enabled } => {
            iface.radio_state_changed(enabled).await?;
         },
         SessionEvent::RegistryChanged(devices) => {
            let json: Vec<_> = devices.iter().map(|d| d.to_json()).collect();
            iface
               .registry_changed(&serde_json::Value::Array(json).to_string())
               .await?;
         },
         SessionEvent::DiscoveryStateChanged { active } => {
            iface.discovery_state_changed(active).await?;
         },
         SessionEvent::AcceptStateChanged { active } => {
            iface.accept_state_changed(active).await?;
         },
         SessionEvent::SessionChanged(session) => {
            iface.session_changed(&session.to_json().to_string()).await?;
         },
         SessionEvent::DeviceConnected(device) => {
            iface.device_connected(&device.address.to_string()).await?;
         },
         SessionEvent::DeviceDisconnected(device) => {
            iface
               .device_disconnected(&device.address.to_string())
               .await?;
         },
         SessionEvent::DeviceSelected(device) => {
            let address = device.map(|d| d.address.to_string()).unwrap_or_default();
            iface.device_selected(&address).await?;
         },
         SessionEvent::MessageReceived { address, data } => {
            iface
               .message_received(&address.to_string(), &hex::encode(&data))
               .await?;
         },
         SessionEvent::OperationFailed { operation, message } => {
            iface.operation_failed(operation, &message).await?;
         },
      }
      if let Some(property) = property {
         iface
            .get()
            .await
            .property_changed(property, iface.signal_emitter())
            .await?;
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SessionService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: SessionEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
