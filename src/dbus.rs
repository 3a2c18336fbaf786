use std::str::FromStr;

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   device::{ConnectOptions, Delimiter, Device},
   error::SessionError,
   event::SessionEvent,
   session::SessionManager,
};

pub const BUS_NAME: &str = "org.btclassic";
pub const OBJECT_PATH: &str = "/org/btclassic/manager";

pub struct SessionService {
   manager: SessionManager,
   default_options: ConnectOptions,
}

impl SessionService {
   pub const fn new(manager: SessionManager, default_options: ConnectOptions) -> Self {
      Self {
         manager,
         default_options,
      }
   }

   /// An empty delimiter argument selects the configured default.
   fn options(&self, delimiter: &str) -> zbus::fdo::Result<ConnectOptions> {
      if delimiter.is_empty() {
         return Ok(self.default_options.clone());
      }
      let delimiter = Delimiter::new(delimiter.as_bytes())
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      Ok(ConnectOptions::new(delimiter))
   }
}

/// Bus properties mirrored from the manager state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateProperty {
   RadioEnabled,
   Discovering,
   Accepting,
}

impl StateProperty {
   /// The property whose value changes with `event`, if any.
   pub fn affected_by(event: &SessionEvent) -> Option<Self> {
      match event {
         SessionEvent::RadioStateChanged { .. } => Some(Self::RadioEnabled),
         SessionEvent::DiscoveryStateChanged { .. } => Some(Self::Discovering),
         SessionEvent::AcceptStateChanged { .. } => Some(Self::Accepting),
         _ => None,
      }
   }
}

impl SessionService {
   /// Emits `PropertiesChanged` for `property` with its current value.
   pub async fn property_changed(
      &self,
      property: StateProperty,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match property {
         StateProperty::RadioEnabled => self.radio_enabled_changed(emitter).await,
         StateProperty::Discovering => self.discovering_changed(emitter).await,
         StateProperty::Accepting => self.accepting_changed(emitter).await,
      }
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: SessionError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

fn devices_json(devices: &[Device]) -> String {
   serde_json::Value::Array(devices.iter().map(Device::to_json).collect()).to_string()
}

#[interface(name = "org.btclassic.Manager")]
impl SessionService {
   async fn get_devices(&self) -> String {
      devices_json(&self.manager.devices().await)
   }

   async fn get_state(&self) -> String {
      self.manager.state().await.to_json().to_string()
   }

   async fn load_bonded(&self) -> zbus::fdo::Result<String> {
      let bonded = self.manager.load_bonded().await.map_err(failed)?;
      Ok(devices_json(&bonded))
   }

   async fn start_discovery(&self) -> zbus::fdo::Result<String> {
      let found = self.manager.start_discovery().await.map_err(failed)?;
      Ok(devices_json(&found))
   }

   async fn cancel_discovery(&self) -> zbus::fdo::Result<bool> {
      self.manager.cancel_discovery().await.map_err(failed)
   }

   async fn connect(&self, address: String, delimiter: String) -> zbus::fdo::Result<String> {
      let address = parse_address(&address)?;
      let options = self.options(&delimiter)?;
      let device = self
         .manager
         .devices()
         .await
         .into_iter()
         .find(|d| d.address == address)
         .unwrap_or_else(|| Device::unnamed(address));

      info!("D-Bus connect request for {address}");
      let session = self
         .manager
         .connect(device, options)
         .await
         .map_err(failed)?;
      Ok(session.to_json().to_string())
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.manager.disconnect().await.map_err(failed)?;
      Ok(true)
   }

   async fn accept(&self, delimiter: String) -> zbus::fdo::Result<String> {
      let options = self.options(&delimiter)?;
      let device = self.manager.accept(options).await.map_err(failed)?;
      Ok(device.to_json().to_string())
   }

   async fn cancel_accept(&self) -> zbus::fdo::Result<bool> {
      self.manager.cancel_accept().await.map_err(failed)
   }

   /// Empty address clears the selection.
   async fn select_device(&self, address: String) -> zbus::fdo::Result<String> {
      let address = if address.is_empty() {
         None
      } else {
         Some(parse_address(&address)?)
      };
      let selected = self
         .manager
         .select_device(address)
         .await
         .map_err(failed)?;
      Ok(selected
         .as_ref()
         .map_or(serde_json::Value::Null, Device::to_json)
         .to_string())
   }

   async fn write(&self, data: String) -> zbus::fdo::Result<bool> {
      let bytes = hex::decode(data.replace(' ', ""))
         .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("Invalid hex: {e}")))?;
      self.manager.write(&bytes).await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn radio_state_changed(emitter: &SignalEmitter<'_>, enabled: bool)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn registry_changed(emitter: &SignalEmitter<'_>, devices: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_state_changed(
      emitter: &SignalEmitter<'_>,
      active: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn accept_state_changed(emitter: &SignalEmitter<'_>, active: bool)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_changed(emitter: &SignalEmitter<'_>, session: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_selected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn message_received(
      emitter: &SignalEmitter<'_>,
      address: &str,
      data: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn operation_failed(
      emitter: &SignalEmitter<'_>,
      operation: &str,
      message: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn radio_enabled(&self) -> bool {
      self.manager.state().await.radio_enabled
   }

   #[zbus(property)]
   async fn discovering(&self) -> bool {
      self.manager.state().await.discovering
   }

   #[zbus(property)]
   async fn accepting(&self) -> bool {
      self.manager.state().await.accepting
   }
}
