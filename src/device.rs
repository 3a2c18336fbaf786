//! Device and session snapshots shared by the session manager and drivers.

use std::time::{SystemTime, UNIX_EPOCH};

use bluer::Address;
use serde_json::json;
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};

use crate::error::{Result, SessionError};

/// Longest delimiter accepted for framing an inbound byte stream.
pub const MAX_DELIMITER_LEN: usize = 8;

/// One delimited frame read from a link, delimiter stripped.
pub type Message = SmallVec<[u8; 64]>;

/// Immutable snapshot of a Bluetooth Classic device.
///
/// Identity is the address; the registry replaces whole entries instead of
/// mutating fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
   pub address: Address,
   pub name: SmolStr,
   pub bonded: bool,
   pub connected: bool,
}

impl Device {
   pub fn new(address: Address, name: impl Into<SmolStr>) -> Self {
      Self {
         address,
         name: name.into(),
         bonded: false,
         connected: false,
      }
   }

   /// Placeholder for a peer that reported no name.
   pub fn unnamed(address: Address) -> Self {
      Self::new(address, address.to_smolstr())
   }

   #[must_use]
   pub fn bonded(self, bonded: bool) -> Self {
      Self { bonded, ..self }
   }

   #[must_use]
   pub fn connected(self, connected: bool) -> Self {
      Self { connected, ..self }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "address": self.address.to_string(),
          "name": self.name.as_str(),
          "bonded": self.bonded,
          "connected": self.connected,
      })
   }
}

/// Lifecycle of the single connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   Connecting,
   Connected,
   Disconnecting,
   Disconnected,
}

/// Snapshot of the active (outbound or accepted) connection session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
   pub device: Device,
   pub state: ConnectionState,
   pub established_at: Option<SystemTime>,
}

impl ConnectionSession {
   pub fn to_json(&self) -> serde_json::Value {
      let established_at = self
         .established_at
         .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
         .map(|d| d.as_secs());
      json!({
          "device": self.device.to_json(),
          "state": <&'static str>::from(self.state),
          "established_at": established_at,
      })
   }
}

/// Byte sequence splitting an inbound stream into messages.
///
/// An empty delimiter delivers every chunk read from the link as a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delimiter(heapless::Vec<u8, MAX_DELIMITER_LEN>);

impl Delimiter {
   pub fn new(bytes: &[u8]) -> Result<Self> {
      heapless::Vec::from_slice(bytes)
         .map(Self)
         .map_err(|()| SessionError::InvalidDelimiter(bytes.len()))
   }

   pub fn as_bytes(&self) -> &[u8] {
      &self.0
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }
}

/// Options for outbound connects and inbound accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
   pub delimiter: Delimiter,
}

impl ConnectOptions {
   pub const fn new(delimiter: Delimiter) -> Self {
      Self { delimiter }
   }
}

impl Default for ConnectOptions {
   fn default() -> Self {
      Self {
         delimiter: Delimiter(heapless::Vec::from_slice(b"\r").unwrap_or_default()),
      }
   }
}
