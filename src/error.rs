//! Error types for the Bluetooth Classic session manager.
//!
//! `DriverError` is what a radio driver reports; `SessionError` is what the
//! session manager hands back to its callers, wrapping driver failures with
//! the operation they belong to.

use bluer::Address;
use thiserror::Error;

/// Failure reported by a radio driver implementation.
#[derive(Error, Debug)]
pub enum DriverError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Radio is powered off")]
   PoweredOff,

   #[error("Request timeout")]
   Timeout,

   #[error("Link closed")]
   Closed,

   #[error("Radio unavailable: {0}")]
   Unavailable(String),
}

impl DriverError {
   /// Copy of this error for fanning out to several waiters. Wrapped stack
   /// errors keep only their message.
   pub fn replicate(&self) -> Self {
      match self {
         Self::PoweredOff => Self::PoweredOff,
         Self::Timeout => Self::Timeout,
         Self::Closed => Self::Closed,
         Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
         other => Self::Unavailable(other.to_string()),
      }
   }
}

/// Convenience type alias for driver results.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Main error type for the session manager.
#[derive(Error, Debug)]
pub enum SessionError {
   #[error("Radio error: {0}")]
   Radio(DriverError),

   #[error("Discovery error: {0}")]
   Discovery(DriverError),

   #[error("Connection error: {0}")]
   Connection(DriverError),

   #[error("Operation already active")]
   AlreadyActive,

   #[error("A session is already established")]
   AlreadyConnected,

   #[error("Operation cancelled")]
   Cancelled,

   #[error("Radio busy with a connection attempt")]
   RadioBusy,

   #[error("No connected session")]
   NotConnected,

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Delimiter too long: {0} bytes")]
   InvalidDelimiter(usize),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),
}

impl SessionError {
   /// Returns true when the error is the cancellation outcome of a pending
   /// operation rather than a failure.
   pub const fn is_cancelled(&self) -> bool {
      matches!(self, Self::Cancelled)
   }
}

/// Convenience type alias for Results with `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;
