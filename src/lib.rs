//! Bluetooth Classic session manager.
//!
//! Keeps a registry of bonded and discovered devices, runs exclusive
//! discovery scans, and owns the single outbound or accepted serial session
//! to a remote device. Radio access goes through the `RadioDriver` trait;
//! `driver::bluez` implements it on top of BlueZ.

pub mod config;
pub mod dbus;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod session;

pub use device::{ConnectOptions, ConnectionSession, ConnectionState, Delimiter, Device, Message};
pub use error::{DriverError, Result, SessionError};
pub use event::{EventBus, EventSender, SessionEvent};
pub use session::{DeviceRegistry, ManagerState, SessionManager};
