//! Event handling for session manager state changes.
//!
//! Subscribers (the D-Bus front end, tests) receive registry, radio, discovery,
//! accept and connection updates through an `EventBus`.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::device::{ConnectionSession, Device, Message};

/// Events that can be emitted by the session manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
   RadioStateChanged { enabled: bool },
   RegistryChanged(Vec<Device>),
   DiscoveryStateChanged { active: bool },
   AcceptStateChanged { active: bool },
   SessionChanged(ConnectionSession),
   DeviceConnected(Device),
   DeviceDisconnected(Device),
   DeviceSelected(Option<Device>),
   MessageReceived { address: Address, data: Message },
   /// Transient, user-visible failure of a caller-initiated operation.
   OperationFailed {
      operation: &'static str,
      message: SmolStr,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: SessionEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
