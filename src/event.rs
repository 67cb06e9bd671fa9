use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::Device;
use crate::property::PropertyVector;

/// Everything a device can report about itself.
///
/// Property events carry a snapshot clone of the vector taken under the
/// device lock, so handlers never observe a half-applied update.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Device classified and registered.
    Attached(Arc<Device>),
    /// Device removed; its property state is gone.
    Detached(Arc<Device>),
    /// `CONNECTION` reported connected.
    Connected(Arc<Device>),
    /// `CONNECTION` reported disconnected.
    Disconnected(Arc<Device>),
    /// `CONNECTION` went to alert while disconnected.
    ConnectionFailed(Arc<Device>),
    /// A vector was defined or updated.
    PropertyChanged {
        device: Arc<Device>,
        vector: PropertyVector,
    },
    /// A vector was removed.
    PropertyDeleted {
        device: Arc<Device>,
        name: String,
    },
    /// Free-text driver or server message.
    MessageReceived {
        device: Option<Arc<Device>>,
        text: String,
    },
}

/// Receives device events. Dispatch is synchronous on the thread that
/// applied the change; implementations must not block.
pub trait DeviceEventHandler: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);

    /// Called once when the whole control connection shuts down.
    fn on_connection_closed(&self) {}
}

/// Handle for deterministic deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Explicit subscription list. Handlers are invoked in registration
/// order; registering and unregistering are cheap and can happen from
/// event handlers themselves (dispatch works on a snapshot of the list).
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn DeviceEventHandler>)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn DeviceEventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Removes the handler. No-op if already removed.
    pub fn unregister(&self, id: HandlerId) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(h, _)| *h != id);
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fire(&self, event: &DeviceEvent) {
        let snapshot: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler.on_event(event);
        }
    }

    pub fn fire_connection_closed(&self) {
        let snapshot: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler.on_connection_closed();
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}
