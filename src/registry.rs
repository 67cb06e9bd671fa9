use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::device::Device;
use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, HandlerRegistry};

#[derive(Debug, Default)]
struct RegistryMaps {
    by_kind: HashMap<DeviceKind, HashMap<String, Arc<Device>>>,
}

impl RegistryMaps {
    fn map_mut(&mut self, kind: DeviceKind) -> &mut HashMap<String, Arc<Device>> {
        self.by_kind.entry(kind).or_default()
    }
}

/// The authoritative set of attached devices, partitioned by kind.
///
/// Device ids are unique across the registry; the first registration for
/// an id wins and later attempts are no-ops. A device with more than one
/// capability (a mount that emits guide pulses, a camera with a cooler
/// temperature channel) appears under each of its kinds but attaches and
/// detaches exactly once.
pub struct DeviceRegistry {
    handlers: Arc<HandlerRegistry>,
    inner: Mutex<RegistryMaps>,
    closed: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            inner: Mutex::new(RegistryMaps::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// The shared handler registry all attached devices dispatch through.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryMaps> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device under its primary kind. Returns true if the id
    /// was new; false makes the call an idempotent no-op.
    pub fn register(&self, device: Arc<Device>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut maps = self.lock();
            if maps
                .by_kind
                .values()
                .any(|m| m.contains_key(device.id()))
            {
                return false;
            }
            maps.map_mut(device.kind())
                .insert(device.id().to_string(), Arc::clone(&device));
        }
        info!(device = %device.id(), kind = %device.kind(), "device attached");
        self.handlers.fire(&DeviceEvent::Attached(device));
        true
    }

    /// Register an already-attached device under a secondary capability.
    /// Fires no event; the device attached when it was first registered.
    pub fn register_as(&self, kind: DeviceKind, device: &Arc<Device>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.lock()
            .map_mut(kind)
            .insert(device.id().to_string(), Arc::clone(device));
    }

    /// Remove a device from every kind map. Fires Detached once; no-op
    /// if the device was not registered.
    pub fn unregister(&self, device: &Arc<Device>) -> bool {
        let mut found = false;
        {
            let mut maps = self.lock();
            for map in maps.by_kind.values_mut() {
                found |= map.remove(device.id()).is_some();
            }
        }
        if found {
            info!(device = %device.id(), "device detached");
            self.handlers.fire(&DeviceEvent::Detached(Arc::clone(device)));
        }
        found
    }

    /// Look a device up by protocol id, falling back to its human label.
    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        let maps = self.lock();
        for map in maps.by_kind.values() {
            if let Some(device) = map.get(name) {
                return Some(Arc::clone(device));
            }
        }
        maps.by_kind
            .values()
            .flat_map(|m| m.values())
            .find(|d| d.label() == name)
            .map(Arc::clone)
    }

    /// Like [`find`](Self::find), but an error when absent.
    pub fn get(&self, name: &str) -> Result<Arc<Device>> {
        self.find(name).ok_or_else(|| Error::DeviceNotFound {
            name: name.to_string(),
        })
    }

    /// All devices registered under the given kind, in no particular order.
    pub fn devices(&self, kind: DeviceKind) -> Vec<Arc<Device>> {
        self.lock()
            .by_kind
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every attached device exactly once.
    pub fn all(&self) -> Vec<Arc<Device>> {
        let maps = self.lock();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for map in maps.by_kind.values() {
            for device in map.values() {
                if seen.insert(device.id().to_string()) {
                    out.push(Arc::clone(device));
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        let maps = self.lock();
        let mut seen = std::collections::HashSet::new();
        maps.by_kind
            .values()
            .flat_map(|m| m.keys())
            .filter(|id| seen.insert(id.to_string()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every device once, fire Detached for each, then clear all
    /// state and subscriptions. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let devices = {
            let mut maps = self.lock();
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for map in maps.by_kind.values() {
                for device in map.values() {
                    if seen.insert(device.id().to_string()) {
                        out.push(Arc::clone(device));
                    }
                }
            }
            maps.by_kind.clear();
            out
        };
        for device in devices {
            device.close();
            self.handlers.fire(&DeviceEvent::Detached(device));
        }
        self.handlers.fire_connection_closed();
        self.handlers.clear();
        info!("device registry closed");
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.len())
            .finish()
    }
}
