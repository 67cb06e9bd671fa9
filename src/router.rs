use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::device::Device;
use crate::drivers::{DeviceKind, DriverTable};
use crate::event::DeviceEvent;
use crate::property::{names, DriverInterface};
use crate::protocol::{CommandSender, ProtocolMessage};
use crate::registry::DeviceRegistry;

#[derive(Debug, Default)]
struct RouterState {
    /// Messages seen before their device was classified, in arrival order.
    reordering: VecDeque<ProtocolMessage>,
    /// Delivery attempts per distinct message while its device is unknown.
    retries: HashMap<ProtocolMessage, u32>,
    /// Device names that failed classification; their traffic is dropped.
    not_registered: HashSet<String>,
}

/// Routes decoded protocol messages to the right device, creating and
/// destroying devices as drivers announce and withdraw themselves.
///
/// All classification, dispatch and queue mutation for one router runs
/// under a single critical section, so interleaved messages from the
/// reader context can never observe a device half-registered.
pub struct ProtocolRouter {
    registry: Arc<DeviceRegistry>,
    sender: Arc<dyn CommandSender>,
    drivers: Arc<DriverTable>,
    retry_ceiling: u32,
    message_history: usize,
    inner: Mutex<RouterState>,
    closed: AtomicBool,
}

impl ProtocolRouter {
    pub fn new(
        config: &ControlConfig,
        registry: Arc<DeviceRegistry>,
        sender: Arc<dyn CommandSender>,
    ) -> Self {
        Self::with_drivers(config, registry, sender, Arc::new(DriverTable::builtin().clone()))
    }

    pub fn with_drivers(
        config: &ControlConfig,
        registry: Arc<DeviceRegistry>,
        sender: Arc<dyn CommandSender>,
        drivers: Arc<DriverTable>,
    ) -> Self {
        Self {
            registry,
            sender,
            drivers,
            retry_ceiling: config.retry_ceiling,
            message_history: config.device_message_history,
            inner: Mutex::new(RouterState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Drain a receiver into the router until the channel closes.
    pub fn spawn(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<ProtocolMessage>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                router.handle(message);
            }
            debug!("protocol message channel closed");
        })
    }

    /// Handle one inbound message.
    pub fn handle(&self, message: ProtocolMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.handle_locked(&mut state, message);
    }

    fn handle_locked(&self, state: &mut RouterState, message: ProtocolMessage) {
        let device_name = match message.device() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                if let ProtocolMessage::Message { text, .. } = &message {
                    self.registry.handlers().fire(&DeviceEvent::MessageReceived {
                        device: None,
                        text: text.clone(),
                    });
                }
                return;
            }
        };

        if state.not_registered.contains(&device_name) {
            return;
        }

        // Detach signal: delete-property naming a device but no property.
        if let ProtocolMessage::DelProperty { name, .. } = &message {
            if name.is_empty() {
                if let Some(device) = self.registry.find(&device_name) {
                    device.close();
                    self.registry.unregister(&device);
                }
                self.forget(state, &device_name);
                return;
            }
        }

        if let Some(device) = self.registry.find(&device_name) {
            self.dispatch(state, &device, &message);
            return;
        }

        // Unknown device: a DRIVER_INFO definition is the one message
        // that can resolve it.
        if let ProtocolMessage::DefVector(payload) = &message {
            if payload.name == names::DRIVER_INFO {
                self.classify(state, &device_name, &message);
                return;
            }
        }

        if let ProtocolMessage::Message { text, .. } = &message {
            self.registry.handlers().fire(&DeviceEvent::MessageReceived {
                device: None,
                text: text.clone(),
            });
            return;
        }

        self.enqueue(state, message);
    }

    /// Dispatch to a registered device, dropping any queued copy of the
    /// same message and watching for secondary capabilities.
    fn dispatch(&self, state: &mut RouterState, device: &Arc<Device>, message: &ProtocolMessage) {
        if state.retries.remove(message).is_some() {
            state.reordering.retain(|m| m != message);
        }
        if let ProtocolMessage::DefVector(payload) = message {
            match payload.name.as_str() {
                names::TELESCOPE_TIMED_GUIDE_NS if device.kind() != DeviceKind::GuideOutput => {
                    self.registry.register_as(DeviceKind::GuideOutput, device);
                }
                names::CCD_TEMPERATURE | names::FOCUS_TEMPERATURE
                    if device.kind() != DeviceKind::Thermometer =>
                {
                    self.registry.register_as(DeviceKind::Thermometer, device);
                }
                _ => {}
            }
        }
        device.handle_message(message);
    }

    fn classify(&self, state: &mut RouterState, device_name: &str, message: &ProtocolMessage) {
        let ProtocolMessage::DefVector(payload) = message else {
            return;
        };
        let exec = payload
            .elements
            .iter()
            .find(|e| e.name == names::DRIVER_EXEC)
            .and_then(|e| e.value.as_text())
            .unwrap_or_default();
        let interface = payload
            .elements
            .iter()
            .find(|e| e.name == names::DRIVER_INTERFACE)
            .and_then(|e| e.value.as_text())
            .and_then(|s| s.parse::<u32>().ok())
            .map(DriverInterface::from_bits_truncate)
            .unwrap_or(DriverInterface::empty());

        let kind = self
            .drivers
            .classify(exec)
            .or_else(|| interface.primary_kind());
        let Some(kind) = kind else {
            warn!(device = %device_name, %exec, "unknown driver, device will not be registered");
            state.not_registered.insert(device_name.to_string());
            // anything already queued for it will never resolve
            state.reordering.retain(|m| m.device() != Some(device_name));
            state.retries.retain(|m, _| m.device() != Some(device_name));
            return;
        };

        let label = payload
            .elements
            .iter()
            .find(|e| e.name == names::DRIVER_NAME)
            .and_then(|e| e.value.as_text())
            .unwrap_or(device_name);
        let device = Arc::new(Device::new(
            device_name,
            label,
            kind,
            Arc::clone(&self.sender),
            Arc::clone(self.registry.handlers()),
            self.message_history,
        ));
        if !self.registry.register(Arc::clone(&device)) {
            return;
        }
        info!(device = %device_name, %exec, %kind, "driver classified");
        if interface.contains(DriverInterface::GUIDER) && kind != DeviceKind::GuideOutput {
            self.registry.register_as(DeviceKind::GuideOutput, &device);
        }
        device.handle_message(message);

        // Resolve everything that arrived before classification. Queued
        // messages dispatch immediately, they do not re-enter the retry
        // accounting.
        let pending: Vec<ProtocolMessage> = {
            let mut rest = VecDeque::new();
            let mut pending = Vec::new();
            while let Some(queued) = state.reordering.pop_front() {
                if queued.device() == Some(device_name) {
                    state.retries.remove(&queued);
                    pending.push(queued);
                } else {
                    rest.push_back(queued);
                }
            }
            state.reordering = rest;
            pending
        };
        for queued in pending {
            self.dispatch(state, &device, &queued);
        }
    }

    fn enqueue(&self, state: &mut RouterState, message: ProtocolMessage) {
        let attempts = state.retries.entry(message.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.retry_ceiling {
            if *attempts == self.retry_ceiling + 1 {
                warn!(device = ?message.device(), "message looping detected, dropping");
            }
            state.reordering.retain(|m| *m != message);
            return;
        }
        if *attempts == 1 {
            state.reordering.push_back(message);
        }
    }

    fn forget(&self, state: &mut RouterState, device_name: &str) {
        state.reordering.retain(|m| m.device() != Some(device_name));
        state.retries.retain(|m, _| m.device() != Some(device_name));
    }

    /// Queued-message count, for inspection.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reordering
            .len()
    }

    /// Drop router state and close the registry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.reordering.clear();
            state.retries.clear();
            state.not_registered.clear();
        }
        self.registry.close();
        info!("protocol router closed");
    }
}

impl std::fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRouter")
            .field("pending", &self.pending())
            .finish()
    }
}
