use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, HandlerRegistry};
use crate::property::{names, Property, PropertyState, PropertyVector};
use crate::protocol::{CommandSender, OutboundCommand, ProtocolMessage, VectorPayload};

/// Mutable device state, guarded by one lock per device.
#[derive(Debug, Default)]
struct DeviceState {
    connected: bool,
    properties: IndexMap<String, PropertyVector>,
    /// Driver messages, latest first, bounded.
    messages: VecDeque<String>,
    /// Devices this one snoops, as last sent via `ACTIVE_DEVICES`. Held
    /// as protocol ids, not device references; the targets may not even
    /// be registered yet when the driver names them.
    snooped: Vec<String>,
    closed: bool,
}

/// A remote hardware device as seen through the protocol.
///
/// Created by the router when a classifying `DRIVER_INFO` first names it,
/// destroyed on detach. Holds the only live copy of the device's property
/// vectors; all observation goes through snapshot clones.
pub struct Device {
    id: String,
    label: String,
    kind: DeviceKind,
    message_history: usize,
    sender: Arc<dyn CommandSender>,
    handlers: Arc<HandlerRegistry>,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        kind: DeviceKind,
        sender: Arc<dyn CommandSender>,
        handlers: Arc<HandlerRegistry>,
        message_history: usize,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            message_history,
            sender,
            handlers,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Protocol name. Unique within a registry.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name from `DRIVER_NAME`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// The handler registry this device dispatches through.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Snapshot clone of one property vector.
    pub fn property(&self, name: &str) -> Option<PropertyVector> {
        self.lock().properties.get(name).cloned()
    }

    /// Like [`property`](Self::property), but an error when undefined.
    pub fn require_property(&self, name: &str) -> Result<PropertyVector> {
        self.property(name).ok_or_else(|| Error::PropertyNotFound {
            device: self.id.clone(),
            name: name.to_string(),
        })
    }

    /// Snapshot clones of all property vectors, in definition order.
    pub fn properties(&self) -> Vec<PropertyVector> {
        self.lock().properties.values().cloned().collect()
    }

    /// Driver messages, latest first.
    pub fn messages(&self) -> Vec<String> {
        self.lock().messages.iter().cloned().collect()
    }

    /// Ids of the devices this one was told to snoop. Resolve them to
    /// live devices through [`DeviceRegistry::find`](crate::registry::DeviceRegistry::find).
    pub fn snooped_devices(&self) -> Vec<String> {
        self.lock().snooped.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one routed message. State mutates under the device lock;
    /// events fire after it is released, carrying snapshot clones.
    pub fn handle_message(self: &Arc<Self>, message: &ProtocolMessage) {
        let mut events = Vec::new();
        match message {
            ProtocolMessage::DefVector(payload) => {
                let vector = Self::vector_from_payload(payload);
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                self.apply_connection(&mut state, &vector, &mut events);
                state.properties.insert(vector.name.clone(), vector.clone());
                drop(state);
                events.push(DeviceEvent::PropertyChanged { device: Arc::clone(self), vector });
            }
            ProtocolMessage::SetVector(payload) => {
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                let Some(vector) = state.properties.get_mut(&payload.name) else {
                    debug!(device = %self.id, vector = %payload.name, "update for undefined vector ignored");
                    return;
                };
                vector.state = payload.state;
                for element in &payload.elements {
                    if let Some(property) = vector.items.get_mut(&element.name) {
                        property.value = element.value.clone();
                    }
                }
                let vector = vector.clone();
                self.apply_connection(&mut state, &vector, &mut events);
                drop(state);
                events.push(DeviceEvent::PropertyChanged { device: Arc::clone(self), vector });
            }
            ProtocolMessage::DelProperty { name, .. } => {
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                if state.properties.shift_remove(name).is_some() {
                    drop(state);
                    events.push(DeviceEvent::PropertyDeleted {
                        device: Arc::clone(self),
                        name: name.clone(),
                    });
                }
            }
            ProtocolMessage::Message { text, .. } => {
                let mut state = self.lock();
                if state.closed {
                    return;
                }
                state.messages.push_front(text.clone());
                state.messages.truncate(self.message_history);
                drop(state);
                events.push(DeviceEvent::MessageReceived {
                    device: Some(Arc::clone(self)),
                    text: text.clone(),
                });
            }
        }
        for event in events {
            self.handlers.fire(&event);
        }
    }

    /// Derives connection transitions from a `CONNECTION` vector.
    /// Must run while the state lock is held; events are deferred.
    fn apply_connection(
        self: &Arc<Self>,
        state: &mut DeviceState,
        vector: &PropertyVector,
        events: &mut Vec<DeviceEvent>,
    ) {
        if vector.name != names::CONNECTION {
            return;
        }
        let on = vector.switch(names::CONNECT) == Some(true);
        if on && !state.connected {
            state.connected = true;
            info!(device = %self.id, "connected");
            events.push(DeviceEvent::Connected(Arc::clone(self)));
        } else if !on && state.connected {
            state.connected = false;
            info!(device = %self.id, "disconnected");
            events.push(DeviceEvent::Disconnected(Arc::clone(self)));
        } else if !state.connected && vector.state == PropertyState::Alert {
            warn!(device = %self.id, "connection failed");
            events.push(DeviceEvent::ConnectionFailed(Arc::clone(self)));
        }
    }

    fn vector_from_payload(payload: &VectorPayload) -> PropertyVector {
        let items = payload
            .elements
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    Property {
                        name: e.name.clone(),
                        label: e.label.clone(),
                        value: e.value.clone(),
                    },
                )
            })
            .collect();
        PropertyVector {
            device: payload.device.clone(),
            name: payload.name.clone(),
            label: payload.label.clone(),
            group: payload.group.clone(),
            kind: payload.kind,
            perm: payload.perm,
            state: payload.state,
            items,
        }
    }

    /// Send a one-or-more element switch vector.
    pub fn send_switch(&self, name: &str, elements: &[(&str, bool)]) -> Result<()> {
        self.sender.send(OutboundCommand::NewSwitch {
            device: self.id.clone(),
            name: name.to_string(),
            elements: elements.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        })
    }

    pub fn send_number(&self, name: &str, elements: &[(&str, f64)]) -> Result<()> {
        self.sender.send(OutboundCommand::NewNumber {
            device: self.id.clone(),
            name: name.to_string(),
            elements: elements.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        })
    }

    pub fn send_text(&self, name: &str, elements: &[(&str, &str)]) -> Result<()> {
        self.sender.send(OutboundCommand::NewText {
            device: self.id.clone(),
            name: name.to_string(),
            elements: elements
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        })
    }

    /// Ask the driver to connect the hardware.
    pub fn connect(&self) -> Result<()> {
        self.send_switch(names::CONNECTION, &[(names::CONNECT, true)])
    }

    /// Ask the driver to disconnect the hardware.
    pub fn disconnect(&self) -> Result<()> {
        self.send_switch(names::CONNECTION, &[(names::DISCONNECT, true)])
    }

    /// Point this device's driver at the given devices via `ACTIVE_DEVICES`
    /// so it can snoop their properties (e.g. a camera reading the mount's
    /// coordinates for FITS headers).
    pub fn snoop(&self, devices: &[&Arc<Device>]) -> Result<()> {
        let elements: Vec<(&str, &str)> = devices
            .iter()
            .filter_map(|d| Self::active_element(d.kind()).map(|e| (e, d.id())))
            .collect();
        if elements.is_empty() {
            return Ok(());
        }
        self.lock().snooped = elements.iter().map(|(_, id)| id.to_string()).collect();
        self.send_text(names::ACTIVE_DEVICES, &elements)
    }

    fn active_element(kind: DeviceKind) -> Option<&'static str> {
        match kind {
            DeviceKind::Mount => Some("ACTIVE_TELESCOPE"),
            DeviceKind::Camera => Some("ACTIVE_CCD"),
            DeviceKind::Focuser => Some("ACTIVE_FOCUSER"),
            DeviceKind::FilterWheel => Some("ACTIVE_FILTER"),
            DeviceKind::Rotator => Some("ACTIVE_ROTATOR"),
            DeviceKind::Gps => Some("ACTIVE_GPS"),
            _ => None,
        }
    }

    /// Discard all device state. Idempotent; returns true on the first call.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.connected = false;
        state.properties.clear();
        state.messages.clear();
        state.snooped.clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeviceEventHandler;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    pub(crate) fn test_device(kind: DeviceKind) -> (Arc<Device>, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(HandlerRegistry::new());
        let device = Arc::new(Device::new(
            "Telescope Simulator",
            "Telescope Simulator",
            kind,
            Arc::new(tx),
            handlers,
            100,
        ));
        (device, rx)
    }

    struct ConnLog(Arc<StdMutex<Vec<&'static str>>>);

    impl DeviceEventHandler for ConnLog {
        fn on_event(&self, event: &DeviceEvent) {
            let tag = match event {
                DeviceEvent::Connected(_) => "connected",
                DeviceEvent::Disconnected(_) => "disconnected",
                DeviceEvent::ConnectionFailed(_) => "failed",
                _ => return,
            };
            self.0.lock().unwrap().push(tag);
        }
    }

    #[test]
    fn def_replaces_and_set_mutates_in_place() {
        let (device, _rx) = test_device(DeviceKind::Mount);
        device.handle_message(&ProtocolMessage::def_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Idle,
            &[(names::RA, 0.0), (names::DEC, 0.0)],
        ));
        device.handle_message(&ProtocolMessage::set_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Busy,
            &[(names::RA, 5.5)],
        ));

        let vector = device.property(names::EQUATORIAL_EOD_COORD).unwrap();
        assert_eq!(vector.state, PropertyState::Busy);
        assert_eq!(vector.number(names::RA), Some(5.5));
        // untouched element keeps its value
        assert_eq!(vector.number(names::DEC), Some(0.0));
    }

    #[test]
    fn set_for_undefined_vector_is_ignored() {
        let (device, _rx) = test_device(DeviceKind::Mount);
        device.handle_message(&ProtocolMessage::set_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Busy,
            &[(names::RA, 5.5)],
        ));
        assert!(matches!(
            device.require_property(names::EQUATORIAL_EOD_COORD),
            Err(Error::PropertyNotFound { .. })
        ));
    }

    #[test]
    fn connection_vector_drives_connection_events() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(HandlerRegistry::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        handlers.register(Arc::new(ConnLog(Arc::clone(&log))));
        let device = Arc::new(Device::new(
            "CCD Simulator",
            "CCD Simulator",
            DeviceKind::Camera,
            Arc::new(tx),
            handlers,
            100,
        ));

        let connect = |on| {
            ProtocolMessage::set_switch(
                "CCD Simulator",
                names::CONNECTION,
                PropertyState::Ok,
                &[(names::CONNECT, on), (names::DISCONNECT, !on)],
            )
        };
        device.handle_message(&ProtocolMessage::def_switch(
            "CCD Simulator",
            names::CONNECTION,
            PropertyState::Idle,
            &[(names::CONNECT, false), (names::DISCONNECT, true)],
        ));
        device.handle_message(&connect(true));
        assert!(device.is_connected());
        // repeated connect does not re-fire
        device.handle_message(&connect(true));
        device.handle_message(&connect(false));
        assert!(!device.is_connected());
        device.handle_message(&ProtocolMessage::set_switch(
            "CCD Simulator",
            names::CONNECTION,
            PropertyState::Alert,
            &[(names::CONNECT, false), (names::DISCONNECT, true)],
        ));
        assert_eq!(*log.lock().unwrap(), vec!["connected", "disconnected", "failed"]);
    }

    #[test]
    fn message_log_is_bounded_latest_first() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device::new(
            "GPS",
            "GPS",
            DeviceKind::Gps,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            3,
        ));
        for i in 0..5 {
            device.handle_message(&ProtocolMessage::Message {
                device: Some("GPS".into()),
                timestamp: chrono::Utc::now(),
                text: format!("msg {i}"),
            });
        }
        assert_eq!(device.messages(), vec!["msg 4", "msg 3", "msg 2"]);
    }

    #[test]
    fn close_is_idempotent_and_discards_state() {
        let (device, _rx) = test_device(DeviceKind::Mount);
        device.handle_message(&ProtocolMessage::def_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Idle,
            &[(names::RA, 0.0)],
        ));
        assert!(device.close());
        assert!(!device.close());
        assert!(device.properties().is_empty());
        // a closed device drops further messages
        device.handle_message(&ProtocolMessage::def_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Idle,
            &[(names::RA, 1.0)],
        ));
        assert!(device.properties().is_empty());
    }

    #[test]
    fn snoop_sends_active_devices() {
        let (camera, mut rx) = test_device(DeviceKind::Camera);
        let (mount, _mount_rx) = {
            let (tx, rx) = mpsc::unbounded_channel::<OutboundCommand>();
            let mount = Arc::new(Device::new(
                "EQMod Mount",
                "EQMod Mount",
                DeviceKind::Mount,
                Arc::new(tx),
                Arc::new(HandlerRegistry::new()),
                100,
            ));
            (mount, rx)
        };
        camera.snoop(&[&mount]).unwrap();
        assert_eq!(camera.snooped_devices(), vec!["EQMod Mount"]);
        match rx.try_recv().unwrap() {
            OutboundCommand::NewText { name, elements, .. } => {
                assert_eq!(name, names::ACTIVE_DEVICES);
                assert_eq!(elements, vec![("ACTIVE_TELESCOPE".to_string(), "EQMod Mount".to_string())]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
