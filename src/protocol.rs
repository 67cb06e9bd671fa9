use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::property::{PropertyPerm, PropertyState, PropertyValue, VectorKind};

/// One element of a vector payload as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element {
    pub name: String,
    pub label: String,
    pub value: PropertyValue,
}

impl Element {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        let name = name.into();
        Self { label: name.clone(), name, value }
    }
}

/// Body shared by definition and update messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorPayload {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub kind: VectorKind,
    pub perm: PropertyPerm,
    pub state: PropertyState,
    pub elements: Vec<Element>,
}

/// A decoded inbound protocol message.
///
/// The wire codec lives outside this crate; it hands fully decoded
/// messages to [`ProtocolRouter::handle`](crate::router::ProtocolRouter).
/// Messages are `Eq + Hash` so the router can key its reordering state
/// on whole-message identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolMessage {
    /// Defines (or redefines) a property vector.
    DefVector(VectorPayload),
    /// Updates element values and state of an existing vector.
    SetVector(VectorPayload),
    /// Removes one property, or signals device detach when `name` is empty.
    DelProperty { device: String, name: String },
    /// Free-text message from a driver, or from the server when `device`
    /// is `None`.
    Message {
        device: Option<String>,
        timestamp: DateTime<Utc>,
        text: String,
    },
}

impl ProtocolMessage {
    /// Device name the message addresses, if any.
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::DefVector(p) | Self::SetVector(p) => Some(p.device.as_str()),
            Self::DelProperty { device, .. } => Some(device.as_str()),
            Self::Message { device, .. } => device.as_deref(),
        }
    }

    fn payload(
        device: &str,
        name: &str,
        kind: VectorKind,
        state: PropertyState,
        elements: Vec<Element>,
    ) -> VectorPayload {
        VectorPayload {
            device: device.to_string(),
            name: name.to_string(),
            label: name.to_string(),
            group: String::new(),
            kind,
            perm: PropertyPerm::ReadWrite,
            state,
            elements,
        }
    }

    pub fn def_switch(
        device: &str,
        name: &str,
        state: PropertyState,
        elements: &[(&str, bool)],
    ) -> Self {
        let elements = elements
            .iter()
            .map(|(n, v)| Element::new(*n, PropertyValue::Switch(*v)))
            .collect();
        Self::DefVector(Self::payload(device, name, VectorKind::Switch, state, elements))
    }

    pub fn def_number(
        device: &str,
        name: &str,
        state: PropertyState,
        elements: &[(&str, f64)],
    ) -> Self {
        let elements = elements
            .iter()
            .map(|(n, v)| Element::new(*n, PropertyValue::Number(*v)))
            .collect();
        Self::DefVector(Self::payload(device, name, VectorKind::Number, state, elements))
    }

    pub fn def_text(
        device: &str,
        name: &str,
        state: PropertyState,
        elements: &[(&str, &str)],
    ) -> Self {
        let elements = elements
            .iter()
            .map(|(n, v)| Element::new(*n, PropertyValue::Text(v.to_string())))
            .collect();
        Self::DefVector(Self::payload(device, name, VectorKind::Text, state, elements))
    }

    pub fn set_switch(
        device: &str,
        name: &str,
        state: PropertyState,
        elements: &[(&str, bool)],
    ) -> Self {
        let elements = elements
            .iter()
            .map(|(n, v)| Element::new(*n, PropertyValue::Switch(*v)))
            .collect();
        Self::SetVector(Self::payload(device, name, VectorKind::Switch, state, elements))
    }

    pub fn set_number(
        device: &str,
        name: &str,
        state: PropertyState,
        elements: &[(&str, f64)],
    ) -> Self {
        let elements = elements
            .iter()
            .map(|(n, v)| Element::new(*n, PropertyValue::Number(*v)))
            .collect();
        Self::SetVector(Self::payload(device, name, VectorKind::Number, state, elements))
    }

    /// The `DRIVER_INFO` definition a driver announces itself with.
    pub fn driver_info(device: &str, driver_name: &str, exec: &str, interface: u32) -> Self {
        use crate::property::names;
        let elements = vec![
            Element::new(names::DRIVER_NAME, PropertyValue::Text(driver_name.to_string())),
            Element::new(names::DRIVER_EXEC, PropertyValue::Text(exec.to_string())),
            Element::new(
                names::DRIVER_INTERFACE,
                PropertyValue::Text(interface.to_string()),
            ),
        ];
        Self::DefVector(Self::payload(
            device,
            names::DRIVER_INFO,
            VectorKind::Text,
            PropertyState::Idle,
            elements,
        ))
    }
}

/// A command on its way to the wire, addressed by device name.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    NewSwitch {
        device: String,
        name: String,
        elements: Vec<(String, bool)>,
    },
    NewNumber {
        device: String,
        name: String,
        elements: Vec<(String, f64)>,
    },
    NewText {
        device: String,
        name: String,
        elements: Vec<(String, String)>,
    },
}

impl OutboundCommand {
    pub fn device(&self) -> &str {
        match self {
            Self::NewSwitch { device, .. }
            | Self::NewNumber { device, .. }
            | Self::NewText { device, .. } => device,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NewSwitch { name, .. }
            | Self::NewNumber { name, .. }
            | Self::NewText { name, .. } => name,
        }
    }
}

/// Sink for outbound commands. The wire layer implements this; tests
/// substitute recording fakes.
pub trait CommandSender: Send + Sync {
    fn send(&self, command: OutboundCommand) -> Result<()>;
}

impl CommandSender for mpsc::UnboundedSender<OutboundCommand> {
    fn send(&self, command: OutboundCommand) -> Result<()> {
        mpsc::UnboundedSender::send(self, command).map_err(|_| Error::ChannelClosed)
    }
}
