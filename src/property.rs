use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use crate::drivers::DeviceKind;

/// Lifecycle state of a property vector, as reported by the driver.
///
/// State transitions are what confirmation waits observe: a vector that
/// goes `Busy` and later leaves `Busy` has finished a command cycle.
/// `Busy` back to `Idle` without a confirming value change means the
/// operation was aborted; `Alert` means it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PropertyState {
    #[default]
    Idle,
    Busy,
    Ok,
    Alert,
}

/// Client-side permission on a property vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PropertyPerm {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

/// The element type a vector carries. All elements of one vector share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Switch,
    Number,
    Text,
}

/// A single element value.
///
/// Equality and hashing are bit-exact (numbers compare via their IEEE bit
/// pattern) so whole messages can be used as map keys.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Switch(bool),
    Number(f64),
    Text(String),
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Switch(a), Self::Switch(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropertyValue {}

impl Hash for PropertyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Switch(b) => {
                state.write_u8(0);
                b.hash(state);
            }
            Self::Number(n) => {
                state.write_u8(1);
                n.to_bits().hash(state);
            }
            Self::Text(s) => {
                state.write_u8(2);
                s.hash(state);
            }
        }
    }
}

impl PropertyValue {
    pub fn as_switch(&self) -> Option<bool> {
        match self {
            Self::Switch(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// One named element inside a property vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub label: String,
    pub value: PropertyValue,
}

/// A named group of elements on one device, updated atomically by the
/// protocol. There is exactly one live instance per (device, vector name):
/// a definition message replaces it wholesale, an update message mutates
/// its element values and state in place.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub kind: VectorKind,
    pub perm: PropertyPerm,
    pub state: PropertyState,
    pub items: IndexMap<String, Property>,
}

impl PropertyVector {
    pub fn is_busy(&self) -> bool {
        self.state == PropertyState::Busy
    }

    /// Value of the named switch element, if present.
    pub fn switch(&self, name: &str) -> Option<bool> {
        self.items.get(name).and_then(|p| p.value.as_switch())
    }

    /// Value of the named number element, if present.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.items.get(name).and_then(|p| p.value.as_number())
    }

    /// Value of the named text element, if present.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.items.get(name).and_then(|p| p.value.as_text())
    }

    /// Name of the first switch element that is on, for one-of-many vectors.
    pub fn first_on_switch(&self) -> Option<&str> {
        self.items
            .values()
            .find(|p| p.value.as_switch() == Some(true))
            .map(|p| p.name.as_str())
    }
}

/// Well-known vector and element names used across device kinds.
pub mod names {
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const DRIVER_INFO: &str = "DRIVER_INFO";
    pub const DRIVER_NAME: &str = "DRIVER_NAME";
    pub const DRIVER_EXEC: &str = "DRIVER_EXEC";
    pub const DRIVER_INTERFACE: &str = "DRIVER_INTERFACE";

    pub const ACTIVE_DEVICES: &str = "ACTIVE_DEVICES";

    pub const EQUATORIAL_EOD_COORD: &str = "EQUATORIAL_EOD_COORD";
    pub const RA: &str = "RA";
    pub const DEC: &str = "DEC";
    pub const ON_COORD_SET: &str = "ON_COORD_SET";
    pub const SLEW: &str = "SLEW";
    pub const TRACK: &str = "TRACK";
    pub const SYNC: &str = "SYNC";
    pub const TELESCOPE_TRACK_STATE: &str = "TELESCOPE_TRACK_STATE";
    pub const TRACK_ON: &str = "TRACK_ON";
    pub const TRACK_OFF: &str = "TRACK_OFF";
    pub const TELESCOPE_ABORT_MOTION: &str = "TELESCOPE_ABORT_MOTION";
    pub const ABORT_MOTION: &str = "ABORT_MOTION";
    pub const TELESCOPE_TIMED_GUIDE_NS: &str = "TELESCOPE_TIMED_GUIDE_NS";
    pub const TELESCOPE_TIMED_GUIDE_WE: &str = "TELESCOPE_TIMED_GUIDE_WE";
    pub const TIMED_GUIDE_N: &str = "TIMED_GUIDE_N";
    pub const TIMED_GUIDE_S: &str = "TIMED_GUIDE_S";
    pub const TIMED_GUIDE_W: &str = "TIMED_GUIDE_W";
    pub const TIMED_GUIDE_E: &str = "TIMED_GUIDE_E";

    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const ABORT: &str = "ABORT";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";

    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const FOCUS_ABSOLUTE_POSITION: &str = "FOCUS_ABSOLUTE_POSITION";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const FOCUS_TEMPERATURE: &str = "FOCUS_TEMPERATURE";

    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_SLOT_VALUE: &str = "FILTER_SLOT_VALUE";
}

bitflags::bitflags! {
    /// `DRIVER_INTERFACE` bitmask advertised by drivers. Used as a
    /// secondary classification signal alongside the driver table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverInterface: u32 {
        const TELESCOPE = 0x0001;
        const CCD = 0x0002;
        const GUIDER = 0x0004;
        const FOCUSER = 0x0008;
        const FILTER = 0x0010;
        const DOME = 0x0020;
        const GPS = 0x0040;
        const WEATHER = 0x0080;
        const AO = 0x0100;
        const DUSTCAP = 0x0200;
        const LIGHTBOX = 0x0400;
        const DETECTOR = 0x0800;
        const ROTATOR = 0x1000;
        const SPECTROGRAPH = 0x2000;
        const CORRELATOR = 0x4000;
        const AUX = 0x8000;
    }
}

impl DriverInterface {
    /// Primary device kind implied by the interface mask, if any.
    pub fn primary_kind(self) -> Option<DeviceKind> {
        if self.contains(Self::CCD) {
            Some(DeviceKind::Camera)
        } else if self.contains(Self::TELESCOPE) {
            Some(DeviceKind::Mount)
        } else if self.contains(Self::FOCUSER) {
            Some(DeviceKind::Focuser)
        } else if self.contains(Self::FILTER) {
            Some(DeviceKind::FilterWheel)
        } else if self.contains(Self::ROTATOR) {
            Some(DeviceKind::Rotator)
        } else if self.contains(Self::GPS) {
            Some(DeviceKind::Gps)
        } else if self.contains(Self::GUIDER) {
            Some(DeviceKind::GuideOutput)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_values_compare_bit_exact() {
        assert_eq!(PropertyValue::Number(1.5), PropertyValue::Number(1.5));
        assert_ne!(PropertyValue::Number(0.0), PropertyValue::Number(-0.0));
        assert_ne!(PropertyValue::Number(1.0), PropertyValue::Switch(true));
    }

    #[test]
    fn first_on_switch_respects_element_order() {
        let mut items = IndexMap::new();
        for (name, on) in [("SLEW", false), ("TRACK", true), ("SYNC", true)] {
            items.insert(
                name.to_string(),
                Property {
                    name: name.to_string(),
                    label: name.to_string(),
                    value: PropertyValue::Switch(on),
                },
            );
        }
        let vector = PropertyVector {
            device: "Mount".into(),
            name: names::ON_COORD_SET.into(),
            label: "On coord set".into(),
            group: "Motion".into(),
            kind: VectorKind::Switch,
            perm: PropertyPerm::ReadWrite,
            state: PropertyState::Idle,
            items,
        };
        assert_eq!(vector.first_on_switch(), Some("TRACK"));
    }

    #[test]
    fn interface_mask_classifies_camera_over_guider() {
        let mask = DriverInterface::CCD | DriverInterface::GUIDER;
        assert_eq!(mask.primary_kind(), Some(DeviceKind::Camera));
        assert_eq!(DriverInterface::empty().primary_kind(), None);
    }
}
