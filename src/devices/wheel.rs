use std::sync::Arc;

use crate::device::Device;
use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::property::names;

/// Typed view over a filter wheel. Slots are 1-based.
#[derive(Debug, Clone)]
pub struct FilterWheel {
    device: Arc<Device>,
}

impl FilterWheel {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        if device.kind() != DeviceKind::FilterWheel {
            return Err(Error::KindMismatch {
                name: device.id().to_string(),
                expected: DeviceKind::FilterWheel,
                actual: device.kind(),
            });
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn position(&self) -> Option<u32> {
        self.device
            .property(names::FILTER_SLOT)
            .and_then(|v| v.number(names::FILTER_SLOT_VALUE))
            .map(|n| n as u32)
    }

    pub fn is_moving(&self) -> bool {
        self.device
            .property(names::FILTER_SLOT)
            .is_some_and(|v| v.is_busy())
    }

    pub fn move_to(&self, slot: u32) -> Result<()> {
        self.device.send_number(
            names::FILTER_SLOT,
            &[(names::FILTER_SLOT_VALUE, f64::from(slot))],
        )
    }
}
