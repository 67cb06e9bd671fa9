use std::sync::Arc;

use crate::device::Device;
use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::property::names;

/// Typed view over an absolute-position focuser.
#[derive(Debug, Clone)]
pub struct Focuser {
    device: Arc<Device>,
}

impl Focuser {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        if device.kind() != DeviceKind::Focuser {
            return Err(Error::KindMismatch {
                name: device.id().to_string(),
                expected: DeviceKind::Focuser,
                actual: device.kind(),
            });
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn position(&self) -> Option<f64> {
        self.device
            .property(names::ABS_FOCUS_POSITION)
            .and_then(|v| v.number(names::FOCUS_ABSOLUTE_POSITION))
    }

    pub fn is_moving(&self) -> bool {
        self.device
            .property(names::ABS_FOCUS_POSITION)
            .is_some_and(|v| v.is_busy())
    }

    pub fn move_to(&self, position: u32) -> Result<()> {
        self.device.send_number(
            names::ABS_FOCUS_POSITION,
            &[(names::FOCUS_ABSOLUTE_POSITION, f64::from(position))],
        )
    }

    pub fn abort(&self) -> Result<()> {
        self.device
            .send_switch(names::FOCUS_ABORT_MOTION, &[(names::ABORT, true)])
    }
}
