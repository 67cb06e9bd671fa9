use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::property::{names, PropertyState};

/// Typed view over a camera device.
#[derive(Debug, Clone)]
pub struct Camera {
    device: Arc<Device>,
}

impl Camera {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        if device.kind() != DeviceKind::Camera {
            return Err(Error::KindMismatch {
                name: device.id().to_string(),
                expected: DeviceKind::Camera,
                actual: device.kind(),
            });
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Begin an exposure of the given length.
    pub fn start_exposure(&self, duration: Duration) -> Result<()> {
        self.device.send_number(
            names::CCD_EXPOSURE,
            &[(names::CCD_EXPOSURE_VALUE, duration.as_secs_f64())],
        )
    }

    pub fn abort_exposure(&self) -> Result<()> {
        self.device
            .send_switch(names::CCD_ABORT_EXPOSURE, &[(names::ABORT, true)])
    }

    /// State of the exposure vector, if defined.
    pub fn exposure_state(&self) -> Option<PropertyState> {
        self.device.property(names::CCD_EXPOSURE).map(|v| v.state)
    }

    pub fn is_exposing(&self) -> bool {
        self.exposure_state() == Some(PropertyState::Busy)
    }

    /// Seconds left in the running exposure, as counted down by the driver.
    pub fn exposure_remaining(&self) -> Option<f64> {
        self.device
            .property(names::CCD_EXPOSURE)
            .and_then(|v| v.number(names::CCD_EXPOSURE_VALUE))
    }
}
