use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::devices::EquatorialCoordinates;
use crate::drivers::DeviceKind;
use crate::error::{Error, Result};
use crate::property::names;

/// Direction of a timed guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuideDirection {
    North,
    South,
    West,
    East,
}

impl GuideDirection {
    fn vector(self) -> &'static str {
        match self {
            Self::North | Self::South => names::TELESCOPE_TIMED_GUIDE_NS,
            Self::West | Self::East => names::TELESCOPE_TIMED_GUIDE_WE,
        }
    }

    fn element(self) -> &'static str {
        match self {
            Self::North => names::TIMED_GUIDE_N,
            Self::South => names::TIMED_GUIDE_S,
            Self::West => names::TIMED_GUIDE_W,
            Self::East => names::TIMED_GUIDE_E,
        }
    }
}

/// Typed view over a mount device.
#[derive(Debug, Clone)]
pub struct Mount {
    device: Arc<Device>,
}

impl Mount {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        if device.kind() != DeviceKind::Mount {
            return Err(Error::KindMismatch {
                name: device.id().to_string(),
                expected: DeviceKind::Mount,
                actual: device.kind(),
            });
        }
        Ok(Self { device })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Current pointing, if the coordinate vector has been defined.
    pub fn coordinates(&self) -> Option<EquatorialCoordinates> {
        let vector = self.device.property(names::EQUATORIAL_EOD_COORD)?;
        Some(EquatorialCoordinates::new(
            vector.number(names::RA)?,
            vector.number(names::DEC)?,
        ))
    }

    pub fn is_slewing(&self) -> bool {
        self.device
            .property(names::EQUATORIAL_EOD_COORD)
            .is_some_and(|v| v.is_busy())
    }

    pub fn is_tracking(&self) -> bool {
        self.device
            .property(names::TELESCOPE_TRACK_STATE)
            .and_then(|v| v.switch(names::TRACK_ON))
            .unwrap_or(false)
    }

    /// Slew without changing the tracking state afterwards.
    pub fn slew_to(&self, coordinates: EquatorialCoordinates) -> Result<()> {
        self.send_coordinates(names::SLEW, coordinates)
    }

    /// Slew and track the target on arrival.
    pub fn goto(&self, coordinates: EquatorialCoordinates) -> Result<()> {
        self.send_coordinates(names::TRACK, coordinates)
    }

    /// Declare the mount to already point at the given coordinates.
    pub fn sync(&self, coordinates: EquatorialCoordinates) -> Result<()> {
        self.send_coordinates(names::SYNC, coordinates)
    }

    fn send_coordinates(&self, mode: &str, coordinates: EquatorialCoordinates) -> Result<()> {
        self.device.send_switch(names::ON_COORD_SET, &[(mode, true)])?;
        self.device.send_number(
            names::EQUATORIAL_EOD_COORD,
            &[
                (names::RA, coordinates.right_ascension),
                (names::DEC, coordinates.declination),
            ],
        )
    }

    pub fn abort_motion(&self) -> Result<()> {
        self.device
            .send_switch(names::TELESCOPE_ABORT_MOTION, &[(names::ABORT_MOTION, true)])
    }

    pub fn set_tracking(&self, enabled: bool) -> Result<()> {
        let element = if enabled { names::TRACK_ON } else { names::TRACK_OFF };
        self.device
            .send_switch(names::TELESCOPE_TRACK_STATE, &[(element, true)])
    }

    /// Fire a timed guide pulse.
    pub fn guide(&self, direction: GuideDirection, duration: Duration) -> Result<()> {
        self.device.send_number(
            direction.vector(),
            &[(direction.element(), duration.as_millis() as f64)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HandlerRegistry;
    use crate::property::PropertyState;
    use crate::protocol::{OutboundCommand, ProtocolMessage};
    use tokio::sync::mpsc;

    fn mount() -> (Mount, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device::new(
            "EQMod Mount",
            "EQMod Mount",
            DeviceKind::Mount,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            100,
        ));
        (Mount::new(device).unwrap(), rx)
    }

    #[test]
    fn kind_is_checked_at_construction() {
        let (tx, _rx) = mpsc::unbounded_channel::<OutboundCommand>();
        let camera = Arc::new(Device::new(
            "CCD Simulator",
            "CCD Simulator",
            DeviceKind::Camera,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            100,
        ));
        assert!(matches!(
            Mount::new(camera),
            Err(Error::KindMismatch { .. })
        ));
    }

    #[test]
    fn goto_selects_track_mode_then_sends_coordinates() {
        let (mount, mut rx) = mount();
        mount
            .goto(EquatorialCoordinates::new(5.5, 45.0))
            .unwrap();

        match rx.try_recv().unwrap() {
            OutboundCommand::NewSwitch { name, elements, .. } => {
                assert_eq!(name, names::ON_COORD_SET);
                assert_eq!(elements, vec![(names::TRACK.to_string(), true)]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            OutboundCommand::NewNumber { name, elements, .. } => {
                assert_eq!(name, names::EQUATORIAL_EOD_COORD);
                assert_eq!(
                    elements,
                    vec![(names::RA.to_string(), 5.5), (names::DEC.to_string(), 45.0)]
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn slewing_and_tracking_reflect_property_state() {
        let (mount, _rx) = mount();
        let device = Arc::clone(mount.device());
        device.handle_message(&ProtocolMessage::def_number(
            "EQMod Mount",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Busy,
            &[(names::RA, 5.5), (names::DEC, 45.0)],
        ));
        device.handle_message(&ProtocolMessage::def_switch(
            "EQMod Mount",
            names::TELESCOPE_TRACK_STATE,
            PropertyState::Ok,
            &[(names::TRACK_ON, true), (names::TRACK_OFF, false)],
        ));
        assert!(mount.is_slewing());
        assert!(mount.is_tracking());
        assert_eq!(
            mount.coordinates(),
            Some(EquatorialCoordinates::new(5.5, 45.0))
        );
    }

    #[test]
    fn guide_pulse_uses_millisecond_elements() {
        let (mount, mut rx) = mount();
        mount
            .guide(GuideDirection::West, Duration::from_millis(250))
            .unwrap();
        match rx.try_recv().unwrap() {
            OutboundCommand::NewNumber { name, elements, .. } => {
                assert_eq!(name, names::TELESCOPE_TIMED_GUIDE_WE);
                assert_eq!(elements, vec![(names::TIMED_GUIDE_W.to_string(), 250.0)]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
