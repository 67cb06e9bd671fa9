use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::devices::{EquatorialCoordinates, GuideDirection, Mount};
use crate::error::Result;
use crate::event::{DeviceEvent, DeviceEventHandler};
use crate::property::{names, PropertyState};
use crate::task::rendezvous::{Confirmation, Rendezvous};
use crate::task::{settle, Task, TaskOutcome};

/// Releases the slew wait when the coordinate vector leaves busy at a
/// pointing different from the pre-command snapshot. A busy-to-idle blip
/// at the old pointing (a rejected or aborted slew) does not release.
struct SlewWatcher {
    device_id: String,
    snapshot: Option<EquatorialCoordinates>,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for SlewWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        let DeviceEvent::PropertyChanged { device, vector } = event else {
            return;
        };
        if device.id() != self.device_id || vector.name != names::EQUATORIAL_EOD_COORD {
            return;
        }
        match vector.state {
            PropertyState::Alert => {
                self.rendezvous.release(Confirmation::Fault);
            }
            PropertyState::Busy => {}
            PropertyState::Idle | PropertyState::Ok => {
                let current = match (vector.number(names::RA), vector.number(names::DEC)) {
                    (Some(ra), Some(dec)) => EquatorialCoordinates::new(ra, dec),
                    _ => return,
                };
                let moved = self
                    .snapshot
                    .map(|before| !before.approx_eq(&current))
                    .unwrap_or(true);
                if moved {
                    self.rendezvous.release(Confirmation::Confirmed);
                }
            }
        }
    }
}

/// Slews the mount and waits for it to settle on the new pointing.
pub struct MountSlewTask {
    name: String,
    mount: Mount,
    target: EquatorialCoordinates,
    /// Keep tracking the target after arrival.
    track_after: bool,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl MountSlewTask {
    pub fn slew(mount: Mount, target: EquatorialCoordinates, timeout: Option<Duration>) -> Self {
        Self::new(mount, target, false, timeout)
    }

    pub fn goto(mount: Mount, target: EquatorialCoordinates, timeout: Option<Duration>) -> Self {
        Self::new(mount, target, true, timeout)
    }

    fn new(
        mount: Mount,
        target: EquatorialCoordinates,
        track_after: bool,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: format!("slew {}", mount.device().id()),
            mount,
            target,
            track_after,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }
}

#[async_trait]
impl Task for MountSlewTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        // Settling is judged against the pointing before the command.
        let snapshot = self.mount.coordinates();
        let waiter = self.rendezvous.arm()?;
        let handlers = Arc::clone(self.mount.device().handlers());
        let watcher = handlers.register(Arc::new(SlewWatcher {
            device_id: self.mount.device().id().to_string(),
            snapshot,
            rendezvous: Arc::clone(&self.rendezvous),
        }));

        let sent = if self.track_after {
            self.mount.goto(self.target)
        } else {
            self.mount.slew_to(self.target)
        };
        if let Err(err) = sent {
            handlers.unregister(watcher);
            return Err(err);
        }
        info!(
            mount = %self.mount.device().id(),
            ra = self.target.right_ascension,
            dec = self.target.declination,
            "slewing"
        );

        let outcome = waiter.wait(&token, self.timeout).await;
        handlers.unregister(watcher);
        Ok(settle(outcome, || self.mount.abort_motion()))
    }
}

struct TrackWatcher {
    device_id: String,
    enabled: bool,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for TrackWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        let DeviceEvent::PropertyChanged { device, vector } = event else {
            return;
        };
        if device.id() != self.device_id || vector.name != names::TELESCOPE_TRACK_STATE {
            return;
        }
        match vector.state {
            PropertyState::Alert => {
                self.rendezvous.release(Confirmation::Fault);
            }
            PropertyState::Busy => {}
            _ => {
                if vector.switch(names::TRACK_ON) == Some(self.enabled) {
                    self.rendezvous.release(Confirmation::Confirmed);
                }
            }
        }
    }
}

/// Turns sidereal tracking on or off and waits for the driver to confirm.
pub struct MountTrackTask {
    name: String,
    mount: Mount,
    enabled: bool,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl MountTrackTask {
    pub fn new(mount: Mount, enabled: bool, timeout: Option<Duration>) -> Self {
        Self {
            name: format!("track {}", mount.device().id()),
            mount,
            enabled,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }
}

#[async_trait]
impl Task for MountTrackTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        if self.mount.is_tracking() == self.enabled {
            return Ok(TaskOutcome::Completed);
        }
        let waiter = self.rendezvous.arm()?;
        let handlers = Arc::clone(self.mount.device().handlers());
        let watcher = handlers.register(Arc::new(TrackWatcher {
            device_id: self.mount.device().id().to_string(),
            enabled: self.enabled,
            rendezvous: Arc::clone(&self.rendezvous),
        }));
        if let Err(err) = self.mount.set_tracking(self.enabled) {
            handlers.unregister(watcher);
            return Err(err);
        }
        let outcome = waiter.wait(&token, self.timeout).await;
        handlers.unregister(watcher);
        Ok(settle(outcome, || Ok(())))
    }
}

struct PulseWatcher {
    device_id: String,
    vector: &'static str,
    saw_busy: AtomicBool,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for PulseWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        let DeviceEvent::PropertyChanged { device, vector } = event else {
            return;
        };
        if device.id() != self.device_id || vector.name != self.vector {
            return;
        }
        match vector.state {
            PropertyState::Alert => {
                self.rendezvous.release(Confirmation::Fault);
            }
            PropertyState::Busy => {
                self.saw_busy.store(true, Ordering::SeqCst);
            }
            _ => {
                if self.saw_busy.load(Ordering::SeqCst) {
                    self.rendezvous.release(Confirmation::Confirmed);
                }
            }
        }
    }
}

/// Fires a timed guide pulse and waits for the pulse vector to go busy
/// and come back.
pub struct GuidePulseTask {
    name: String,
    mount: Mount,
    direction: GuideDirection,
    duration: Duration,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl GuidePulseTask {
    pub fn new(
        mount: Mount,
        direction: GuideDirection,
        duration: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: format!("guide {}", mount.device().id()),
            mount,
            direction,
            duration,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }

    fn vector(&self) -> &'static str {
        match self.direction {
            GuideDirection::North | GuideDirection::South => names::TELESCOPE_TIMED_GUIDE_NS,
            GuideDirection::West | GuideDirection::East => names::TELESCOPE_TIMED_GUIDE_WE,
        }
    }
}

#[async_trait]
impl Task for GuidePulseTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        let waiter = self.rendezvous.arm()?;
        let handlers = Arc::clone(self.mount.device().handlers());
        let watcher = handlers.register(Arc::new(PulseWatcher {
            device_id: self.mount.device().id().to_string(),
            vector: self.vector(),
            saw_busy: AtomicBool::new(false),
            rendezvous: Arc::clone(&self.rendezvous),
        }));
        if let Err(err) = self.mount.guide(self.direction, self.duration) {
            handlers.unregister(watcher);
            return Err(err);
        }
        let outcome = waiter.wait(&token, self.timeout).await;
        handlers.unregister(watcher);
        Ok(settle(outcome, || self.mount.abort_motion()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::drivers::DeviceKind;
    use crate::event::HandlerRegistry;
    use crate::protocol::{OutboundCommand, ProtocolMessage};
    use tokio::sync::mpsc;

    fn mount() -> (Mount, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device::new(
            "Telescope Simulator",
            "Telescope Simulator",
            DeviceKind::Mount,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            100,
        ));
        device.handle_message(&ProtocolMessage::def_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            PropertyState::Idle,
            &[(names::RA, 0.0), (names::DEC, 0.0)],
        ));
        (Mount::new(device).unwrap(), rx)
    }

    fn coords(state: PropertyState, ra: f64, dec: f64) -> ProtocolMessage {
        ProtocolMessage::set_number(
            "Telescope Simulator",
            names::EQUATORIAL_EOD_COORD,
            state,
            &[(names::RA, ra), (names::DEC, dec)],
        )
    }

    #[tokio::test]
    async fn slew_settles_when_pointing_changes() {
        let (mount, _rx) = mount();
        let device = Arc::clone(mount.device());
        let task = MountSlewTask::goto(
            mount,
            EquatorialCoordinates::new(5.5, 45.0),
            Some(Duration::from_secs(5)),
        );
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&coords(PropertyState::Busy, 2.0, 20.0));
        device.handle_message(&coords(PropertyState::Ok, 5.5, 45.0));

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(device.handlers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_to_idle_at_old_pointing_does_not_settle() {
        let (mount, _rx) = mount();
        let device = Arc::clone(mount.device());
        let task = MountSlewTask::slew(
            mount,
            EquatorialCoordinates::new(5.5, 45.0),
            Some(Duration::from_secs(1)),
        );
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        device.handle_message(&coords(PropertyState::Busy, 0.0, 0.0));
        // blip back to idle with unchanged coordinates: must not release
        device.handle_message(&coords(PropertyState::Idle, 0.0, 0.0));

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::TimedOut);
    }

    #[tokio::test]
    async fn alert_during_slew_is_a_fault() {
        let (mount, _rx) = mount();
        let device = Arc::clone(mount.device());
        let task = MountSlewTask::slew(
            mount,
            EquatorialCoordinates::new(5.5, 45.0),
            Some(Duration::from_secs(5)),
        );
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&coords(PropertyState::Alert, 0.0, 0.0));

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::CompletedWithFault);
    }

    #[tokio::test]
    async fn cancellation_unblocks_and_aborts_motion() {
        let (mount, mut rx) = mount();
        let task = MountSlewTask::slew(mount, EquatorialCoordinates::new(5.5, 45.0), None);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = task.execute(token).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);

        // on-coord-set, coordinates, then the abort
        let mut names_sent = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            names_sent.push(cmd.name().to_string());
        }
        assert_eq!(
            names_sent,
            vec![
                names::ON_COORD_SET,
                names::EQUATORIAL_EOD_COORD,
                names::TELESCOPE_ABORT_MOTION
            ]
        );
    }

    #[tokio::test]
    async fn guide_pulse_confirms_after_busy_cycle() {
        let (mount, _rx) = mount();
        let device = Arc::clone(mount.device());
        device.handle_message(&ProtocolMessage::def_number(
            "Telescope Simulator",
            names::TELESCOPE_TIMED_GUIDE_NS,
            PropertyState::Idle,
            &[(names::TIMED_GUIDE_N, 0.0), (names::TIMED_GUIDE_S, 0.0)],
        ));
        let task = GuidePulseTask::new(
            mount,
            GuideDirection::North,
            Duration::from_millis(500),
            Some(Duration::from_secs(5)),
        );
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&ProtocolMessage::set_number(
            "Telescope Simulator",
            names::TELESCOPE_TIMED_GUIDE_NS,
            PropertyState::Busy,
            &[(names::TIMED_GUIDE_N, 500.0)],
        ));
        device.handle_message(&ProtocolMessage::set_number(
            "Telescope Simulator",
            names::TELESCOPE_TIMED_GUIDE_NS,
            PropertyState::Ok,
            &[(names::TIMED_GUIDE_N, 0.0)],
        ));

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn track_task_is_a_noop_when_already_tracking() {
        let (mount, mut rx) = mount();
        mount.device().handle_message(&ProtocolMessage::def_switch(
            "Telescope Simulator",
            names::TELESCOPE_TRACK_STATE,
            PropertyState::Ok,
            &[(names::TRACK_ON, true), (names::TRACK_OFF, false)],
        ));
        let task = MountTrackTask::new(mount, true, Some(Duration::from_secs(1)));
        let outcome = task.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(rx.try_recv().is_err());
    }
}
