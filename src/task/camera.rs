use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::devices::Camera;
use crate::error::Result;
use crate::event::{DeviceEvent, DeviceEventHandler};
use crate::property::{names, PropertyState};
use crate::task::rendezvous::{Confirmation, Rendezvous};
use crate::task::{settle, Task, TaskOutcome};

/// Watches the exposure vector. Ok confirms the frame; alert is a
/// driver fault; busy-to-idle means somebody aborted the exposure out
/// from under us, which also counts as a fault.
struct ExposureWatcher {
    device_id: String,
    saw_busy: AtomicBool,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for ExposureWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        let DeviceEvent::PropertyChanged { device, vector } = event else {
            return;
        };
        if device.id() != self.device_id || vector.name != names::CCD_EXPOSURE {
            return;
        }
        match vector.state {
            PropertyState::Ok => {
                self.rendezvous.release(Confirmation::Confirmed);
            }
            PropertyState::Alert => {
                self.rendezvous.release(Confirmation::Fault);
            }
            PropertyState::Busy => {
                self.saw_busy.store(true, Ordering::SeqCst);
            }
            PropertyState::Idle => {
                if self.saw_busy.load(Ordering::SeqCst) {
                    warn!(device = %self.device_id, "exposure aborted externally");
                    self.rendezvous.release(Confirmation::Fault);
                }
            }
        }
    }
}

/// Takes one exposure and waits for the driver to confirm the frame.
pub struct CameraExposureTask {
    name: String,
    camera: Camera,
    duration: Duration,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl CameraExposureTask {
    pub fn new(camera: Camera, duration: Duration, timeout: Option<Duration>) -> Self {
        Self {
            name: format!("expose {}", camera.device().id()),
            camera,
            duration,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }
}

#[async_trait]
impl Task for CameraExposureTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        let waiter = self.rendezvous.arm()?;
        let handlers = Arc::clone(self.camera.device().handlers());
        let watcher = handlers.register(Arc::new(ExposureWatcher {
            device_id: self.camera.device().id().to_string(),
            saw_busy: AtomicBool::new(false),
            rendezvous: Arc::clone(&self.rendezvous),
        }));
        if let Err(err) = self.camera.start_exposure(self.duration) {
            handlers.unregister(watcher);
            return Err(err);
        }
        info!(
            camera = %self.camera.device().id(),
            seconds = self.duration.as_secs_f64(),
            "exposing"
        );
        let outcome = waiter.wait(&token, self.timeout).await;
        handlers.unregister(watcher);
        Ok(settle(outcome, || self.camera.abort_exposure()))
    }
}

/// Takes a fixed number of frames in strict order, with a cancellable
/// delay between frames. Progress counts completed frames; a faulted
/// frame degrades the aggregate outcome but does not stop the sequence.
pub struct CaptureSequenceTask {
    name: String,
    camera: Camera,
    count: usize,
    exposure: Duration,
    delay: Duration,
    completed: AtomicUsize,
    exposure_timeout: Option<Duration>,
}

impl CaptureSequenceTask {
    pub fn new(
        camera: Camera,
        count: usize,
        exposure: Duration,
        delay: Duration,
        exposure_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: format!("capture {}x {}", count, camera.device().id()),
            camera,
            count,
            exposure,
            delay,
            completed: AtomicUsize::new(0),
            exposure_timeout,
        }
    }

    pub fn frames_completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for CaptureSequenceTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        self.completed.store(0, Ordering::SeqCst);
        let mut aggregate = TaskOutcome::Completed;
        for frame in 0..self.count {
            if token.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            if frame > 0 && !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = token.cancelled() => return Ok(TaskOutcome::Cancelled),
                }
            }
            let exposure = CameraExposureTask::new(
                self.camera.clone(),
                self.exposure,
                self.exposure_timeout,
            );
            match exposure.execute(token.clone()).await? {
                TaskOutcome::Completed => {}
                TaskOutcome::CompletedWithFault | TaskOutcome::TimedOut => {
                    aggregate = TaskOutcome::CompletedWithFault;
                }
                TaskOutcome::Cancelled => return Ok(TaskOutcome::Cancelled),
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(aggregate)
    }

    fn progress(&self) -> Option<f64> {
        if self.count == 0 {
            return Some(1.0);
        }
        Some(self.completed.load(Ordering::SeqCst) as f64 / self.count as f64)
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

    fn camera() -> (Camera, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device::new(
            "CCD Simulator",
            "CCD Simulator",
            DeviceKind::Camera,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            100,
        ));
        device.handle_message(&ProtocolMessage::def_number(
            "CCD Simulator",
            names::CCD_EXPOSURE,
            PropertyState::Idle,
            &[(names::CCD_EXPOSURE_VALUE, 0.0)],
        ));
        (Camera::new(device).unwrap(), rx)
    }

    fn exposure_set(state: PropertyState, remaining: f64) -> ProtocolMessage {
        ProtocolMessage::set_number(
            "CCD Simulator",
            names::CCD_EXPOSURE,
            state,
            &[(names::CCD_EXPOSURE_VALUE, remaining)],
        )
    }

    #[tokio::test]
    async fn exposure_completes_on_ok() {
        let (camera, _rx) = camera();
        let device = Arc::clone(camera.device());
        let task = CameraExposureTask::new(camera, Duration::from_secs(2), Some(Duration::from_secs(5)));
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&exposure_set(PropertyState::Busy, 1.0));
        device.handle_message(&exposure_set(PropertyState::Ok, 0.0));

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Completed);
        assert!(device.handlers().is_empty());
    }

    #[tokio::test]
    async fn external_abort_is_a_fault() {
        let (camera, _rx) = camera();
        let device = Arc::clone(camera.device());
        let task = CameraExposureTask::new(camera, Duration::from_secs(2), Some(Duration::from_secs(5)));
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&exposure_set(PropertyState::Busy, 1.0));
        device.handle_message(&exposure_set(PropertyState::Idle, 0.0));

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::CompletedWithFault);
    }

    #[tokio::test]
    async fn cancelled_exposure_sends_abort() {
        let (camera, mut rx) = camera();
        let task = CameraExposureTask::new(camera, Duration::from_secs(2), None);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        assert_eq!(task.execute(token).await.unwrap(), TaskOutcome::Cancelled);

        let mut sent = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            sent.push(cmd.name().to_string());
        }
        assert_eq!(sent, vec![names::CCD_EXPOSURE, names::CCD_ABORT_EXPOSURE]);
    }

    #[tokio::test]
    async fn sequence_counts_frames_and_aggregates_faults() {
        let (camera, _rx) = camera();
        let device = Arc::clone(camera.device());
        let task = Arc::new(CaptureSequenceTask::new(
            camera,
            2,
            Duration::from_secs(1),
            Duration::ZERO,
            Some(Duration::from_secs(5)),
        ));
        let runner = Arc::clone(&task);
        let run = tokio::spawn(async move { runner.execute(CancellationToken::new()).await });

        // first frame confirms, second faults
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&exposure_set(PropertyState::Busy, 1.0));
        device.handle_message(&exposure_set(PropertyState::Ok, 0.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&exposure_set(PropertyState::Busy, 1.0));
        device.handle_message(&exposure_set(PropertyState::Alert, 0.0));

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::CompletedWithFault);
        assert_eq!(task.frames_completed(), 2);
        assert_eq!(task.progress(), Some(1.0));
    }
}
