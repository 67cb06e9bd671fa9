pub mod camera;
pub mod focuser;
pub mod mount;
pub mod rendezvous;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::event::{DeviceEvent, DeviceEventHandler};
use crate::task::rendezvous::{Confirmation, Rendezvous, WaitOutcome};

pub use camera::{CameraExposureTask, CaptureSequenceTask};
pub use focuser::FocuserMoveTask;
pub use mount::{GuidePulseTask, MountSlewTask, MountTrackTask};

/// Terminal state of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Ran to the end with full confirmation.
    Completed,
    /// Ran to the end but the hardware reported a fault along the way.
    CompletedWithFault,
    /// Stopped early through its cancellation token.
    Cancelled,
    /// A confirmation wait expired.
    TimedOut,
}

impl TaskOutcome {
    pub fn is_fault(self) -> bool {
        self == Self::CompletedWithFault
    }
}

/// An executable unit of instrument work.
///
/// `execute` must check the token up front and return `Cancelled` with
/// no side effects if it is already cancelled, and a cancelled task must
/// return from any confirmation wait within a bounded time.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome>;

    /// Completion fraction in `[0, 1]`, when the task can estimate one.
    fn progress(&self) -> Option<f64> {
        None
    }
}

pub type TaskRef = Arc<dyn Task>;

/// Maps a finished confirmation wait to a task outcome, invoking the
/// abort action on the paths that leave hardware in motion.
fn settle(outcome: WaitOutcome, abort: impl FnOnce() -> Result<()>) -> TaskOutcome {
    match outcome {
        WaitOutcome::Confirmed => TaskOutcome::Completed,
        WaitOutcome::Fault => TaskOutcome::CompletedWithFault,
        WaitOutcome::Cancelled => {
            if let Err(err) = abort() {
                debug!(%err, "abort after cancellation failed");
            }
            TaskOutcome::Cancelled
        }
        WaitOutcome::TimedOut => {
            if let Err(err) = abort() {
                debug!(%err, "abort after timeout failed");
            }
            TaskOutcome::TimedOut
        }
    }
}

/// Runs children strictly in order. Cancellation stops the iteration at
/// the next boundary; a faulted child degrades the aggregate outcome.
pub struct SequenceTask {
    name: String,
    children: Vec<TaskRef>,
    completed: AtomicUsize,
}

impl SequenceTask {
    pub fn new(name: impl Into<String>, children: Vec<TaskRef>) -> Self {
        Self {
            name: name.into(),
            children,
            completed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Task for SequenceTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        self.completed.store(0, Ordering::SeqCst);
        let mut aggregate = TaskOutcome::Completed;
        for child in &self.children {
            if token.is_cancelled() {
                return Ok(TaskOutcome::Cancelled);
            }
            match child.execute(token.clone()).await? {
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
        if self.children.is_empty() {
            return Some(1.0);
        }
        Some(self.completed.load(Ordering::SeqCst) as f64 / self.children.len() as f64)
    }
}

/// Cancellable fixed delay.
pub struct DelayTask {
    name: String,
    duration: Duration,
}

impl DelayTask {
    pub fn new(duration: Duration) -> Self {
        Self {
            name: format!("delay {:?}", duration),
            duration,
        }
    }
}

#[async_trait]
impl Task for DelayTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(TaskOutcome::Completed),
            _ = token.cancelled() => Ok(TaskOutcome::Cancelled),
        }
    }
}

struct ConnectWatcher {
    device_id: String,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for ConnectWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Connected(device) if device.id() == self.device_id => {
                self.rendezvous.release(Confirmation::Confirmed);
            }
            DeviceEvent::ConnectionFailed(device) if device.id() == self.device_id => {
                self.rendezvous.release(Confirmation::Fault);
            }
            _ => {}
        }
    }
}

/// Asks the driver to connect the hardware and waits for the
/// `CONNECTION` vector to confirm it.
pub struct ConnectTask {
    name: String,
    device: Arc<Device>,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl ConnectTask {
    pub fn new(device: Arc<Device>, timeout: Option<Duration>) -> Self {
        Self {
            name: format!("connect {}", device.id()),
            device,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }
}

#[async_trait]
impl Task for ConnectTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        if self.device.is_connected() {
            return Ok(TaskOutcome::Completed);
        }
        let waiter = self.rendezvous.arm()?;
        let watcher = self.device.handlers().register(Arc::new(ConnectWatcher {
            device_id: self.device.id().to_string(),
            rendezvous: Arc::clone(&self.rendezvous),
        }));
        if let Err(err) = self.device.connect() {
            self.device.handlers().unregister(watcher);
            return Err(err);
        }
        let outcome = waiter.wait(&token, self.timeout).await;
        self.device.handlers().unregister(watcher);
        Ok(settle(outcome, || Ok(())))
    }
}
