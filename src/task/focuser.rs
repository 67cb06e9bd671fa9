use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::devices::Focuser;
use crate::error::Result;
use crate::event::{DeviceEvent, DeviceEventHandler};
use crate::property::{names, PropertyState};
use crate::task::rendezvous::{Confirmation, Rendezvous};
use crate::task::{settle, Task, TaskOutcome};

struct MoveWatcher {
    device_id: String,
    target: f64,
    saw_busy: AtomicBool,
    rendezvous: Arc<Rendezvous>,
}

impl DeviceEventHandler for MoveWatcher {
    fn on_event(&self, event: &DeviceEvent) {
        let DeviceEvent::PropertyChanged { device, vector } = event else {
            return;
        };
        if device.id() != self.device_id || vector.name != names::ABS_FOCUS_POSITION {
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
                let at_target = vector
                    .number(names::FOCUS_ABSOLUTE_POSITION)
                    .is_some_and(|p| (p - self.target).abs() < 0.5);
                // short moves may settle without ever reporting busy
                if self.saw_busy.load(Ordering::SeqCst) || at_target {
                    self.rendezvous.release(Confirmation::Confirmed);
                }
            }
        }
    }
}

/// Moves an absolute focuser and waits for it to stop at the target.
pub struct FocuserMoveTask {
    name: String,
    focuser: Focuser,
    position: u32,
    rendezvous: Arc<Rendezvous>,
    timeout: Option<Duration>,
}

impl FocuserMoveTask {
    pub fn new(focuser: Focuser, position: u32, timeout: Option<Duration>) -> Self {
        Self {
            name: format!("focus {}", focuser.device().id()),
            focuser,
            position,
            rendezvous: Arc::new(Rendezvous::new()),
            timeout,
        }
    }
}

#[async_trait]
impl Task for FocuserMoveTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, token: CancellationToken) -> Result<TaskOutcome> {
        if token.is_cancelled() {
            return Ok(TaskOutcome::Cancelled);
        }
        if self.focuser.position() == Some(f64::from(self.position)) && !self.focuser.is_moving() {
            return Ok(TaskOutcome::Completed);
        }
        let waiter = self.rendezvous.arm()?;
        let handlers = Arc::clone(self.focuser.device().handlers());
        let watcher = handlers.register(Arc::new(MoveWatcher {
            device_id: self.focuser.device().id().to_string(),
            target: f64::from(self.position),
            saw_busy: AtomicBool::new(false),
            rendezvous: Arc::clone(&self.rendezvous),
        }));
        if let Err(err) = self.focuser.move_to(self.position) {
            handlers.unregister(watcher);
            return Err(err);
        }
        info!(
            focuser = %self.focuser.device().id(),
            position = self.position,
            "moving"
        );
        let outcome = waiter.wait(&token, self.timeout).await;
        handlers.unregister(watcher);
        Ok(settle(outcome, || self.focuser.abort()))
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

    fn focuser() -> (Focuser, mpsc::UnboundedReceiver<OutboundCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Device::new(
            "MoonLite",
            "MoonLite",
            DeviceKind::Focuser,
            Arc::new(tx),
            Arc::new(HandlerRegistry::new()),
            100,
        ));
        device.handle_message(&ProtocolMessage::def_number(
            "MoonLite",
            names::ABS_FOCUS_POSITION,
            PropertyState::Idle,
            &[(names::FOCUS_ABSOLUTE_POSITION, 10000.0)],
        ));
        (Focuser::new(device).unwrap(), rx)
    }

    fn position_set(state: PropertyState, position: f64) -> ProtocolMessage {
        ProtocolMessage::set_number(
            "MoonLite",
            names::ABS_FOCUS_POSITION,
            state,
            &[(names::FOCUS_ABSOLUTE_POSITION, position)],
        )
    }

    #[tokio::test]
    async fn move_completes_when_motion_stops() {
        let (focuser, _rx) = focuser();
        let device = Arc::clone(focuser.device());
        let task = FocuserMoveTask::new(focuser, 15000, Some(Duration::from_secs(5)));
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&position_set(PropertyState::Busy, 12000.0));
        device.handle_message(&position_set(PropertyState::Ok, 15000.0));

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Completed);
        assert!(device.handlers().is_empty());
    }

    #[tokio::test]
    async fn already_at_target_is_a_noop() {
        let (focuser, mut rx) = focuser();
        let task = FocuserMoveTask::new(focuser, 10000, Some(Duration::from_secs(1)));
        assert_eq!(
            task.execute(CancellationToken::new()).await.unwrap(),
            TaskOutcome::Completed
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn alert_is_a_fault() {
        let (focuser, _rx) = focuser();
        let device = Arc::clone(focuser.device());
        let task = FocuserMoveTask::new(focuser, 15000, Some(Duration::from_secs(5)));
        let run = tokio::spawn(async move { task.execute(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.handle_message(&position_set(PropertyState::Alert, 12000.0));

        assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::CompletedWithFault);
    }
}
