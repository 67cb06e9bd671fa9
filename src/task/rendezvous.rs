use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// What a device-event watcher reports back to a waiting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The hardware finished the commanded operation.
    Confirmed,
    /// The hardware reported a fault (or an external abort).
    Fault,
}

/// How a confirmation wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Confirmed,
    Fault,
    Cancelled,
    TimedOut,
}

/// Single-slot resettable signal between a task and its event watcher.
///
/// The task arms it before issuing a command, the watcher releases it
/// exactly once when the hardware confirms, and the wait races the
/// release against cancellation and an optional timeout. At most one
/// wait can be in flight; arming twice is an error, which makes the
/// at-most-one invariant checkable at the call site.
#[derive(Debug, Default)]
pub struct Rendezvous {
    slot: Mutex<Option<oneshot::Sender<Confirmation>>>,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the rendezvous and obtain the waiter for it.
    pub fn arm(self: &Arc<Self>) -> Result<Waiter> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::ConfirmationInFlight);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(Waiter {
            rendezvous: Arc::clone(self),
            rx,
        })
    }

    /// Deliver the confirmation. Safe to call from a synchronous event
    /// handler. Returns false when nothing is armed (already released,
    /// cancelled or timed out), which callers treat as stale and ignore.
    pub fn release(&self, confirmation: Confirmation) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(confirmation).is_ok(),
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn disarm(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Receiving half of an armed [`Rendezvous`]. Dropping it disarms the
/// slot so the rendezvous can be armed again.
#[derive(Debug)]
pub struct Waiter {
    rendezvous: Arc<Rendezvous>,
    rx: oneshot::Receiver<Confirmation>,
}

impl Waiter {
    /// Wait for the release, the cancellation token, or the timeout,
    /// whichever comes first. Always returns within the timeout bound
    /// once the token is cancelled.
    pub async fn wait(
        mut self,
        token: &CancellationToken,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        let deadline = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = &mut self.rx => match result {
                Ok(Confirmation::Confirmed) => WaitOutcome::Confirmed,
                Ok(Confirmation::Fault) => WaitOutcome::Fault,
                // sender vanished without a confirmation
                Err(_) => WaitOutcome::Cancelled,
            },
            _ = token.cancelled() => WaitOutcome::Cancelled,
            _ = deadline => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rendezvous.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_confirms_the_waiter() {
        let rendezvous = Arc::new(Rendezvous::new());
        let waiter = rendezvous.arm().unwrap();
        assert!(rendezvous.release(Confirmation::Confirmed));
        let outcome = waiter.wait(&CancellationToken::new(), None).await;
        assert_eq!(outcome, WaitOutcome::Confirmed);
        assert!(!rendezvous.is_armed());
    }

    #[tokio::test]
    async fn arming_twice_is_rejected_until_disarm() {
        let rendezvous = Arc::new(Rendezvous::new());
        let waiter = rendezvous.arm().unwrap();
        assert!(matches!(rendezvous.arm(), Err(Error::ConfirmationInFlight)));
        drop(waiter);
        assert!(rendezvous.arm().is_ok());
    }

    #[tokio::test]
    async fn cancellation_unblocks_the_wait() {
        let rendezvous = Arc::new(Rendezvous::new());
        let waiter = rendezvous.arm().unwrap();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let outcome = waiter.wait(&token, None).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        // the slot is free again
        assert!(rendezvous.arm().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_a_distinct_outcome() {
        let rendezvous = Arc::new(Rendezvous::new());
        let waiter = rendezvous.arm().unwrap();
        let outcome = waiter
            .wait(&CancellationToken::new(), Some(Duration::from_secs(60)))
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        // a release after timeout is stale
        assert!(!rendezvous.release(Confirmation::Confirmed));
    }

    #[tokio::test]
    async fn fault_release_is_distinguished() {
        let rendezvous = Arc::new(Rendezvous::new());
        let waiter = rendezvous.arm().unwrap();
        rendezvous.release(Confirmation::Fault);
        let outcome = waiter.wait(&CancellationToken::new(), None).await;
        assert_eq!(outcome, WaitOutcome::Fault);
    }
}
