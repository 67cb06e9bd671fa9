use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ControlConfig;
use crate::error::{Error, Result};
use crate::task::{TaskOutcome, TaskRef};

/// A task under scheduler management: the task itself plus execution
/// bookkeeping and the cancellation handle handed back to callers.
pub struct ScheduledTask {
    id: u64,
    task: TaskRef,
    token: CancellationToken,
    /// Completion fraction as f64 bits.
    progress: AtomicU64,
    running: AtomicBool,
    cancelled: AtomicBool,
    done: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    outcome: Mutex<Option<TaskOutcome>>,
    error: Mutex<Option<String>>,
    /// Opaque bag for callers (frame counts, target names, anything).
    data: Mutex<serde_json::Value>,
}

impl ScheduledTask {
    fn new(id: u64, task: TaskRef) -> Self {
        Self {
            id,
            task,
            token: CancellationToken::new(),
            progress: AtomicU64::new(0f64.to_bits()),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            outcome: Mutex::new(None),
            error: Mutex::new(None),
            data: Mutex::new(serde_json::Value::Null),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// The opaque cancellable handle for this execution.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::SeqCst))
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_data(&self, value: serde_json::Value) {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn data(&self) -> serde_json::Value {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_progress(&self, value: f64) {
        self.progress
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    fn mark_started(&self) {
        self.running.store(true, Ordering::SeqCst);
        *self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    fn finish(&self, outcome: Option<TaskOutcome>, error: Option<String>) {
        if let Some(outcome) = outcome {
            match outcome {
                TaskOutcome::Completed | TaskOutcome::CompletedWithFault => {
                    self.set_progress(1.0);
                }
                TaskOutcome::Cancelled => {
                    self.cancelled.store(true, Ordering::SeqCst);
                }
                TaskOutcome::TimedOut => {}
            }
            *self
                .outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        }
        if let Some(error) = error {
            *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        }
        self.running.store(false, Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
        *self
            .finished_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.task.name().to_string(),
            progress: self.progress(),
            running: self.is_running(),
            done: self.is_done(),
            cancelled: self.is_cancelled(),
            outcome: self.outcome(),
            error: self.error(),
            started_at: *self
                .started_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            finished_at: *self
                .finished_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            data: self.data(),
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("name", &self.task.name())
            .field("running", &self.is_running())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Serializable view of a [`ScheduledTask`] for external query surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub name: String,
    pub progress: f64,
    pub running: bool,
    pub done: bool,
    pub cancelled: bool,
    pub outcome: Option<TaskOutcome>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
}

/// Start/finish notifications published to subscribers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskStarted(TaskSnapshot),
    TaskFinished(TaskSnapshot),
}

#[derive(Default)]
struct SchedState {
    queue: VecDeque<Arc<ScheduledTask>>,
    running: Option<Arc<ScheduledTask>>,
}

struct SchedulerInner {
    /// Queue and running slot share one lock so a stop can never race
    /// the worker's dequeue.
    state: Mutex<SchedState>,
    queued: Notify,
    /// Pause parties: the gate is closed while the count is nonzero.
    pause: watch::Sender<usize>,
    events: broadcast::Sender<SchedulerEvent>,
    finished: Mutex<VecDeque<Arc<ScheduledTask>>>,
    finished_capacity: usize,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SchedulerInner {
    fn state(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_finished(&self, scheduled: &Arc<ScheduledTask>) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        finished.push_back(Arc::clone(scheduled));
        while finished.len() > self.finished_capacity {
            finished.pop_front();
        }
    }
}

/// Strict single-flight FIFO task executor.
///
/// One dedicated worker runs at most one task at a time, in submission
/// order. Pausing gates the start of the next task and never interrupts
/// the running one. A task that errors or panics is recorded and the
/// worker moves on.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the scheduler and spawn its worker on the current runtime.
    pub fn start(config: &ControlConfig) -> Self {
        let (pause, _) = watch::channel(0usize);
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedState::default()),
            queued: Notify::new(),
            pause,
            events,
            finished: Mutex::new(VecDeque::new()),
            finished_capacity: config.finished_history.max(1),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(Self::run(Arc::clone(&inner)));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a task. It runs once everything ahead of it has finished.
    pub fn submit(&self, task: TaskRef) -> Result<Arc<ScheduledTask>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let scheduled = Arc::new(ScheduledTask::new(id, task));
        debug!(id, name = scheduled.name(), "task submitted");
        self.inner.state().queue.push_back(Arc::clone(&scheduled));
        self.inner.queued.notify_one();
        Ok(scheduled)
    }

    /// Stop one task: cancel it if it is the running one, remove it from
    /// the queue (recording it as cancelled) if it has not started yet.
    pub fn stop(&self, scheduled: &Arc<ScheduledTask>) {
        let removed = {
            let mut state = self.inner.state();
            if state
                .running
                .as_ref()
                .is_some_and(|r| r.id == scheduled.id)
            {
                info!(id = scheduled.id, "cancelling running task");
                scheduled.token.cancel();
                None
            } else if let Some(pos) = state.queue.iter().position(|t| t.id == scheduled.id) {
                state.queue.remove(pos)
            } else {
                None
            }
        };
        if let Some(removed) = removed {
            info!(id = removed.id, "removed queued task");
            removed.cancelled.store(true, Ordering::SeqCst);
            removed.finish(Some(TaskOutcome::Cancelled), None);
            self.inner.record_finished(&removed);
            let _ = self
                .inner
                .events
                .send(SchedulerEvent::TaskFinished(removed.snapshot()));
        }
    }

    /// Register a pause party. The gate stays closed until every party
    /// has unpaused. The running task is never interrupted.
    pub fn pause(&self) {
        self.inner.pause.send_modify(|parties| *parties += 1);
    }

    pub fn unpause(&self) {
        self.inner
            .pause
            .send_modify(|parties| *parties = parties.saturating_sub(1));
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.pause.borrow() > 0
    }

    /// Snapshots of finished, then running, then queued tasks.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let mut out: Vec<TaskSnapshot> = self
            .inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.snapshot())
            .collect();
        let state = self.inner.state();
        if let Some(running) = &state.running {
            out.push(running.snapshot());
        }
        out.extend(state.queue.iter().map(|t| t.snapshot()));
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel the running task, drop the queue and stop the worker.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let mut state = self.inner.state();
        if let Some(running) = &state.running {
            running.token.cancel();
        }
        state.queue.clear();
        drop(state);
        self.inner.queued.notify_one();
        // The worker observes the shutdown token and exits on its own
        // once the running task has been recorded.
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            drop(worker);
        }
        info!("scheduler shut down");
    }

    async fn run(inner: Arc<SchedulerInner>) {
        let mut pause_rx = inner.pause.subscribe();
        loop {
            if inner.shutdown.is_cancelled() {
                return;
            }
            // Gate the next start on the pause parties.
            tokio::select! {
                result = pause_rx.wait_for(|parties| *parties == 0) => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = inner.shutdown.cancelled() => return,
            }

            let popped = {
                let mut state = inner.state();
                match state.queue.pop_front() {
                    Some(next) => {
                        next.mark_started();
                        state.running = Some(Arc::clone(&next));
                        Some(next)
                    }
                    None => None,
                }
            };
            let scheduled = match popped {
                Some(next) => next,
                None => {
                    tokio::select! {
                        _ = inner.queued.notified() => {}
                        _ = inner.shutdown.cancelled() => return,
                    }
                    continue;
                }
            };

            info!(id = scheduled.id, name = scheduled.name(), "task started");
            let _ = inner
                .events
                .send(SchedulerEvent::TaskStarted(scheduled.snapshot()));

            // Single execution slot. The spawn isolates panics from the
            // worker loop.
            let task = Arc::clone(&scheduled.task);
            let token = scheduled.token.clone();
            let mut join = tokio::spawn(async move { task.execute(token).await });
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let result = loop {
                tokio::select! {
                    result = &mut join => break result,
                    _ = ticker.tick() => {
                        if let Some(progress) = scheduled.task.progress() {
                            scheduled.set_progress(progress);
                        }
                    }
                }
            };

            match result {
                Ok(Ok(outcome)) => {
                    info!(id = scheduled.id, ?outcome, "task finished");
                    scheduled.finish(Some(outcome), None);
                }
                Ok(Err(err)) => {
                    error!(id = scheduled.id, %err, "task failed");
                    scheduled.finish(None, Some(err.to_string()));
                }
                Err(join_err) => {
                    error!(id = scheduled.id, %join_err, "task panicked");
                    scheduled.finish(None, Some(join_err.to_string()));
                }
            }

            inner.state().running = None;
            inner.record_finished(&scheduled);
            let _ = inner
                .events
                .send(SchedulerEvent::TaskFinished(scheduled.snapshot()));
        }
    }
}
