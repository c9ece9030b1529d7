//! One-shot readiness barrier.
//!
//! A [`Barrier`] aggregates named [`ReadyTask`]s and fires exactly once,
//! after it has been started and every registered task reported done.
//!
//! ```text
//! Created ──start()──► Waiting(n pending) ──last task done──► Ready
//!    │                                                          ▲
//!    └──────────── start() with no pending tasks ───────────────┘
//! ```
//!
//! ## Rules
//! - Completion is idempotent: a second `done()`/`fail()` on the same task is ignored.
//! - A failed task does not abort the others; the first error is carried
//!   into the barrier outcome.
//! - The per-task timeout only emits [`LifecycleEvent::Timeout`]; the task stays
//!   pending and the barrier keeps waiting for it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Capacity of the readiness event channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Error carried through a barrier into the ready outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ReadyError {
    message: Arc<str>,
}

impl ReadyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into().into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Observable readiness notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A task finished; `remain` lists the ids still pending.
    Stat { id: String, remain: Vec<String> },
    /// A task exceeded the barrier timeout and is still pending.
    Timeout { id: String },
    /// A task (or a hook) reported an error.
    Error(ReadyError),
}

/// Per-task state: `Pending → Done` or `Pending → TimedOut → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    TimedOut,
    Done,
}

/// Coarse barrier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Created,
    Waiting(usize),
    Ready,
}

type Outcome = Option<Result<(), ReadyError>>;

struct TaskEntry {
    id: Arc<str>,
    state: TaskState,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<u64, TaskEntry>,
    next_key: u64,
    started: bool,
    fired: bool,
    first_error: Option<ReadyError>,
}

impl State {
    fn pending_ids(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.state != TaskState::Done)
            .map(|t| t.id.to_string())
            .collect()
    }
}

struct Inner {
    name: String,
    timeout: Duration,
    state: Mutex<State>,
    outcome: watch::Sender<Outcome>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, key: u64, result: Result<(), ReadyError>) {
        let (id, remain, fire) = {
            let mut state = self.lock();
            let Some(entry) = state.tasks.get_mut(&key) else {
                return;
            };
            if entry.state == TaskState::Done {
                debug!(barrier = %self.name, id = %entry.id, "ignoring redundant completion");
                return;
            }
            entry.state = TaskState::Done;
            let id = entry.id.to_string();
            if let Err(e) = &result
                && state.first_error.is_none()
            {
                state.first_error = Some(e.clone());
            }
            let remain = state.pending_ids();
            let fire = Self::take_fire(&mut state);
            (id, remain, fire)
        };

        if let Err(e) = result {
            warn!(barrier = %self.name, id = %id, error = %e, "ready task failed");
            let _ = self.events.send(LifecycleEvent::Error(e));
        }
        info!(barrier = %self.name, id = %id, remain = ?remain, "end ready task");
        let _ = self.events.send(LifecycleEvent::Stat { id, remain });
        if let Some(outcome) = fire {
            self.fire(outcome);
        }
    }

    fn mark_timed_out(&self, key: u64) {
        let id = {
            let mut state = self.lock();
            match state.tasks.get_mut(&key) {
                Some(entry) if entry.state == TaskState::Pending => {
                    entry.state = TaskState::TimedOut;
                    entry.id.to_string()
                }
                _ => return,
            }
        };
        warn!(
            barrier = %self.name,
            id = %id,
            timeout_secs = self.timeout.as_secs_f64(),
            "ready task still unable to finish"
        );
        let _ = self.events.send(LifecycleEvent::Timeout { id });
    }

    /// Decide whether the barrier fires now; marks it fired if so.
    fn take_fire(state: &mut State) -> Option<Result<(), ReadyError>> {
        if state.fired || !state.started {
            return None;
        }
        if state.tasks.values().any(|t| t.state != TaskState::Done) {
            return None;
        }
        state.fired = true;
        Some(state.first_error.clone().map_or(Ok(()), Err))
    }

    fn fire(&self, outcome: Result<(), ReadyError>) {
        debug!(barrier = %self.name, ok = outcome.is_ok(), "barrier ready");
        self.outcome.send_replace(Some(outcome));
    }
}

/// Aggregation gate over named asynchronous tasks. Cheap to clone.
#[derive(Clone)]
pub struct Barrier {
    inner: Arc<Inner>,
}

impl Barrier {
    /// Create a barrier with its own event channel.
    ///
    /// `timeout == 0` disables the per-task timeout.
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(name, timeout, events)
    }

    /// Create a barrier that publishes into an existing event channel.
    pub fn with_events(
        name: impl Into<String>,
        timeout: Duration,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                timeout,
                state: Mutex::new(State::default()),
                outcome,
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a named task the barrier must wait for.
    ///
    /// Must be called within a tokio runtime when a timeout is configured.
    pub fn register(&self, id: impl Into<String>) -> ReadyTask {
        let id: Arc<str> = id.into().into();
        let key = {
            let mut state = self.inner.lock();
            if state.fired {
                warn!(barrier = %self.inner.name, id = %id, "task registered after barrier fired");
            }
            let key = state.next_key;
            state.next_key += 1;
            state.tasks.insert(
                key,
                TaskEntry {
                    id: Arc::clone(&id),
                    state: TaskState::Pending,
                },
            );
            key
        };
        debug!(barrier = %self.inner.name, id = %id, "registered ready task");

        if !self.inner.timeout.is_zero() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let timeout = self.inner.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = weak.upgrade() {
                    inner.mark_timed_out(key);
                }
            });
        }

        ReadyTask {
            inner: Arc::clone(&self.inner),
            key,
            id,
        }
    }

    /// Allow the barrier to fire. Fires immediately if nothing is pending.
    pub fn start(&self) {
        let fire = {
            let mut state = self.inner.lock();
            state.started = true;
            Inner::take_fire(&mut state)
        };
        if let Some(outcome) = fire {
            self.inner.fire(outcome);
        }
    }

    /// Wait until the barrier fires; yields the first task error, if any.
    pub async fn ready(&self) -> Result<(), ReadyError> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ReadyError::new(format!("barrier {} dropped", self.inner.name)))?
            .clone();
        outcome.unwrap_or(Ok(()))
    }

    pub fn is_ready(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn state(&self) -> BarrierState {
        let state = self.inner.lock();
        if state.fired {
            BarrierState::Ready
        } else if state.started {
            BarrierState::Waiting(state.pending_ids().len())
        } else {
            BarrierState::Created
        }
    }

    /// Ids of tasks that have not completed (including timed-out ones).
    pub fn pending(&self) -> Vec<String> {
        self.inner.lock().pending_ids()
    }

    /// Subscribe to stat/timeout/error notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }
}

/// Handle used by the task owner to signal completion. Cheap to clone.
///
/// Dropping a handle without completing it leaves the task pending.
#[derive(Clone)]
pub struct ReadyTask {
    inner: Arc<Inner>,
    key: u64,
    id: Arc<str>,
}

impl ReadyTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn done(&self) {
        self.inner.complete(self.key, Ok(()));
    }

    pub fn fail(&self, error: ReadyError) {
        self.inner.complete(self.key, Err(error));
    }

    pub fn complete(&self, result: Result<(), ReadyError>) {
        self.inner.complete(self.key, result);
    }

    pub fn state(&self) -> TaskState {
        self.inner
            .lock()
            .tasks
            .get(&self.key)
            .map_or(TaskState::Done, |t| t.state)
    }
}
