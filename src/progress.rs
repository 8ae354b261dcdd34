//! Multiplexed task-progress channel.
//!
//! One [`Connection`] per tracked task, all sharing a concurrency cap, the
//! global [`AttemptLedger`] and per-task duplicate suppression. Every event is
//! delivered to every subscriber; consumers filter by `task_id`.
//!
//! ## Admission
//!
//! [`TaskProgressChannel::connect`] checks, in order:
//!
//! 1. an open connection for the same task: `true`, no new attempt;
//! 2. the per-minute attempt cap ([`Rejection::RateLimited`]);
//! 3. an attempt for the same task inside the duplicate window
//!    ([`Rejection::Duplicate`]);
//! 4. the concurrency cap ([`Rejection::AtCapacity`]).
//!
//! Nothing is recorded unless all four pass. The base URL is validated first,
//! so a malformed URL never consumes an attempt slot.
//!
//! All bookkeeping is keyed by [`TaskKey`], so tasks on different backends
//! never collide. A managed connection holds its slot while opening, open or
//! waiting to reconnect, and releases it when it goes idle or exhausts its
//! retry budget.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Connection, ConnectionOptions};
use crate::endpoints;
use crate::error::EndpointError;
use crate::models::TaskProgress;
use crate::rate_limit::AttemptLedger;
use crate::status::{ConnectionStatus, LinkPhase};
use crate::subscribers::{SubscriptionId, Subscribers};

/// Identity of one task stream: normalized API base URL plus task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub base_url: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(base_url: &str, task_id: &str) -> Result<Self, EndpointError> {
        Ok(Self {
            base_url: endpoints::normalize_base(base_url)?,
            task_id: task_id.to_string(),
        })
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.task_id, self.base_url)
    }
}

/// Why an admission gate turned a connect attempt away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    Duplicate,
    AtCapacity,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RateLimited => "attempt rate limit reached",
            Self::Duplicate => "attempted too recently",
            Self::AtCapacity => "connection cap reached",
        })
    }
}

/// Admission budget shared by all task streams.
#[derive(Debug, Clone, Copy)]
pub struct ProgressLimits {
    pub max_connections: usize,
    pub attempts_per_minute: usize,
    pub duplicate_window: Duration,
}

impl Default for ProgressLimits {
    fn default() -> Self {
        Self {
            max_connections: 3,
            attempts_per_minute: 10,
            duplicate_window: Duration::from_secs(10),
        }
    }
}

pub struct TaskProgressChannel {
    shared: Arc<Shared>,
}

struct Managed {
    /// Distinguishes this connection from a later one for the same key.
    id: u64,
    conn: Arc<Connection>,
}

struct State {
    tasks: HashMap<TaskKey, Managed>,
    ledger: AttemptLedger,
    last_attempt: HashMap<TaskKey, Instant>,
}

struct Shared {
    limits: ProgressLimits,
    options: ConnectionOptions,
    state: Mutex<State>,
    next_id: AtomicU64,
    events: Subscribers<TaskProgress>,
    status_events: Subscribers<(TaskKey, ConnectionStatus)>,
}

enum Admission {
    AlreadyOpen,
    Open(Arc<Connection>),
}

impl TaskProgressChannel {
    pub fn new(limits: ProgressLimits, options: ConnectionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                limits,
                options,
                state: Mutex::new(State {
                    tasks: HashMap::new(),
                    ledger: AttemptLedger::new(limits.attempts_per_minute),
                    last_attempt: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                events: Subscribers::new(),
                status_events: Subscribers::new(),
            }),
        }
    }

    pub fn limits(&self) -> ProgressLimits {
        self.shared.limits
    }

    /// Open the progress stream for `task_id` on the backend at `base_url`.
    ///
    /// `false` for an invalid base URL, an admission rejection, or a failed
    /// open (which keeps retrying in the background under the reconnect
    /// policy).
    pub async fn connect(&self, base_url: &str, task_id: &str) -> bool {
        let (key, url) = match resolve(base_url, task_id) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("task {task_id}: {e}");
                return false;
            }
        };
        match self.shared.admit(&key) {
            Ok(Admission::AlreadyOpen) => true,
            Ok(Admission::Open(conn)) => conn.connect(url.as_str()).await,
            Err(rejection) => {
                debug!("task {key}: connect rejected: {rejection}");
                false
            }
        }
    }

    /// Close one task stream and forget its duplicate-suppression state.
    pub fn disconnect(&self, key: &TaskKey) {
        let removed = {
            let mut state = self.shared.state();
            state.last_attempt.remove(key);
            state.tasks.remove(key)
        };
        if let Some(managed) = removed {
            info!("task {key}: unsubscribed");
            managed.conn.disconnect();
        }
    }

    /// Close `task_id`'s stream on every backend it is tracked on.
    pub fn disconnect_task(&self, task_id: &str) {
        let keys: Vec<TaskKey> = {
            let state = self.shared.state();
            state
                .tasks
                .keys()
                .chain(state.last_attempt.keys())
                .filter(|k| k.task_id == task_id)
                .cloned()
                .collect()
        };
        for key in keys {
            self.disconnect(&key);
        }
    }

    pub fn disconnect_all(&self) {
        let removed: Vec<(TaskKey, Managed)> = {
            let mut state = self.shared.state();
            state.last_attempt.clear();
            state.tasks.drain().collect()
        };
        if !removed.is_empty() {
            info!("progress: closing {} task streams", removed.len());
        }
        for (_, managed) in removed {
            managed.conn.disconnect();
        }
    }

    /// Called with every progress event from any task.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Called on every lifecycle transition of any task stream.
    pub fn subscribe_status<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&TaskKey, &ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared
            .status_events
            .subscribe(move |event: &(TaskKey, ConnectionStatus)| listener(&event.0, &event.1))
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        self.shared.status_events.unsubscribe(id)
    }

    /// Tasks currently holding a connection slot, sorted.
    pub fn active_tasks(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.shared.state().tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether `task_id` holds a slot on any backend.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.shared
            .state()
            .tasks
            .keys()
            .any(|k| k.task_id == task_id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.state().tasks.len()
    }

    pub fn status(&self, key: &TaskKey) -> Option<ConnectionStatus> {
        let conn = self
            .shared
            .state()
            .tasks
            .get(key)
            .map(|m| Arc::clone(&m.conn))?;
        Some(conn.status())
    }
}

impl Drop for TaskProgressChannel {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn resolve(base_url: &str, task_id: &str) -> Result<(TaskKey, Url), EndpointError> {
    let key = TaskKey::new(base_url, task_id)?;
    let url = endpoints::task_progress_url(&key.base_url, task_id)?;
    Ok((key, url))
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(self: &Arc<Self>, key: &TaskKey) -> Result<Admission, Rejection> {
        let mut state = self.state();
        let existing = state.tasks.get(key).map(|m| Arc::clone(&m.conn));
        if existing.as_ref().is_some_and(|conn| conn.is_connected()) {
            return Ok(Admission::AlreadyOpen);
        }

        let wall = Utc::now();
        if !state.ledger.has_room_at(wall) {
            return Err(Rejection::RateLimited);
        }

        let now = Instant::now();
        let window = self.limits.duplicate_window;
        state
            .last_attempt
            .retain(|_, at| now.duration_since(*at) < window);
        if state.last_attempt.contains_key(key) {
            return Err(Rejection::Duplicate);
        }

        if existing.is_none() && state.tasks.len() >= self.limits.max_connections {
            return Err(Rejection::AtCapacity);
        }

        state.ledger.record_at(wall);
        state.last_attempt.insert(key.clone(), now);
        let conn = match existing {
            Some(conn) => conn,
            None => {
                let managed = self.manage(key);
                let conn = Arc::clone(&managed.conn);
                state.tasks.insert(key.clone(), managed);
                conn
            }
        };
        Ok(Admission::Open(conn))
    }

    /// Build a connection for `key` wired into the channel's subscribers.
    fn manage(self: &Arc<Self>, key: &TaskKey) -> Managed {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(format!("task {}", key.task_id), self.options.clone());

        let weak: Weak<Self> = Arc::downgrade(self);
        let task_id = key.task_id.clone();
        conn.subscribe(move |payload| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match TaskProgress::from_payload(&task_id, payload) {
                Ok(progress) => shared.events.emit(&progress),
                Err(e) => warn!("task {task_id}: dropping unexpected event: {e}"),
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let status_key = key.clone();
        conn.subscribe_status(move |status| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared
                .status_events
                .emit(&(status_key.clone(), status.clone()));
            if matches!(status.phase, LinkPhase::Idle | LinkPhase::Exhausted) {
                shared.release(&status_key, id);
            }
        });

        Managed {
            id,
            conn: Arc::new(conn),
        }
    }

    /// Free the slot held by connection `id`, unless `key` has since been
    /// taken over by a newer connection.
    fn release(&self, key: &TaskKey, id: u64) {
        let released = {
            let mut state = self.state();
            match state.tasks.get(key) {
                Some(managed) if managed.id == id => state.tasks.remove(key),
                _ => None,
            }
        };
        // Dropped outside the lock: the drop disconnects, which reports back here.
        if released.is_some() {
            debug!("task {key}: slot released");
        }
    }
}
