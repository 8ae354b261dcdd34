//! Application-state layer over the two channels.
//!
//! The [`Coordinator`] owns the queue-status and task-progress channels and
//! the HTTP [`Backend`], and keeps two pieces of observable state in sync:
//!
//! - the latest [`QueueStatus`], streamed when the queue socket is healthy and
//!   polled over HTTP otherwise;
//! - the user's [`RequestRecord`] list, with live progress merged in per task.
//!
//! ## Sweep
//!
//! Every time the request list is replaced (and progress streaming is
//! enabled), each in-flight task without a stream is connected through the
//! task-progress channel and its admission gates. Refused tasks are not
//! retried until the next list change.
//!
//! ## Terminal reconcile
//!
//! A streamed `finished`/`failed` event triggers one authoritative detail
//! fetch for that task. The result is merged into that task's record only,
//! the task's stream is closed, and a sweep runs to hand the freed slot to a
//! waiting task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Backend;
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::ClientError;
use crate::models::{QueueStatus, RequestRecord, TaskProgress};
use crate::progress::TaskProgressChannel;
use crate::queue::QueueStatusChannel;
use crate::status::LinkPhase;
use crate::subscribers::{SubscriptionId, Subscribers};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// HTTP API base URL. Both streams are derived from it.
    pub base_url: String,
    /// Whose request list [`Coordinator::start`] loads.
    pub user_id: Option<String>,
    pub queue_debounce: Duration,
    pub requests_debounce: Duration,
    /// Period of the HTTP queue poll while the queue stream is unhealthy.
    pub poll_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            user_id: None,
            queue_debounce: Duration::from_millis(300),
            requests_debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Live-data badge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveIndicator {
    Connected,
    Connecting,
    Disconnected,
    /// Queue stream down, data comes from HTTP polling.
    FallbackPolling,
}

pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: CoordinatorSettings,
    backend: Arc<dyn Backend>,
    queue: QueueStatusChannel,
    progress: TaskProgressChannel,
    state: Mutex<State>,
    queue_debounce: Debouncer,
    requests_debounce: Debouncer,
    request_events: Subscribers<Vec<RequestRecord>>,
    queue_events: Subscribers<QueueStatus>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    requests: Vec<RequestRecord>,
    queue_status: Option<QueueStatus>,
    progress_enabled: bool,
    /// Last queue snapshot came from HTTP and the stream has not recovered.
    polling: bool,
    /// Tasks with a terminal detail fetch in flight.
    reconciling: HashSet<String>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        backend: Arc<dyn Backend>,
        queue: QueueStatusChannel,
        progress: TaskProgressChannel,
    ) -> Self {
        let inner = Arc::new(Inner {
            queue_debounce: Debouncer::new(settings.queue_debounce),
            requests_debounce: Debouncer::new(settings.requests_debounce),
            settings,
            backend,
            queue,
            progress,
            state: Mutex::new(State {
                requests: Vec::new(),
                queue_status: None,
                progress_enabled: true,
                polling: false,
                reconciling: HashSet::new(),
            }),
            request_events: Subscribers::new(),
            queue_events: Subscribers::new(),
            poller: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.queue.subscribe(move |snapshot| {
            if let Some(inner) = weak.upgrade() {
                inner.publish_queue(snapshot.clone());
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.queue.subscribe_status(move |status| {
            if !status.is_healthy() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.state().polling = false;
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.progress.subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_task_progress(event);
            }
        });

        Self { inner }
    }

    /// Build both channels from `config`.
    pub fn from_config(config: &Config, backend: Arc<dyn Backend>) -> Self {
        Self::new(
            config.coordinator_settings(),
            backend,
            QueueStatusChannel::new(config.queue_options()),
            TaskProgressChannel::new(config.progress_limits(), config.progress_options()),
        )
    }

    /// Connect the queue stream, start the fallback poller and, when a user
    /// is configured, load their request list (which runs the first sweep).
    pub async fn start(&self) {
        let inner = &self.inner;
        if !inner.queue.connect(&inner.settings.base_url).await {
            warn!(
                "queue: stream unavailable, polling over HTTP every {}ms",
                inner.settings.poll_interval.as_millis()
            );
        }
        self.spawn_poller();
        if let Some(user_id) = inner.settings.user_id.clone() {
            inner.fetch_requests(&user_id).await;
        }
    }

    /// Stop polling and close every stream.
    pub fn shutdown(&self) {
        self.inner.teardown();
        info!("coordinator: shut down");
    }

    /// Turning streaming off closes every task stream. Turning it back on
    /// reconnects nothing until the next request-list change.
    pub fn set_progress_enabled(&self, enabled: bool) {
        let was = std::mem::replace(&mut self.inner.state().progress_enabled, enabled);
        if was != enabled {
            info!("progress streaming {}", if enabled { "enabled" } else { "disabled" });
        }
        if !enabled {
            self.inner.progress.disconnect_all();
        }
    }

    pub fn progress_enabled(&self) -> bool {
        self.inner.state().progress_enabled
    }

    /// Replace the request list and sweep.
    pub async fn set_requests(&self, requests: Vec<RequestRecord>) {
        self.inner.set_requests(requests).await;
    }

    /// Debounced HTTP queue fetch, skipped while the queue stream is healthy.
    /// `true` when a snapshot was fetched.
    pub async fn fetch_queue_status(&self) -> bool {
        self.inner.fetch_queue_status().await
    }

    /// Debounced reload of `user_id`'s request list. `true` when this call
    /// performed the reload.
    pub async fn fetch_requests(&self, user_id: &str) -> bool {
        self.inner.fetch_requests(user_id).await
    }

    /// Fetch `task_id`'s authoritative snapshot and merge it into its record.
    pub async fn check_progress(&self, task_id: &str) -> Result<TaskProgress, ClientError> {
        let detail = self.inner.backend.fetch_task_detail(task_id).await?;
        self.inner.merge(&detail);
        Ok(detail)
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.inner.state().requests.clone()
    }

    pub fn queue_status(&self) -> Option<QueueStatus> {
        self.inner.state().queue_status.clone()
    }

    pub fn indicator(&self) -> LiveIndicator {
        let status = self.inner.queue.status();
        if status.is_healthy() {
            LiveIndicator::Connected
        } else if self.inner.state().polling {
            LiveIndicator::FallbackPolling
        } else if status.connecting || status.phase == LinkPhase::Reconnecting {
            LiveIndicator::Connecting
        } else {
            LiveIndicator::Disconnected
        }
    }

    /// Called with the full list after every change.
    pub fn subscribe_requests<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&[RequestRecord]) + Send + Sync + 'static,
    {
        self.inner
            .request_events
            .subscribe(move |records: &Vec<RequestRecord>| listener(records))
    }

    /// Called with every queue snapshot, streamed or polled.
    pub fn subscribe_queue<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QueueStatus) + Send + Sync + 'static,
    {
        self.inner.queue_events.subscribe(listener)
    }

    pub fn queue(&self) -> &QueueStatusChannel {
        &self.inner.queue
    }

    pub fn progress(&self) -> &TaskProgressChannel {
        &self.inner.progress
    }

    fn spawn_poller(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.fetch_queue_status().await;
            }
        });
        let previous = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.abort();
        }
        self.progress.disconnect_all();
        self.queue.disconnect();
    }

    fn publish_queue(&self, snapshot: QueueStatus) {
        self.state().queue_status = Some(snapshot.clone());
        self.queue_events.emit(&snapshot);
    }

    async fn fetch_queue_status(&self) -> bool {
        if !self.queue_debounce.settle().await {
            return false;
        }
        if self.queue.is_healthy() {
            debug!("queue: stream healthy, skipping HTTP poll");
            return false;
        }
        match self.backend.fetch_queue_status().await {
            Ok(snapshot) => {
                self.state().polling = true;
                self.publish_queue(snapshot);
                true
            }
            Err(e) => {
                warn!("queue: HTTP poll failed: {e}");
                false
            }
        }
    }

    async fn fetch_requests(&self, user_id: &str) -> bool {
        if !self.requests_debounce.settle().await {
            return false;
        }
        match self.backend.fetch_requests(user_id).await {
            Ok(requests) => {
                self.set_requests(requests).await;
                true
            }
            Err(e) => {
                warn!("requests: fetch for user {user_id} failed: {e}");
                false
            }
        }
    }

    async fn set_requests(&self, requests: Vec<RequestRecord>) {
        let snapshot = {
            let mut state = self.state();
            state.requests = requests;
            state.requests.clone()
        };
        self.request_events.emit(&snapshot);
        self.sweep().await;
    }

    /// Close streams of tasks no longer listed, then connect every in-flight
    /// task that has no stream yet.
    async fn sweep(&self) {
        let (listed, candidates, enabled) = {
            let state = self.state();
            let listed: HashSet<String> = state
                .requests
                .iter()
                .filter_map(|r| r.task_id.clone())
                .collect();
            let mut seen = HashSet::new();
            let candidates: Vec<String> = state
                .requests
                .iter()
                .filter(|r| r.is_in_flight())
                .filter_map(|r| r.task_id.clone())
                .filter(|task_id| seen.insert(task_id.clone()))
                .collect();
            (listed, candidates, state.progress_enabled)
        };

        for key in self.progress.active_tasks() {
            if !listed.contains(&key.task_id) {
                info!("task {}: no longer listed, closing stream", key.task_id);
                self.progress.disconnect(&key);
            }
        }
        if !enabled {
            return;
        }

        let candidates: Vec<String> = candidates
            .into_iter()
            .filter(|task_id| !self.progress.is_active(task_id))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let results = join_all(candidates.iter().map(|task_id| self.open_stream(task_id))).await;
        let opened = results.iter().filter(|ok| **ok).count();
        debug!("sweep: {opened}/{} task streams opened", candidates.len());
    }

    /// Connect one task, honoring a toggle that lands while the open is in
    /// progress.
    async fn open_stream(&self, task_id: &str) -> bool {
        if !self.state().progress_enabled {
            return false;
        }
        let opened = self.progress.connect(&self.settings.base_url, task_id).await;
        if !self.state().progress_enabled {
            self.progress.disconnect_task(task_id);
            return false;
        }
        opened
    }

    fn on_task_progress(self: &Arc<Self>, event: &TaskProgress) {
        self.merge(event);
        if !event.is_terminal() {
            return;
        }
        let first = self.state().reconciling.insert(event.task_id.clone());
        if first {
            tokio::spawn(Arc::clone(self).reconcile(event.task_id.clone()));
        }
    }

    /// Merge `progress` into its task's records. Other records are untouched.
    fn merge(&self, progress: &TaskProgress) {
        let snapshot = {
            let mut state = self.state();
            let mut changed = false;
            for record in state
                .requests
                .iter_mut()
                .filter(|r| r.task_id.as_deref() == Some(progress.task_id.as_str()))
            {
                record.apply(progress);
                changed = true;
            }
            changed.then(|| state.requests.clone())
        };
        if let Some(snapshot) = snapshot {
            self.request_events.emit(&snapshot);
        }
    }

    async fn reconcile(self: Arc<Self>, task_id: String) {
        info!("task {task_id}: terminal status, fetching final snapshot");
        match self.backend.fetch_task_detail(&task_id).await {
            Ok(detail) => self.merge(&detail),
            Err(e) => warn!("task {task_id}: final snapshot fetch failed: {e}"),
        }
        self.progress.disconnect_task(&task_id);
        self.state().reconciling.remove(&task_id);
        self.sweep().await;
    }
}
