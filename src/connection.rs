//! WebSocket connection with status tracking and automatic reconnect.
//!
//! A [`Connection`] owns at most one live socket. Incoming text frames are
//! parsed as JSON: payloads with a top-level `error` string update
//! [`ConnectionStatus::error`], everything else goes to data subscribers.
//!
//! Opening a socket runs in a background task. Callers of [`Connection::connect`]
//! that arrive while an attempt is in flight wait for that attempt's outcome
//! instead of starting another one.
//!
//! An unexpected close (anything but a normal-closure frame) feeds the
//! [`ReconnectPolicy`]: retries are scheduled with exponential backoff until
//! the attempt cap is reached. [`Connection::disconnect`] disarms everything in
//! one step: the pending retry timer, the in-flight open (and its timeout) and
//! the live socket. Every background task carries the epoch it was started
//! in and re-checks it under the lock before acting, so a timer that was
//! already due when `disconnect` ran can never revive the link.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::status::{ConnectionStatus, LinkPhase};
use crate::subscribers::{SubscriptionId, Subscribers};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Abort an open attempt that has not completed the handshake in time.
    pub open_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Treat a socket that stays silent this long as failed. `None` disables
    /// the watchdog: an open but quiet connection counts as healthy.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            idle_timeout: None,
        }
    }
}

/// One logical streaming endpoint.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// `label` prefixes log lines (e.g. `"queue"` or `"task 42"`).
    pub fn new(label: impl Into<String>, options: ConnectionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                options,
                link: Mutex::new(LinkState::default()),
                status: Mutex::new(ConnectionStatus::default()),
                status_subscribers: Subscribers::new(),
                data_subscribers: Subscribers::new(),
            }),
        }
    }

    /// Open the socket at `url` (`ws://` or `wss://`).
    ///
    /// Returns `true` once open, immediately if already open. Returns `false`
    /// for an unusable URL, a failed or timed-out handshake (which also arms
    /// automatic reconnection), or a `disconnect` that raced the attempt.
    pub async fn connect(&self, url: &str) -> bool {
        let url = match Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "ws" | "wss") => u,
            Ok(u) => {
                self.shared
                    .fail_fast(format!("unsupported streaming scheme {:?}", u.scheme()));
                return false;
            }
            Err(e) => {
                self.shared
                    .fail_fast(format!("invalid streaming URL {url:?}: {e}"));
                return false;
            }
        };
        self.shared.open(url, Trigger::Explicit).await
    }

    /// Close with a normal-closure frame and disarm reconnection. Idempotent.
    pub fn disconnect(&self) {
        self.shared.disconnect("client disconnect");
    }

    /// Queue a text frame on the open socket. `false` when not connected.
    pub fn send(&self, text: impl Into<String>) -> bool {
        let link = self.shared.link();
        match &link.io {
            Some(io) => io.commands.try_send(Outbound::Text(text.into())).is_ok(),
            None => false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status().connected
    }

    pub fn url(&self) -> Option<Url> {
        self.shared.link().url.clone()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Called with a status snapshot on every lifecycle transition.
    pub fn subscribe_status<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.status_subscribers.subscribe(listener)
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        self.shared.status_subscribers.unsubscribe(id)
    }

    /// Called with every parsed, non-error payload.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.data_subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.data_subscribers.unsubscribe(id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.disconnect("connection dropped");
    }
}

/// Why an open attempt is being started.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Explicit,
    /// Backoff timer scheduled in the given epoch.
    Retry(u64),
}

enum Outbound {
    Text(String),
    Close(String),
}

struct IoHandle {
    commands: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    url: Option<Url>,
    /// Armed by `connect`, disarmed by `disconnect` and exhaustion.
    should_reconnect: bool,
    /// Bumped by every `disconnect`; background tasks from older epochs are stale.
    epoch: u64,
    in_flight: Option<watch::Receiver<Option<bool>>>,
    opening: Option<JoinHandle<()>>,
    io: Option<IoHandle>,
    retry: Option<JoinHandle<()>>,
}

/// How a live socket ended.
enum LinkEnd {
    Normal(String),
    Abnormal(String),
}

struct Shared {
    label: String,
    options: ConnectionOptions,
    // Lock order: `link` before `status`.
    link: Mutex<LinkState>,
    status: Mutex<ConnectionStatus>,
    status_subscribers: Subscribers<ConnectionStatus>,
    data_subscribers: Subscribers<Value>,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, snapshot: Option<ConnectionStatus>) {
        if let Some(snapshot) = snapshot {
            self.status_subscribers.emit(&snapshot);
        }
    }

    fn fail_fast(&self, message: String) {
        warn!("{}: {message}", self.label);
        let snapshot = {
            let mut status = self.status();
            status.error = Some(message);
            status.clone()
        };
        self.status_subscribers.emit(&snapshot);
    }

    async fn open(self: &Arc<Self>, url: Url, trigger: Trigger) -> bool {
        let (mut outcome, snapshot) = {
            let mut link = self.link();
            let mut status = self.status();

            if status.connected {
                return true;
            }

            if let Trigger::Retry(epoch) = trigger {
                if link.epoch != epoch
                    || !link.should_reconnect
                    || status.phase != LinkPhase::Reconnecting
                {
                    debug!("{}: stale reconnect timer ignored", self.label);
                    return false;
                }
                link.retry = None;
            }

            // Join an attempt that is already running, unless its task died.
            let running = link
                .in_flight
                .as_ref()
                .filter(|rx| rx.has_changed().is_ok())
                .cloned();
            if let Some(rx) = running {
                (rx, None)
            } else {
                if let Some(retry) = link.retry.take() {
                    retry.abort();
                }
                if matches!(trigger, Trigger::Explicit)
                    && matches!(status.phase, LinkPhase::Idle | LinkPhase::Exhausted)
                {
                    status.reconnect_attempts = 0;
                }
                link.url = Some(url.clone());
                link.should_reconnect = true;
                status.set_phase(LinkPhase::Connecting);

                let (tx, rx) = watch::channel(None);
                link.in_flight = Some(rx.clone());
                link.opening = Some(tokio::spawn(Arc::clone(self).attempt(url, link.epoch, tx)));
                (rx, Some(status.clone()))
            }
        };
        self.emit(snapshot);

        let opened = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.unwrap_or(false),
            // Attempt aborted by `disconnect`.
            Err(_) => false,
        };
        opened
    }

    async fn attempt(self: Arc<Self>, url: Url, epoch: u64, done: watch::Sender<Option<bool>>) {
        info!("{}: connecting to {url}", self.label);
        let timeout = self.options.open_timeout;
        let outcome =
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
            {
                Ok(Ok((stream, _response))) => self.on_open(stream, epoch),
                Ok(Err(e)) => self.on_open_failed(epoch, format!("connection failed: {e}")),
                Err(_) => self.on_open_failed(
                    epoch,
                    format!("connection timed out after {}ms", timeout.as_millis()),
                ),
            };
        let _ = done.send(Some(outcome));
    }

    fn on_open(self: &Arc<Self>, stream: WsStream, epoch: u64) -> bool {
        let snapshot = {
            let mut link = self.link();
            if link.epoch != epoch || !link.should_reconnect {
                debug!("{}: socket opened after disconnect, closing it", self.label);
                tokio::spawn(async move {
                    let mut stream = stream;
                    let _ = stream.close(None).await;
                });
                return false;
            }
            link.in_flight = None;
            link.opening = None;

            let (commands, rx) = mpsc::channel(256);
            let task = tokio::spawn(Arc::clone(self).io_loop(stream, rx, epoch));
            link.io = Some(IoHandle { commands, task });

            let mut status = self.status();
            status.set_phase(LinkPhase::Connected);
            status.error = None;
            status.last_connected = Some(Utc::now());
            status.reconnect_attempts = 0;
            status.clone()
        };
        info!("{}: connected", self.label);
        self.status_subscribers.emit(&snapshot);
        true
    }

    fn on_open_failed(self: &Arc<Self>, epoch: u64, message: String) -> bool {
        let snapshot = {
            let mut link = self.link();
            if link.epoch != epoch {
                return false;
            }
            link.in_flight = None;
            link.opening = None;
            warn!("{}: {message}", self.label);

            let mut status = self.status();
            status.error = Some(message);
            self.schedule_reconnect(&mut link, &mut status);
            status.clone()
        };
        self.status_subscribers.emit(&snapshot);
        false
    }

    /// Arm the backoff timer for the next attempt, or mark the link exhausted.
    /// Caller holds both locks.
    fn schedule_reconnect(self: &Arc<Self>, link: &mut LinkState, status: &mut ConnectionStatus) {
        if !link.should_reconnect {
            status.set_phase(LinkPhase::Idle);
            return;
        }
        let policy = self.options.reconnect;
        match policy.next_attempt(status.reconnect_attempts) {
            Some((attempt, delay)) => {
                info!(
                    "{}: reconnect attempt {attempt}/{} in {}ms",
                    self.label,
                    policy.max_attempts,
                    delay.as_millis()
                );
                status.reconnect_attempts = attempt;
                status.set_phase(LinkPhase::Reconnecting);

                let Some(url) = link.url.clone() else {
                    status.set_phase(LinkPhase::Idle);
                    return;
                };
                let epoch = link.epoch;
                let shared = Arc::clone(self);
                link.retry = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.open(url, Trigger::Retry(epoch)).await;
                }));
            }
            None => {
                warn!(
                    "{}: giving up after {} reconnect attempts",
                    self.label, policy.max_attempts
                );
                link.should_reconnect = false;
                status.set_phase(LinkPhase::Exhausted);
                status.error = Some(format!(
                    "max reconnection attempts ({}) reached",
                    policy.max_attempts
                ));
            }
        }
    }

    async fn io_loop(
        self: Arc<Self>,
        stream: WsStream,
        mut commands: mpsc::Receiver<Outbound>,
        epoch: u64,
    ) {
        let (mut sink, mut reader) = stream.split();
        let idle = self.options.idle_timeout;
        let mut last_inbound = tokio::time::Instant::now();

        let end = loop {
            let watchdog = idle.map(|limit| (last_inbound + limit, limit));
            tokio::select! {
                frame = next_frame(&mut reader, watchdog) => match frame {
                    Frame::Message(Message::Text(text)) => {
                        last_inbound = tokio::time::Instant::now();
                        self.handle_text(&text);
                    }
                    Frame::Message(Message::Close(frame)) => {
                        break match frame {
                            Some(f) if f.code == CloseCode::Normal => LinkEnd::Normal(f.reason.into_owned()),
                            Some(f) => LinkEnd::Abnormal(format!("closed with code {}: {}", u16::from(f.code), f.reason)),
                            None => LinkEnd::Abnormal("closed without status code".to_string()),
                        };
                    }
                    // Binary/Ping/Pong. Pings are answered by tungstenite.
                    Frame::Message(_) => last_inbound = tokio::time::Instant::now(),
                    Frame::Error(e) => break LinkEnd::Abnormal(format!("websocket error: {e}")),
                    Frame::Eof => break LinkEnd::Abnormal("connection lost".to_string()),
                    Frame::Silent(after) => {
                        break LinkEnd::Abnormal(format!("no message for {}ms", after.as_millis()));
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!("{}: send failed: {e}", self.label);
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        let _ = sink.close().await;
                        return;
                    }
                    None => return,
                },
            }
        };

        self.on_link_end(epoch, end);
    }

    fn handle_text(&self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: dropping malformed message: {e}", self.label);
                return;
            }
        };
        if let Some(error) = payload.get("error").and_then(Value::as_str) {
            warn!("{}: server error: {error}", self.label);
            let snapshot = {
                let mut status = self.status();
                status.error = Some(error.to_string());
                status.clone()
            };
            self.status_subscribers.emit(&snapshot);
            return;
        }
        self.data_subscribers.emit(&payload);
    }

    fn on_link_end(self: &Arc<Self>, epoch: u64, end: LinkEnd) {
        let snapshot = {
            let mut link = self.link();
            if link.epoch != epoch {
                return;
            }
            link.io = None;
            let mut status = self.status();
            match end {
                LinkEnd::Normal(reason) => {
                    info!("{}: closed by server ({reason})", self.label);
                    status.set_phase(LinkPhase::Idle);
                }
                LinkEnd::Abnormal(message) => {
                    warn!("{}: {message}", self.label);
                    status.error = Some(message);
                    self.schedule_reconnect(&mut link, &mut status);
                }
            }
            status.clone()
        };
        self.status_subscribers.emit(&snapshot);
    }

    fn disconnect(&self, reason: &str) {
        let snapshot = {
            let mut link = self.link();
            link.should_reconnect = false;
            link.epoch += 1;
            link.in_flight = None;
            if let Some(retry) = link.retry.take() {
                retry.abort();
            }
            if let Some(opening) = link.opening.take() {
                opening.abort();
            }
            if let Some(io) = link.io.take() {
                if io.commands.try_send(Outbound::Close(reason.to_string())).is_err() {
                    io.task.abort();
                }
            }

            let mut status = self.status();
            let before = status.clone();
            status.set_phase(LinkPhase::Idle);
            status.error = None;
            status.reconnect_attempts = 0;
            (*status != before).then(|| status.clone())
        };
        if snapshot.is_some() {
            info!("{}: disconnected ({reason})", self.label);
        }
        self.emit(snapshot);
    }
}

enum Frame {
    Message(Message),
    Error(tokio_tungstenite::tungstenite::Error),
    Eof,
    Silent(Duration),
}

async fn next_frame(
    reader: &mut futures_util::stream::SplitStream<WsStream>,
    watchdog: Option<(tokio::time::Instant, Duration)>,
) -> Frame {
    let next = match watchdog {
        Some((deadline, limit)) => match tokio::time::timeout_at(deadline, reader.next()).await {
            Ok(next) => next,
            Err(_) => return Frame::Silent(limit),
        },
        None => reader.next().await,
    };
    match next {
        Some(Ok(msg)) => Frame::Message(msg),
        Some(Err(e)) => Frame::Error(e),
        None => Frame::Eof,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{refused_url, silent_url, TestServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            open_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(50),
                max_attempts: 2,
            },
            idle_timeout: None,
        }
    }

    fn collect_data(conn: &Connection) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.subscribe(move |v| sink.lock().unwrap().push(v.clone()));
        seen
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_attempt() {
        let server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        let url = server.ws_url("/queue/status/ws");

        let (a, b, c) = tokio::join!(conn.connect(&url), conn.connect(&url), conn.connect(&url));
        assert!(a && b && c);
        assert_eq!(server.accepted(), 1);

        // Already open: no new transport attempt.
        assert!(conn.connect(&url).await);
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn error_payload_goes_to_status_not_subscribers() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        let seen = collect_data(&conn);
        assert!(conn.connect(&server.ws_url("/x")).await);
        let peer = server.next_peer().await;

        peer.send_json(json!({"error": "boom"}));
        eventually(|| conn.status().error.as_deref() == Some("boom")).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(conn.is_connected());

        let progress = json!({"processed": 5, "total": 10, "status": "running"});
        peer.send_json(progress.clone());
        eventually(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0], progress);
        // Data does not clear a server-declared error.
        assert_eq!(conn.status().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        let seen = collect_data(&conn);
        assert!(conn.connect(&server.ws_url("/x")).await);
        let peer = server.next_peer().await;

        peer.send_text("{not json");
        peer.send_json(json!({"ok": true}));
        eventually(|| seen.lock().unwrap().len() == 1).await;
        let status = conn.status();
        assert!(status.is_healthy());
    }

    #[tokio::test]
    async fn invalid_url_fails_fast() {
        let conn = Connection::new("test", fast_options());
        assert!(!conn.connect("http://127.0.0.1:1/x").await);
        assert!(!conn.connect("::nope::").await);
        let status = conn.status();
        assert_eq!(status.phase, LinkPhase::Idle);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn abrupt_drop_reconnects_and_resets_attempts() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        assert!(conn.connect(&server.ws_url("/x")).await);
        let peer = server.next_peer().await;

        peer.abort();
        let _second = server.next_peer().await;
        eventually(|| conn.is_connected()).await;
        assert_eq!(server.accepted(), 2);
        let status = conn.status();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.error.is_none());
    }

    #[tokio::test]
    async fn normal_close_from_server_does_not_reconnect() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        assert!(conn.connect(&server.ws_url("/x")).await);
        let peer = server.next_peer().await;

        peer.close_normal();
        eventually(|| conn.status().phase == LinkPhase::Idle).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn refused_connection_exhausts_retry_budget() {
        let conn = Connection::new("test", fast_options());
        let transitions = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&transitions);
        conn.subscribe_status(move |s| {
            if s.phase == LinkPhase::Reconnecting {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(!conn.connect(&refused_url().await).await);
        eventually(|| conn.status().phase == LinkPhase::Exhausted).await;
        let status = conn.status();
        assert_eq!(status.reconnect_attempts, 2);
        assert!(status.error.unwrap().contains("max reconnection attempts"));
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_timeout_counts_as_failure() {
        let (_listener, url) = silent_url().await;
        let mut options = fast_options();
        options.open_timeout = Duration::from_millis(100);
        options.reconnect.base_delay = Duration::from_secs(5);
        let conn = Connection::new("test", options);

        assert!(!conn.connect(&url).await);
        let status = conn.status();
        assert!(status.error.unwrap().contains("timed out"));
        assert_eq!(status.phase, LinkPhase::Reconnecting);
        conn.disconnect();
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_retry() {
        let mut server = TestServer::start().await;
        let mut options = fast_options();
        options.reconnect.base_delay = Duration::from_millis(100);
        let conn = Connection::new("test", options);
        assert!(conn.connect(&server.ws_url("/x")).await);
        let peer = server.next_peer().await;

        peer.abort();
        eventually(|| conn.status().phase == LinkPhase::Reconnecting).await;
        conn.disconnect();
        conn.disconnect();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.accepted(), 1);
        let status = conn.status();
        assert_eq!(status.phase, LinkPhase::Idle);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn retry_timer_from_before_disconnect_does_not_reopen() {
        let mut server = TestServer::start().await;
        let mut options = fast_options();
        options.reconnect.base_delay = Duration::from_secs(5);
        let conn = Connection::new("test", options);
        let url = server.ws_url("/x");
        assert!(conn.connect(&url).await);
        let peer = server.next_peer().await;

        peer.abort();
        eventually(|| conn.status().phase == LinkPhase::Reconnecting).await;
        let armed_in = conn.shared.link().epoch;
        conn.disconnect();

        // The timer body runs anyway, as if it was already due.
        let fired = conn
            .shared
            .open(Url::parse(&url).unwrap(), Trigger::Retry(armed_in))
            .await;
        assert!(!fired);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.accepted(), 1);
        assert_eq!(conn.status().phase, LinkPhase::Idle);
    }

    #[tokio::test]
    async fn retries_back_off_and_stop_at_the_cap() {
        let options = ConnectionOptions {
            open_timeout: Duration::from_millis(500),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(40),
                max_delay: Duration::from_millis(100),
                max_attempts: 5,
            },
            idle_timeout: None,
        };
        let policy = options.reconnect;
        let conn = Connection::new("test", options);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        conn.subscribe_status(move |s| {
            sink.lock()
                .unwrap()
                .push((tokio::time::Instant::now(), s.phase, s.reconnect_attempts));
        });

        assert!(!conn.connect(&refused_url().await).await);
        eventually(|| conn.status().phase == LinkPhase::Exhausted).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let log = log.lock().unwrap().clone();
        let opens = log.iter().filter(|(_, p, _)| *p == LinkPhase::Connecting).count();
        // One explicit open plus five automatic ones, no sixth.
        assert_eq!(opens, 6);
        assert_eq!(log.last().map(|(_, p, _)| *p), Some(LinkPhase::Exhausted));

        let mut waits = Vec::new();
        for pair in log.windows(2) {
            let ((scheduled, phase, attempt), (fired, next, _)) = (pair[0], pair[1]);
            if phase == LinkPhase::Reconnecting && next == LinkPhase::Connecting {
                waits.push((attempt, fired.duration_since(scheduled)));
            }
        }
        assert_eq!(
            waits.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        let slack = Duration::from_millis(10);
        for (attempt, waited) in waits {
            let expected = policy.delay(attempt);
            assert!(
                waited + slack >= expected,
                "attempt {attempt} fired after {waited:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn disconnect_during_open_resolves_waiters_false() {
        let (_listener, url) = silent_url().await;
        let conn = Arc::new(Connection::new("test", fast_options()));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.connect(&url).await })
        };
        eventually(|| conn.status().connecting).await;
        conn.disconnect();
        assert!(!waiter.await.unwrap());
        assert_eq!(conn.status().phase, LinkPhase::Idle);
    }

    #[tokio::test]
    async fn explicit_connect_after_exhaustion_starts_fresh() {
        let conn = Connection::new("test", fast_options());
        assert!(!conn.connect(&refused_url().await).await);
        eventually(|| conn.status().phase == LinkPhase::Exhausted).await;

        let server = TestServer::start().await;
        assert!(conn.connect(&server.ws_url("/x")).await);
        assert_eq!(conn.status().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn client_disconnect_sends_normal_close() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        assert!(conn.connect(&server.ws_url("/x")).await);
        let mut peer = server.next_peer().await;

        conn.disconnect();
        let code = peer.closed().await;
        assert_eq!(code, Some(1000));
    }

    #[tokio::test]
    async fn silent_socket_trips_watchdog() {
        let mut server = TestServer::start().await;
        let mut options = fast_options();
        options.idle_timeout = Some(Duration::from_millis(80));
        let conn = Connection::new("test", options);
        assert!(conn.connect(&server.ws_url("/x")).await);
        let _peer = server.next_peer().await;

        let _again = server.next_peer().await;
        assert_eq!(server.accepted(), 2);
        conn.disconnect();
    }

    #[tokio::test]
    async fn send_reaches_server() {
        let mut server = TestServer::start().await;
        let conn = Connection::new("test", fast_options());
        assert!(!conn.send("early"));
        assert!(conn.connect(&server.ws_url("/x")).await);
        let mut peer = server.next_peer().await;

        assert!(conn.send("ping"));
        assert_eq!(peer.recv_text().await.as_deref(), Some("ping"));
    }
}
