#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! carwatch-live — real-time task-progress and queue-status client.
//!
//! Keeps live websocket subscriptions to a scraping backend's progress and
//! queue streams synchronized with local request state, survives drops with
//! bounded exponential backoff, and falls back to HTTP polling while the
//! queue stream is down.
//!
//! ## Architecture
//!
//! ```text
//! endpoints.rs    — ws/wss stream URLs derived from the HTTP API base URL
//! status.rs       — ConnectionStatus + reconnect state machine phase
//! subscribers.rs  — copy-on-iterate listener registry
//! backoff.rs      — ReconnectPolicy (exponential, capped, bounded attempts)
//! rate_limit.rs   — AttemptLedger (per-minute attempt cap)
//! connection.rs   — one websocket: coalesced connect, reconnect, watchdog
//! queue.rs        — shared queue-status channel
//! progress.rs     — multiplexed per-task channel with admission gates
//! models.rs       — QueueStatus, TaskProgress, RequestRecord
//! client.rs       — Backend trait + reqwest ApiClient
//! debounce.rs     — trailing-edge call coalescing
//! coordinator.rs  — request state, sweep, terminal reconcile, polling fallback
//! config.rs       — TOML + env-var configuration
//! error.rs        — error types
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod debounce;
pub mod endpoints;
pub mod error;
pub mod models;
pub mod progress;
pub mod queue;
pub mod rate_limit;
pub mod status;
pub mod subscribers;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root for convenience.
pub use client::{ApiClient, Backend};
pub use config::Config;
pub use connection::{Connection, ConnectionOptions};
pub use coordinator::{Coordinator, CoordinatorSettings, LiveIndicator};
pub use models::{QueueStatus, RequestRecord, TaskProgress, TaskStatus};
pub use progress::{ProgressLimits, Rejection, TaskKey, TaskProgressChannel};
pub use queue::QueueStatusChannel;
pub use status::{ConnectionStatus, LinkPhase};
