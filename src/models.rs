//! Wire and state records: queue snapshots, task progress, request records.
//!
//! Unknown fields are kept in `extra` so nothing the server sends is lost
//! when a record is re-serialized for display.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Task lifecycle status. The server's set is open-ended; unrecognized
/// values are carried through as [`TaskStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Enqueued,
    Started,
    InProgress,
    Finished,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }

    /// No further progress events are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "enqueued" => Self::Enqueued,
            "started" => Self::Started,
            "in_progress" => Self::InProgress,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate queue/worker metrics. Each snapshot replaces the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    #[serde(default, deserialize_with = "count")]
    pub active_workers: u64,
    #[serde(default, deserialize_with = "count")]
    pub total_active_messages: u64,
    #[serde(default, deserialize_with = "count")]
    pub total_stuck_messages: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-task progress event, also the shape of the authoritative detail
/// snapshot fetched over HTTP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default, deserialize_with = "string_or_number")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        deserialize_with = "opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub processed: Option<u64>,
    #[serde(
        default,
        deserialize_with = "opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(
        default,
        deserialize_with = "opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub actual_total: Option<u64>,
    #[serde(
        default,
        deserialize_with = "opt_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub items_without_phone: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskProgress {
    /// Parse a streamed payload received on `task_id`'s channel. The payload
    /// may omit its own task id.
    pub fn from_payload(task_id: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        let mut progress = Self::deserialize(payload)?;
        if progress.task_id.is_empty() {
            progress.task_id = task_id.to_string();
        }
        Ok(progress)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.as_ref().is_some_and(TaskStatus::is_terminal)
    }
}

/// A scrape/import request as held by the coordinator, keyed by `task_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, deserialize_with = "opt_count")]
    pub processed: Option<u64>,
    #[serde(default, deserialize_with = "opt_count")]
    pub total: Option<u64>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default, deserialize_with = "opt_count")]
    pub actual_total: Option<u64>,
    #[serde(default, deserialize_with = "opt_count")]
    pub items_without_phone: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestRecord {
    /// Has a task and that task has not reached a terminal status.
    pub fn is_in_flight(&self) -> bool {
        self.task_id.is_some() && !self.status.as_ref().is_some_and(TaskStatus::is_terminal)
    }

    /// Partial merge: fields present in `progress` overwrite, absent ones keep
    /// their current value.
    pub fn apply(&mut self, progress: &TaskProgress) {
        if let Some(status) = &progress.status {
            self.status = Some(status.clone());
        }
        merge(&mut self.processed, progress.processed);
        merge(&mut self.total, progress.total);
        merge(&mut self.percent, progress.percent);
        merge(&mut self.actual_total, progress.actual_total);
        merge(&mut self.items_without_phone, progress.items_without_phone);
        for (key, value) in &progress.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

fn merge<T: Copy>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

/// Counter that tolerates `null` (zero) and integral floats such as `5.0`.
fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(opt_count(deserializer)?.unwrap_or_default())
}

#[allow(clippy::cast_sign_loss, clippy::cast_precision_loss, clippy::float_cmp)]
fn opt_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let parsed = match &value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| {
        serde::de::Error::custom(format!("expected a non-negative count, got {value}"))
    })
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
