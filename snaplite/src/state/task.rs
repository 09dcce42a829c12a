//! Task entity: the atomic unit of work executed by the runner.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snaplite_shared::errors::{SnapError, SnapResult};

use super::status::Status;

/// Maximum number of log entries retained per task. Older entries are
/// dropped from the front once the cap is reached.
const MAX_LOG_ENTRIES: usize = 10;

/// A single timestamped log line attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogKind {
    Info,
    Error,
}

/// Unit of work inside a change.
///
/// Tasks reference each other and their parent change by id string; the
/// references are resolved against the owning [`State`](super::State) on
/// each access, so serialization stays flat and ownership acyclic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    id: String,
    kind: String,
    summary: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_id: Option<String>,
    /// Incoming edges: ids of tasks that must be done before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    wait_tasks: Vec<String>,
    /// Outgoing edges, denormalized: ids of tasks waiting on this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    halt_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    data: BTreeMap<String, serde_json::Value>,
    /// (current, total) progress; None means indeterminate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<(u64, u64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    retries: u32,
    /// Do not run before this instant; set when a handler returns Retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Task {
    pub(super) fn new(id: String, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            change_id: None,
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            log: Vec::new(),
            data: BTreeMap::new(),
            progress: None,
            error: None,
            retries: 0,
            scheduled_at: None,
            spawn_time: now,
            ready_time: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Set the task status. Stamps the ready time on the first transition
    /// into a terminal status and clears it when work resumes.
    pub fn set_status(&mut self, status: Status, now: DateTime<Utc>) {
        self.status = status;
        if status.is_ready() {
            if self.ready_time.is_none() {
                self.ready_time = Some(now);
            }
        } else {
            self.ready_time = None;
        }
    }

    pub fn change_id(&self) -> Option<&str> {
        self.change_id.as_deref()
    }

    pub(super) fn set_change_id(&mut self, change_id: &str) {
        self.change_id = Some(change_id.to_string());
    }

    pub fn wait_tasks(&self) -> &[String] {
        &self.wait_tasks
    }

    /// Ids of the tasks that wait on this one.
    pub fn halt_tasks(&self) -> &[String] {
        &self.halt_tasks
    }

    pub(super) fn push_wait(&mut self, id: &str) {
        if !self.wait_tasks.iter().any(|w| w == id) {
            self.wait_tasks.push(id.to_string());
        }
    }

    pub(super) fn push_halt(&mut self, id: &str) {
        if !self.halt_tasks.iter().any(|h| h == id) {
            self.halt_tasks.push(id.to_string());
        }
    }

    pub fn progress(&self) -> Option<(u64, u64)> {
        self.progress
    }

    pub fn set_progress(&mut self, current: u64, total: u64) {
        self.progress = Some((current, total));
    }

    /// Append an informational log line.
    pub fn logf(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.push_log(LogKind::Info, message.into(), now);
    }

    /// Append an error log line and record it as the last observed error.
    pub fn errorf(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.error = Some(message.clone());
        self.push_log(LogKind::Error, message, now);
    }

    fn push_log(&mut self, kind: LogKind, message: String, now: DateTime<Utc>) {
        if self.log.len() >= MAX_LOG_ENTRIES {
            self.log.remove(0);
        }
        self.log.push(LogEntry {
            time: now,
            kind,
            message,
        });
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// The last error recorded via [`errorf`](Task::errorf), verbatim.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Record a retry and return the new count.
    pub fn bump_retries(&mut self, after: Duration, now: DateTime<Utc>) -> u32 {
        self.retries += 1;
        self.scheduled_at = Some(
            now + chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        self.retries
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.scheduled_at
    }

    /// True once any retry backoff has elapsed.
    pub fn runnable_at(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Store a value in the task's data bag.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> SnapResult<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Fetch a value from the task's data bag.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NoEntry`] when the key is absent and
    /// [`SnapError::BadEntry`] when the stored value does not decode as `T`.
    pub fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> SnapResult<T> {
        let value = self.data.get(key).ok_or_else(|| SnapError::NoEntry {
            key: key.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|e| SnapError::BadEntry {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}
