//! Change entity: a user-visible operation composed of a DAG of tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snaplite_shared::errors::{SnapError, SnapResult};

/// A user-visible operation persisted in state.
///
/// The change owns its tasks by id; the aggregate status is derived from
/// the task statuses by [`State::change_status`](super::State::change_status)
/// rather than stored, so the two can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    id: String,
    kind: String,
    summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    data: BTreeMap<String, serde_json::Value>,
    spawn_time: DateTime<Utc>,
    /// Stamped when the aggregate status first turns terminal; drives the
    /// pruning retention window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(super) fn new(id: String, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            task_ids: Vec::new(),
            data: BTreeMap::new(),
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

    /// Ids of the tasks belonging to this change, in insertion order.
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    pub(super) fn push_task_id(&mut self, id: &str) {
        if !self.task_ids.iter().any(|t| t == id) {
            self.task_ids.push(id.to_string());
        }
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    pub(super) fn set_ready_time(&mut self, at: Option<DateTime<Utc>>) {
        self.ready_time = at;
    }

    /// Store a value in the change's data bag.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> SnapResult<()> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Fetch a value from the change's data bag.
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
