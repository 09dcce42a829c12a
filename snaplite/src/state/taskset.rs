//! Transient grouping of tasks used while constructing a change.

use snaplite_shared::errors::SnapResult;

use super::State;

/// Builder view over a group of tasks destined for one change.
///
/// Holds task ids only; the tasks themselves live in [`State`]. Not
/// persisted — the set exists only in the constructing caller's frame.
#[derive(Debug, Default, Clone)]
pub struct TaskSet {
    task_ids: Vec<String>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        if !self.task_ids.contains(&task_id) {
            self.task_ids.push(task_id);
        }
    }

    pub fn add_all(&mut self, other: &TaskSet) {
        for id in &other.task_ids {
            self.add_task(id.clone());
        }
    }

    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    /// Make every task in this set wait for `task_id`.
    pub fn wait_for(&self, state: &mut State, task_id: &str) -> SnapResult<()> {
        for id in &self.task_ids {
            state.add_wait(id, task_id)?;
        }
        Ok(())
    }

    /// Make every task in this set wait for every task in `other`.
    pub fn wait_all(&self, state: &mut State, other: &TaskSet) -> SnapResult<()> {
        for dep in &other.task_ids {
            self.wait_for(state, dep)?;
        }
        Ok(())
    }

    /// Attach every task in the set to the given change.
    pub fn attach(&self, state: &mut State, change_id: &str) -> SnapResult<()> {
        for id in &self.task_ids {
            state.change_add_task(change_id, id)?;
        }
        Ok(())
    }
}
