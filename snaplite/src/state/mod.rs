//! Persistent daemon state and its transactional lock.
//!
//! The state is a single serializable tree holding changes, tasks, warnings
//! and arbitrary per-subsystem data bags. All reads and writes happen while
//! the coarse [`StateLock`] is held; releasing the lock after a mutation
//! serializes the whole tree and hands it to the registered
//! [`Checkpointer`]. A checkpoint failure aborts the process: the core never
//! acknowledges a mutation it could not persist.

mod change;
mod status;
mod task;
mod taskset;

pub use change::Change;
pub use status::Status;
pub use task::{LogEntry, LogKind, Task};
pub use taskset::TaskSet;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use snaplite_shared::errors::{SnapError, SnapResult};

/// Default retention window for terminal changes before pruning.
pub const DEFAULT_CHANGE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Warnings expire and are swept once this old.
const WARNING_EXPIRE: Duration = Duration::from_secs(28 * 24 * 60 * 60);

/// A shown warning is eligible to be shown again after this long.
const WARNING_REPEAT_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level keys that the state tree reserves for itself; subsystem bags
/// must not collide with these.
const RESERVED_KEYS: [&str; 6] = [
    "changes",
    "tasks",
    "warnings",
    "last-change-id",
    "last-task-id",
    "generation",
];

// ============================================================================
// CHECKPOINTER
// ============================================================================

/// Persistence hook invoked with the canonical serialization of the state
/// whenever the lock is released after a mutation.
pub trait Checkpointer: Send + Sync {
    fn checkpoint(&self, data: &[u8]) -> SnapResult<()>;
}

/// Checkpointer that writes the state file atomically (temp file + rename).
pub struct FileCheckpointer {
    path: PathBuf,
}

impl FileCheckpointer {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpointer for FileCheckpointer {
    fn checkpoint(&self, data: &[u8]) -> SnapResult<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| {
            SnapError::Checkpoint(format!("cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            SnapError::Checkpoint(format!(
                "cannot rename {} to {}: {}",
                tmp.display(),
                self.path.display(),
                e
            ))
        })
    }
}

/// Checkpointer that drops the data. For callers that manage persistence
/// themselves or do not need it.
pub struct NullCheckpointer;

impl Checkpointer for NullCheckpointer {
    fn checkpoint(&self, _data: &[u8]) -> SnapResult<()> {
        Ok(())
    }
}

/// In-memory checkpointer recording every snapshot; a testing twin of
/// [`FileCheckpointer`].
#[derive(Default)]
pub struct MemCheckpointer {
    snapshots: Mutex<Vec<Vec<u8>>>,
}

impl MemCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints taken so far.
    pub fn count(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// The most recent snapshot, if any.
    pub fn last(&self) -> Option<Vec<u8>> {
        self.snapshots.lock().last().cloned()
    }
}

impl Checkpointer for MemCheckpointer {
    fn checkpoint(&self, data: &[u8]) -> SnapResult<()> {
        self.snapshots.lock().push(data.to_vec());
        Ok(())
    }
}

// ============================================================================
// WARNINGS
// ============================================================================

/// An operator-visible warning, deduplicated by message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Warning {
    pub message: String,
    pub first_added: DateTime<Utc>,
    pub last_added: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shown: Option<DateTime<Utc>>,
}

// ============================================================================
// STATE TREE
// ============================================================================

/// The daemon's state tree.
///
/// Never constructed bare by callers; always reached through a
/// [`StateGuard`] handed out by [`StateLock::lock`]. Read accessors take
/// `&self`; anything taking `&mut self` marks the state dirty and is
/// checkpointed when the guard drops.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct State {
    changes: BTreeMap<String, Change>,
    tasks: BTreeMap<String, Task>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    warnings: BTreeMap<String, Warning>,
    last_change_id: u64,
    last_task_id: u64,
    generation: u64,

    /// Subsystem data bags, flattened to the top level of the state file
    /// (`snaps`, `conns`, `last-refresh`, `seeded`, ...).
    #[serde(flatten)]
    data: BTreeMap<String, serde_json::Value>,

    #[serde(skip)]
    dirty: bool,
    // Transient wake bookkeeping and cached views live behind interior
    // mutability: touching them is not a state mutation and must not
    // trigger a checkpoint.
    #[serde(skip)]
    wake_deadline: Cell<Option<Instant>>,
    #[serde(skip)]
    wake_requested: Cell<bool>,
    #[serde(skip)]
    cache: RefCell<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl State {
    pub fn new() -> Self {
        Self {
            changes: BTreeMap::new(),
            tasks: BTreeMap::new(),
            warnings: BTreeMap::new(),
            last_change_id: 0,
            last_task_id: 0,
            generation: 0,
            data: BTreeMap::new(),
            dirty: false,
            wake_deadline: Cell::new(None),
            wake_requested: Cell::new(false),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Deserialize a state tree from its canonical serialization.
    pub fn from_bytes(bytes: &[u8]) -> SnapResult<Self> {
        let state: State = serde_json::from_slice(bytes)
            .map_err(|e| SnapError::Storage(format!("cannot read state: {}", e)))?;
        Ok(state)
    }

    /// Canonical serialization: deterministic for identical logical content
    /// (all maps are ordered), so checkpoint writes are idempotent for
    /// no-op transactions.
    pub fn serialize(&self) -> SnapResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SnapError::Internal(format!("cannot serialize: {}", e)))
    }

    /// Monotonic mutation counter; bumped once per dirty transaction.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ========================================================================
    // Entity allocation and access
    // ========================================================================

    /// Allocate a new change with a unique monotonic id.
    pub fn new_change(&mut self, kind: &str, summary: &str) -> String {
        self.last_change_id += 1;
        let id = self.last_change_id.to_string();
        let change = Change::new(id.clone(), kind, summary, Utc::now());
        tracing::debug!(change_id = %id, kind = %kind, "New change");
        self.changes.insert(id.clone(), change);
        id
    }

    /// Allocate a new task with a unique monotonic id. The task is not yet
    /// attached to a change; see [`change_add_task`](State::change_add_task).
    pub fn new_task(&mut self, kind: &str, summary: &str) -> String {
        self.last_task_id += 1;
        let id = self.last_task_id.to_string();
        let task = Task::new(id.clone(), kind, summary, Utc::now());
        self.tasks.insert(id.clone(), task);
        id
    }

    pub fn change(&self, id: &str) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn change_mut(&mut self, id: &str) -> Option<&mut Change> {
        self.changes.get_mut(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// All changes, in id allocation order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        let mut all: Vec<&Change> = self.changes.values().collect();
        all.sort_by_key(|c| c.id().parse::<u64>().unwrap_or(u64::MAX));
        all.into_iter()
    }

    /// All tasks, in id allocation order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        let mut all: Vec<&Task> = self.tasks.values().collect();
        all.sort_by_key(|t| t.id().parse::<u64>().unwrap_or(u64::MAX));
        all.into_iter()
    }

    /// Attach a task to a change.
    ///
    /// # Errors
    ///
    /// Fails if either entity is missing or the task already belongs to a
    /// different change.
    pub fn change_add_task(&mut self, change_id: &str, task_id: &str) -> SnapResult<()> {
        if !self.changes.contains_key(change_id) {
            return Err(SnapError::NotFound(format!("change {}", change_id)));
        }
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| SnapError::NotFound(format!("task {}", task_id)))?;
        match task.change_id() {
            Some(existing) if existing != change_id => {
                return Err(SnapError::InvalidState(format!(
                    "task {} already belongs to change {}",
                    task_id, existing
                )));
            }
            _ => task.set_change_id(change_id),
        }
        self.changes
            .get_mut(change_id)
            .expect("checked above")
            .push_task_id(task_id);
        Ok(())
    }

    // ========================================================================
    // Graph edges
    // ========================================================================

    /// Record that `task_id` must wait for `waits_on` to be done.
    ///
    /// # Errors
    ///
    /// Rejects missing tasks and any edge that would close a cycle.
    pub fn add_wait(&mut self, task_id: &str, waits_on: &str) -> SnapResult<()> {
        if !self.tasks.contains_key(task_id) {
            return Err(SnapError::NotFound(format!("task {}", task_id)));
        }
        if !self.tasks.contains_key(waits_on) {
            return Err(SnapError::NotFound(format!("task {}", waits_on)));
        }
        if task_id == waits_on || self.reaches(waits_on, task_id) {
            return Err(SnapError::DependencyCycle {
                task_id: task_id.to_string(),
            });
        }
        self.tasks
            .get_mut(task_id)
            .expect("checked above")
            .push_wait(waits_on);
        self.tasks
            .get_mut(waits_on)
            .expect("checked above")
            .push_halt(task_id);
        Ok(())
    }

    /// True if `from` transitively waits on `target`.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = HashSet::new();
        while let Some(cur) = stack.pop() {
            if cur == target {
                return true;
            }
            if !seen.insert(cur.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(&cur) {
                stack.extend(task.wait_tasks().iter().cloned());
            }
        }
        false
    }

    // ========================================================================
    // Derived status
    // ========================================================================

    /// Aggregate status of a change, derived from its tasks.
    pub fn change_status(&self, change_id: &str) -> Status {
        let Some(change) = self.changes.get(change_id) else {
            return Status::Hold;
        };
        Status::aggregate(
            change
                .task_ids()
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .map(|t| t.status()),
        )
    }

    /// True once the change's aggregate status is terminal.
    pub fn change_is_ready(&self, change_id: &str) -> bool {
        self.change_status(change_id).is_ready()
    }

    /// Stamp or clear the change's ready time to match its aggregate
    /// status. Called by the runner after every status write.
    pub fn settle_change(&mut self, change_id: &str, now: DateTime<Utc>) {
        let ready = self.change_is_ready(change_id);
        if let Some(change) = self.changes.get_mut(change_id) {
            match (ready, change.ready_time()) {
                (true, None) => change.set_ready_time(Some(now)),
                (false, Some(_)) => change.set_ready_time(None),
                _ => {}
            }
        }
    }

    /// A task is runnable when it is pending, its retry backoff elapsed,
    /// and every task it waits for is done.
    pub fn task_is_runnable(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        task.status() == Status::Do
            && task.runnable_at(now)
            && task.wait_tasks().iter().all(|w| {
                self.tasks
                    .get(w)
                    .map(|t| t.status().satisfies_waiters())
                    .unwrap_or(false)
            })
    }

    /// A task is ready to undo when its retry backoff elapsed and every
    /// dependant has finished undoing (or never ran).
    pub fn task_is_undoable(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        task.status() == Status::Undo
            && task.runnable_at(now)
            && task.halt_tasks().iter().all(|h| {
                self.tasks
                    .get(h)
                    .map(|t| t.status().is_ready())
                    .unwrap_or(true)
            })
    }

    // ========================================================================
    // Subsystem data bags
    // ========================================================================

    /// Store a value under a top-level key.
    ///
    /// # Errors
    ///
    /// Rejects keys the state tree reserves for itself.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> SnapResult<()> {
        if RESERVED_KEYS.contains(&key) {
            return Err(SnapError::InvalidState(format!(
                "key \"{}\" is reserved",
                key
            )));
        }
        let value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    /// Fetch a value stored under a top-level key.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NoEntry`] when the key is absent and
    /// [`SnapError::BadEntry`] when the value does not decode as `T`; a bad
    /// entry at one key never affects any other key.
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

    pub fn unset(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Store a non-persistent cached view. Cached views are only valid for
    /// the current critical section; re-fetch after releasing the lock.
    pub fn set_cached<T: Any + Send + Sync>(&self, key: &str, value: Arc<T>) {
        self.cache.borrow_mut().insert(key.to_string(), value);
    }

    /// Fetch a cached view stored by [`set_cached`](State::set_cached).
    pub fn cached<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.cache.borrow().get(key).cloned()?.downcast::<T>().ok()
    }

    // ========================================================================
    // Wake-up requests
    // ========================================================================

    /// Ask the runner to perform an ensure pass no later than `d` from now.
    /// Overlapping requests coalesce to the earliest deadline. Advisory
    /// only: not a state mutation, never checkpointed.
    pub fn ensure_before(&self, d: Duration) {
        let deadline = Instant::now() + d;
        let moved = match self.wake_deadline.get() {
            Some(existing) => deadline < existing,
            None => true,
        };
        if moved {
            self.wake_deadline.set(Some(deadline));
            self.wake_requested.set(true);
        }
    }

    /// The earliest pending ensure deadline, if any.
    pub fn wake_deadline(&self) -> Option<Instant> {
        self.wake_deadline.get()
    }

    /// Clear the pending deadline once the runner has woken for it.
    pub fn clear_wake_deadline(&self) {
        self.wake_deadline.set(None);
    }

    // ========================================================================
    // Warnings
    // ========================================================================

    /// Record an operator-visible warning, deduplicated by message.
    pub fn warnf(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        match self.warnings.get_mut(&message) {
            Some(w) => w.last_added = now,
            None => {
                self.warnings.insert(
                    message.clone(),
                    Warning {
                        message,
                        first_added: now,
                        last_added: now,
                        last_shown: None,
                    },
                );
            }
        }
    }

    /// Warnings that should be surfaced now: never shown, or shown long
    /// enough ago to repeat. Marks them shown.
    pub fn pending_warnings(&mut self, now: DateTime<Utc>) -> Vec<Warning> {
        let repeat = chrono::Duration::from_std(WARNING_REPEAT_AFTER).expect("fits");
        let mut out = Vec::new();
        for w in self.warnings.values_mut() {
            let due = match w.last_shown {
                None => true,
                Some(shown) => shown + repeat <= now,
            };
            if due {
                w.last_shown = Some(now);
                out.push(w.clone());
            }
        }
        out
    }

    /// Acknowledge all warnings last added at or before `ts`.
    pub fn okay_warnings(&mut self, ts: DateTime<Utc>) -> usize {
        let before = self.warnings.len();
        self.warnings.retain(|_, w| w.last_added > ts);
        before - self.warnings.len()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.warnings.values()
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Drop terminal changes older than the retention window, together with
    /// their tasks, and sweep expired warnings. Non-terminal changes are
    /// never pruned regardless of age.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        let retention = chrono::Duration::from_std(retention).expect("fits");
        let expired: Vec<String> = self
            .changes
            .iter()
            .filter(|(id, c)| {
                self.change_is_ready(id)
                    && c.ready_time()
                        .map(|t| t + retention <= now)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(change) = self.changes.remove(&id) {
                for task_id in change.task_ids() {
                    self.tasks.remove(task_id);
                }
                tracing::debug!(change_id = %id, kind = %change.kind(), "Pruned change");
            }
        }

        let expire = chrono::Duration::from_std(WARNING_EXPIRE).expect("fits");
        self.warnings.retain(|_, w| w.last_added + expire > now);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// STATE LOCK
// ============================================================================

/// The coarse mutex guarding the entire state, plus the wake channel the
/// runner sleeps on.
///
/// Every read and write of any state datum happens through the guard
/// returned by [`lock`](StateLock::lock). Dropping a guard after a mutation
/// serializes the tree and invokes the checkpointer; a checkpoint failure
/// aborts the process.
pub struct StateLock {
    state: Mutex<State>,
    checkpointer: Box<dyn Checkpointer>,
    wake_flag: Mutex<bool>,
    wake: Condvar,
}

impl StateLock {
    pub fn new(state: State, checkpointer: Box<dyn Checkpointer>) -> Self {
        Self {
            state: Mutex::new(state),
            checkpointer,
            wake_flag: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Open a state file, or start fresh when it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> SnapResult<Self> {
        let path = path.as_ref();
        let state = match std::fs::read(path) {
            Ok(bytes) => State::from_bytes(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::new(),
            Err(e) => {
                return Err(SnapError::Storage(format!(
                    "cannot read state file {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        Ok(Self::new(state, Box::new(FileCheckpointer::new(path))))
    }

    /// Acquire the state lock. Reentrancy is not supported: a thread that
    /// already holds a guard must not lock again.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            guard: self.state.lock(),
            lock: self,
        }
    }

    /// Wake the runner's scheduler loop immediately.
    pub fn poke(&self) {
        let mut flag = self.wake_flag.lock();
        *flag = true;
        self.wake.notify_all();
    }

    /// Block until poked or the timeout elapses. Returns true when poked.
    /// Used only by the runner's scheduler thread.
    pub(crate) fn wait_poke(&self, timeout: Duration) -> bool {
        let mut flag = self.wake_flag.lock();
        if !*flag {
            self.wake.wait_for(&mut flag, timeout);
        }
        let poked = *flag;
        *flag = false;
        poked
    }
}

/// Guard over the locked state.
///
/// Mutable access marks the state dirty; on drop a dirty state bumps the
/// generation counter, serializes, and checkpoints.
pub struct StateGuard<'a> {
    guard: MutexGuard<'a, State>,
    lock: &'a StateLock,
}

impl Deref for StateGuard<'_> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut State {
        self.guard.dirty = true;
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let wake = self.guard.wake_requested.replace(false);
        if self.guard.dirty {
            self.guard.dirty = false;
            self.guard.generation += 1;
            match self.guard.serialize() {
                Ok(bytes) => {
                    if let Err(e) = self.lock.checkpointer.checkpoint(&bytes) {
                        // The mutation is already visible to this process but
                        // cannot be made durable; continuing would acknowledge
                        // state we may lose.
                        tracing::error!("state checkpoint failed, aborting: {}", e);
                        std::process::abort();
                    }
                }
                Err(e) => {
                    tracing::error!("state serialization failed, aborting: {}", e);
                    std::process::abort();
                }
            }
        }
        if wake {
            self.lock.poke();
        }
    }
}
