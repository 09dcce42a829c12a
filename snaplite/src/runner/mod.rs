//! Cooperative task runner.
//!
//! A single scheduler thread walks the task graphs in state, dispatches
//! ready tasks to short-lived worker threads, and settles change statuses
//! after every completion. Handlers run without the state lock and
//! re-acquire it as needed; the scheduler is the only place that re-enters
//! suspended work.

mod tomb;

pub use tomb::Tomb;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::state::{State, StateGuard, StateLock, Status};

/// Default scheduler poll interval when nothing requests an earlier wake.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default cap on per-task retries before escalation to Error.
pub const DEFAULT_RETRY_CAP: u32 = 500;

/// How often the scheduler runs the prune sweep.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// What a handler resolved to, beyond plain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The task's work is complete.
    Done,
    /// Re-run the handler after the given backoff.
    Retry(Duration),
    /// Park the task until another task resumes it.
    Wait,
}

/// Context handed to every handler invocation.
///
/// The handler runs without the state lock; it re-acquires it through
/// [`lock`](HandlerCtx::lock) for each burst of state access and must not
/// hold it across blocking external calls.
pub struct HandlerCtx {
    state: Arc<StateLock>,
    task_id: String,
    tomb: Tomb,
}

impl HandlerCtx {
    /// Acquire the state lock.
    pub fn lock(&self) -> StateGuard<'_> {
        self.state.lock()
    }

    pub fn state_lock(&self) -> &Arc<StateLock> {
        &self.state
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The runner-wide kill token; long external calls must bound their
    /// blocking against it.
    pub fn tomb(&self) -> &Tomb {
        &self.tomb
    }
}

/// Handler function for one direction of a task kind.
pub type Handler = Arc<dyn Fn(&HandlerCtx) -> SnapResult<HandlerOutcome> + Send + Sync>;

#[derive(Clone)]
struct HandlerPair {
    do_fn: Option<Handler>,
    undo_fn: Option<Handler>,
}

/// Tuning knobs for the runner.
#[derive(Clone)]
pub struct RunnerOptions {
    pub poll_interval: Duration,
    pub retry_cap: u32,
    pub change_retention: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_cap: DEFAULT_RETRY_CAP,
            change_retention: crate::state::DEFAULT_CHANGE_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Do,
    Undo,
}

/// One planned dispatch: run `task_id`'s handler in the given direction.
struct Dispatch {
    task_id: String,
    direction: Direction,
}

/// Counts live workers so `stop` can wait for them.
struct WorkerGate {
    count: Mutex<u32>,
    cv: Condvar,
}

impl WorkerGate {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        self.cv.notify_all();
    }

    /// Wait until no workers remain or the timeout elapses. Returns true
    /// when all workers finished.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cv.wait_for(&mut count, deadline - now);
        }
        true
    }
}

/// Callback invoked at the start of every ensure pass; background drivers
/// (auto-refresh, housekeeping) hook in here.
pub type EnsureHook = Arc<dyn Fn() + Send + Sync>;

/// The cooperative scheduler driving every change in state.
pub struct TaskRunner {
    state: Arc<StateLock>,
    handlers: Arc<RwLock<HashMap<String, HandlerPair>>>,
    hooks: Arc<RwLock<Vec<EnsureHook>>>,
    options: RunnerOptions,
    tomb: Tomb,
    gate: Arc<WorkerGate>,
    scheduler: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(state: Arc<StateLock>, options: RunnerOptions) -> Self {
        Self {
            state,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            hooks: Arc::new(RwLock::new(Vec::new())),
            options,
            tomb: Tomb::new(),
            gate: Arc::new(WorkerGate::new()),
            scheduler: Mutex::new(None),
        }
    }

    /// Register a callback to run at the start of every ensure pass. Hooks
    /// must not assume they hold the state lock.
    pub fn add_ensure_hook(&self, hook: EnsureHook) {
        self.hooks.write().push(hook);
    }

    /// Register the Do/Undo handler pair for a task kind.
    ///
    /// # Panics
    ///
    /// Panics if the kind is already registered; handler registration is a
    /// startup-time programming decision, not a runtime input.
    pub fn add_handlers(&self, kind: &str, do_fn: Option<Handler>, undo_fn: Option<Handler>) {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(kind) {
            panic!("task kind {:?} registered twice", kind);
        }
        handlers.insert(kind.to_string(), HandlerPair { do_fn, undo_fn });
    }

    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Spawn the scheduler thread. Idempotent.
    pub fn start(&self) {
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            return;
        }
        let state = self.state.clone();
        let handlers = self.handlers.clone();
        let hooks = self.hooks.clone();
        let options = self.options.clone();
        let tomb = self.tomb.clone();
        let gate = self.gate.clone();
        *slot = Some(
            std::thread::Builder::new()
                .name("snaplite-ensure".to_string())
                .spawn(move || scheduler_loop(state, handlers, hooks, options, tomb, gate))
                .expect("spawn scheduler thread"),
        );
    }

    /// Wake the scheduler for an immediate ensure pass.
    pub fn ensure(&self) {
        self.state.poke();
    }

    /// Unblock a parked task and wake the scheduler.
    pub fn resume(&self, task_id: &str) {
        {
            let mut st = self.state.lock();
            if st.task(task_id).map(|t| t.status()) == Some(Status::Wait) {
                let now = Utc::now();
                st.task_mut(task_id)
                    .expect("checked above")
                    .set_status(Status::Do, now);
            }
        }
        self.state.poke();
    }

    /// Stop the scheduler and wait for in-flight workers.
    ///
    /// Returns true when every worker finished inside the timeout. Workers
    /// that ignore the kill token keep running past the timeout but can no
    /// longer re-enter the scheduler.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.tomb.kill();
        self.state.poke();
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
        self.gate.wait_idle(timeout)
    }

    pub fn tomb(&self) -> &Tomb {
        &self.tomb
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.tomb.kill();
        self.state.poke();
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// SCHEDULER LOOP
// ============================================================================

fn scheduler_loop(
    state: Arc<StateLock>,
    handlers: Arc<RwLock<HashMap<String, HandlerPair>>>,
    hooks: Arc<RwLock<Vec<EnsureHook>>>,
    options: RunnerOptions,
    tomb: Tomb,
    gate: Arc<WorkerGate>,
) {
    tracing::debug!("Scheduler started");
    let mut last_prune = Instant::now();
    while tomb.is_alive() {
        for hook in hooks.read().iter() {
            hook();
        }
        ensure_pass(&state, &handlers, &options, &tomb, &gate, &mut last_prune);
        let timeout = next_wake_timeout(&state, options.poll_interval);
        state.wait_poke(timeout);
    }
    tracing::debug!("Scheduler stopped");
}

/// Compute how long the scheduler may sleep: the earliest of any
/// ensure-before deadline, any retry's scheduled-at, and the poll interval.
fn next_wake_timeout(state: &StateLock, poll: Duration) -> Duration {
    let st = state.lock();
    let now = Utc::now();
    let mut timeout = poll;
    if let Some(deadline) = st.wake_deadline() {
        timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
    }
    for task in st.tasks() {
        if matches!(task.status(), Status::Do | Status::Undo)
            && let Some(at) = task.scheduled_at()
            && at > now
        {
            let until = (at - now).to_std().unwrap_or(Duration::ZERO);
            timeout = timeout.min(until);
        }
    }
    timeout
}

/// One ensure pass: propagate aborts, dispatch ready work, settle changes,
/// and prune on a slow cadence. Takes no mutable state access when there is
/// nothing to do, so an idle pass writes no checkpoint.
fn ensure_pass(
    state: &Arc<StateLock>,
    handlers: &Arc<RwLock<HashMap<String, HandlerPair>>>,
    options: &RunnerOptions,
    tomb: &Tomb,
    gate: &Arc<WorkerGate>,
    last_prune: &mut Instant,
) {
    let now = Utc::now();
    let prune_due = last_prune.elapsed() >= PRUNE_INTERVAL;
    let dispatches = {
        let mut guard = state.lock();

        // A passed advisory deadline is consumed here; waking for it is
        // not by itself a state mutation.
        if let Some(deadline) = guard.wake_deadline()
            && deadline <= Instant::now()
        {
            guard.clear_wake_deadline();
        }

        let abort_moves = plan_abort_moves(&guard, handlers);
        let hold_moves = plan_blocked_holds(&guard);
        let orphan_errors = plan_missing_handlers(&guard, handlers);
        let any_dispatchable = !plan_dispatches(&guard, now).is_empty();
        let any_settles = !plan_settles(&guard).is_empty();

        let has_work = !abort_moves.is_empty()
            || !hold_moves.is_empty()
            || !orphan_errors.is_empty()
            || any_dispatchable
            || any_settles
            || prune_due;
        if !has_work {
            return;
        }

        let st = &mut *guard;
        for (task_id, status) in abort_moves.into_iter().chain(hold_moves) {
            if let Some(task) = st.task_mut(&task_id) {
                task.set_status(status, now);
            }
        }
        for task_id in orphan_errors {
            if let Some(task) = st.task_mut(&task_id) {
                let kind = task.kind().to_string();
                task.errorf(format!("no handler for task kind \"{}\"", kind), now);
                task.set_status(Status::Error, now);
                tracing::warn!(task_id = %task_id, kind = %kind, "Task has no registered handler");
            }
        }
        // Plan dispatches on the post-move statuses: a freshly held task
        // must not start, and freshly scheduled undo work starts this pass.
        let dispatches = plan_dispatches(st, now);
        for dispatch in &dispatches {
            let status = match dispatch.direction {
                Direction::Do => Status::Doing,
                Direction::Undo => Status::Undoing,
            };
            if let Some(task) = st.task_mut(&dispatch.task_id) {
                task.set_status(status, now);
            }
        }
        for change_id in plan_settles(st) {
            st.settle_change(&change_id, now);
        }
        if prune_due {
            *last_prune = Instant::now();
            st.prune(now, options.change_retention);
        }
        dispatches
    };

    for dispatch in dispatches {
        spawn_worker(state, handlers, options, tomb, gate, dispatch);
    }
}

/// Tasks whose change is aborting: done work is scheduled for undo,
/// not-yet-started work is held.
fn plan_abort_moves(
    st: &State,
    handlers: &Arc<RwLock<HashMap<String, HandlerPair>>>,
) -> Vec<(String, Status)> {
    let handlers = handlers.read();
    let mut moves = Vec::new();
    for change in st.changes() {
        let aborting = change
            .task_ids()
            .iter()
            .filter_map(|id| st.task(id))
            .any(|t| t.status() == Status::Error);
        if !aborting {
            continue;
        }
        for task in change.task_ids().iter().filter_map(|id| st.task(id)) {
            match task.status() {
                Status::Do | Status::Wait => moves.push((task.id().to_string(), Status::Hold)),
                Status::Done => {
                    let has_undo = handlers
                        .get(task.kind())
                        .map(|pair| pair.undo_fn.is_some())
                        .unwrap_or(false);
                    let target = if has_undo {
                        Status::Undo
                    } else {
                        Status::Undone
                    };
                    moves.push((task.id().to_string(), target));
                }
                _ => {}
            }
        }
    }
    moves
}

/// Pending tasks that can never run because a predecessor settled
/// unsuccessfully.
fn plan_blocked_holds(st: &State) -> Vec<(String, Status)> {
    let mut moves = Vec::new();
    for task in st.tasks() {
        if task.status() != Status::Do {
            continue;
        }
        let blocked = task.wait_tasks().iter().any(|w| {
            st.task(w)
                .map(|t| t.status().is_ready() && !t.status().satisfies_waiters())
                .unwrap_or(false)
        });
        if blocked {
            moves.push((task.id().to_string(), Status::Hold));
        }
    }
    moves
}

/// Pending tasks whose kind has no registered handler at all.
fn plan_missing_handlers(
    st: &State,
    handlers: &Arc<RwLock<HashMap<String, HandlerPair>>>,
) -> Vec<String> {
    let handlers = handlers.read();
    st.tasks()
        .filter(|t| t.status() == Status::Do && !handlers.contains_key(t.kind()))
        .map(|t| t.id().to_string())
        .collect()
}

fn plan_dispatches(st: &State, now: DateTime<Utc>) -> Vec<Dispatch> {
    let mut dispatches = Vec::new();
    for task in st.tasks() {
        if st.task_is_runnable(task.id(), now) {
            dispatches.push(Dispatch {
                task_id: task.id().to_string(),
                direction: Direction::Do,
            });
        } else if st.task_is_undoable(task.id(), now) {
            dispatches.push(Dispatch {
                task_id: task.id().to_string(),
                direction: Direction::Undo,
            });
        }
    }
    dispatches
}

/// Changes whose stored ready time disagrees with their aggregate status.
fn plan_settles(st: &State) -> Vec<String> {
    st.changes()
        .filter(|c| st.change_is_ready(c.id()) != c.ready_time().is_some())
        .map(|c| c.id().to_string())
        .collect()
}

// ============================================================================
// WORKERS
// ============================================================================

fn spawn_worker(
    state: &Arc<StateLock>,
    handlers: &Arc<RwLock<HashMap<String, HandlerPair>>>,
    options: &RunnerOptions,
    tomb: &Tomb,
    gate: &Arc<WorkerGate>,
    dispatch: Dispatch,
) {
    gate.enter();
    let task_label = dispatch.task_id.clone();
    let state = state.clone();
    let handlers = handlers.clone();
    let retry_cap = options.retry_cap;
    let tomb = tomb.clone();
    let worker_gate = gate.clone();
    let name = format!("snaplite-task-{}", dispatch.task_id);
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        run_one(&state, &handlers, retry_cap, tomb, &dispatch);
        worker_gate.leave();
        // A completion is a scheduling event: successors may be ready now.
        state.poke();
    });
    if spawned.is_err() {
        gate.leave();
        tracing::error!(task_id = %task_label, "Failed to spawn worker thread");
    }
}

fn run_one(
    state: &Arc<StateLock>,
    handlers: &Arc<RwLock<HashMap<String, HandlerPair>>>,
    retry_cap: u32,
    tomb: Tomb,
    dispatch: &Dispatch,
) {
    let (kind, change_id) = {
        let st = state.lock();
        match st.task(&dispatch.task_id) {
            Some(task) => (
                task.kind().to_string(),
                task.change_id().map(|c| c.to_string()),
            ),
            None => return,
        }
    };
    let handler = {
        let handlers = handlers.read();
        let pair = handlers.get(&kind).cloned();
        match dispatch.direction {
            Direction::Do => pair.and_then(|p| p.do_fn),
            Direction::Undo => pair.and_then(|p| p.undo_fn),
        }
    };
    let ctx = HandlerCtx {
        state: state.clone(),
        task_id: dispatch.task_id.clone(),
        tomb,
    };

    // A task with no forward handler fails; a missing undo handler means
    // there is nothing to compensate.
    let outcome = match handler {
        Some(handler) => handler(&ctx),
        None => match dispatch.direction {
            Direction::Do => Err(SnapError::Internal(format!(
                "no handler for task kind \"{}\"",
                kind
            ))),
            Direction::Undo => Ok(HandlerOutcome::Done),
        },
    };

    let now = Utc::now();
    let mut st = state.lock();
    let Some(task) = st.task_mut(&dispatch.task_id) else {
        return;
    };
    match outcome {
        Ok(HandlerOutcome::Done) => {
            let done = match dispatch.direction {
                Direction::Do => Status::Done,
                Direction::Undo => Status::Undone,
            };
            task.set_status(done, now);
            tracing::debug!(task_id = %dispatch.task_id, kind = %kind, status = %done, "Task finished");
        }
        Ok(HandlerOutcome::Retry(after)) => {
            let retries = task.bump_retries(after, now);
            if retries > retry_cap {
                task.errorf(
                    format!("retry limit exceeded after {} attempts", retries),
                    now,
                );
                task.set_status(Status::Error, now);
                tracing::warn!(task_id = %dispatch.task_id, kind = %kind, retries, "Task escalated to error");
            } else {
                let back = match dispatch.direction {
                    Direction::Do => Status::Do,
                    Direction::Undo => Status::Undo,
                };
                task.set_status(back, now);
                tracing::debug!(task_id = %dispatch.task_id, kind = %kind, ?after, retries, "Task rescheduled");
            }
        }
        Ok(HandlerOutcome::Wait) => {
            task.set_status(Status::Wait, now);
            tracing::debug!(task_id = %dispatch.task_id, kind = %kind, "Task parked");
        }
        Err(err) => {
            task.errorf(err.to_string(), now);
            task.set_status(Status::Error, now);
            tracing::warn!(task_id = %dispatch.task_id, kind = %kind, error = %err, "Task failed");
        }
    }
    if let Some(change_id) = change_id {
        st.settle_change(&change_id, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NullCheckpointer, TaskSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_runner() -> (Arc<StateLock>, TaskRunner) {
        let state = Arc::new(StateLock::new(State::new(), Box::new(NullCheckpointer)));
        let runner = TaskRunner::new(state.clone(), RunnerOptions::default());
        (state, runner)
    }

    fn wait_change_ready(state: &Arc<StateLock>, change_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if state.lock().change_is_ready(change_id) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn done_handler() -> Handler {
        Arc::new(|_ctx| Ok(HandlerOutcome::Done))
    }

    #[test]
    fn test_single_task_change_runs_to_done() {
        let (state, runner) = new_runner();
        runner.add_handlers("noop", Some(done_handler()), None);
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "one task");
            let tid = st.new_task("noop", "noop");
            st.change_add_task(&cid, &tid).unwrap();
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        assert_eq!(state.lock().change_status(&change_id), Status::Done);
        assert!(runner.stop(Duration::from_secs(5)));
    }

    #[test]
    fn test_wait_order_respected() {
        let (state, runner) = new_runner();
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        for kind in ["first", "second", "third"] {
            let order = order.clone();
            runner.add_handlers(
                kind,
                Some(Arc::new(move |ctx: &HandlerCtx| {
                    let kind = {
                        let st = ctx.lock();
                        st.task(ctx.task_id()).unwrap().kind().to_string()
                    };
                    order.lock().push(kind);
                    Ok(HandlerOutcome::Done)
                })),
                None,
            );
        }
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "chain");
            let a = st.new_task("first", "first");
            let b = st.new_task("second", "second");
            let c = st.new_task("third", "third");
            st.add_wait(&b, &a).unwrap();
            st.add_wait(&c, &b).unwrap();
            for t in [&a, &b, &c] {
                st.change_add_task(&cid, t).unwrap();
            }
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        assert_eq!(*order.lock(), ["first", "second", "third"]);
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_error_aborts_and_undoes_in_reverse() {
        let (state, runner) = new_runner();
        let undone = Arc::new(Mutex::new(Vec::<String>::new()));
        for kind in ["download", "mount-snap", "setup-profiles"] {
            let undone = undone.clone();
            runner.add_handlers(
                kind,
                Some(done_handler()),
                Some(Arc::new(move |ctx: &HandlerCtx| {
                    let kind = {
                        let st = ctx.lock();
                        st.task(ctx.task_id()).unwrap().kind().to_string()
                    };
                    undone.lock().push(kind);
                    Ok(HandlerOutcome::Done)
                })),
            );
        }
        runner.add_handlers(
            "link-snap",
            Some(Arc::new(|_ctx: &HandlerCtx| {
                Err(SnapError::Internal("disk full".to_string()))
            })),
            None,
        );
        runner.add_handlers("start-services", Some(done_handler()), None);

        let (change_id, start_id) = {
            let mut st = state.lock();
            let cid = st.new_change("install-snap", "install");
            let mut prev: Option<String> = None;
            let mut start_id = String::new();
            for kind in [
                "download",
                "mount-snap",
                "setup-profiles",
                "link-snap",
                "start-services",
            ] {
                let tid = st.new_task(kind, kind);
                if let Some(prev) = &prev {
                    st.add_wait(&tid, prev).unwrap();
                }
                st.change_add_task(&cid, &tid).unwrap();
                if kind == "start-services" {
                    start_id = tid.clone();
                }
                prev = Some(tid);
            }
            (cid, start_id)
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));

        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Error);
        assert_eq!(st.task(&start_id).unwrap().status(), Status::Hold);
        let failing = st
            .tasks()
            .find(|t| t.kind() == "link-snap")
            .unwrap();
        assert_eq!(failing.status(), Status::Error);
        assert_eq!(failing.error(), Some("disk full"));
        drop(st);
        assert_eq!(
            *undone.lock(),
            ["setup-profiles", "mount-snap", "download"],
            "undo walks the graph in reverse"
        );
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_retry_reruns_on_later_tick() {
        let (state, runner) = new_runner();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        runner.add_handlers(
            "flaky",
            Some(Arc::new(move |_ctx: &HandlerCtx| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(HandlerOutcome::Retry(Duration::ZERO))
                } else {
                    Ok(HandlerOutcome::Done)
                }
            })),
            None,
        );
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "flaky");
            let tid = st.new_task("flaky", "flaky");
            st.change_add_task(&cid, &tid).unwrap();
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(state.lock().change_status(&change_id), Status::Done);
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_retry_cap_escalates_to_error() {
        let (state, _) = new_runner();
        let runner = TaskRunner::new(
            state.clone(),
            RunnerOptions {
                retry_cap: 2,
                ..Default::default()
            },
        );
        runner.add_handlers(
            "stubborn",
            Some(Arc::new(|_ctx: &HandlerCtx| {
                Ok(HandlerOutcome::Retry(Duration::ZERO))
            })),
            None,
        );
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "stubborn");
            let tid = st.new_task("stubborn", "stubborn");
            st.change_add_task(&cid, &tid).unwrap();
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Error);
        let task = st.tasks().next().unwrap();
        assert!(task.error().unwrap().contains("retry limit exceeded"));
        drop(st);
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_missing_handler_errors_task() {
        let (state, runner) = new_runner();
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "unknown kind");
            let tid = st.new_task("does-not-exist", "mystery");
            st.change_add_task(&cid, &tid).unwrap();
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        let st = state.lock();
        assert_eq!(st.change_status(&change_id), Status::Error);
        assert!(
            st.tasks()
                .next()
                .unwrap()
                .error()
                .unwrap()
                .contains("no handler for task kind")
        );
    }

    #[test]
    fn test_wait_parks_until_resume() {
        let (state, runner) = new_runner();
        let first_pass = Arc::new(AtomicU32::new(0));
        let seen = first_pass.clone();
        runner.add_handlers(
            "parked",
            Some(Arc::new(move |_ctx: &HandlerCtx| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(HandlerOutcome::Wait)
                } else {
                    Ok(HandlerOutcome::Done)
                }
            })),
            None,
        );
        let (change_id, task_id) = {
            let mut st = state.lock();
            let cid = st.new_change("test", "parked");
            let tid = st.new_task("parked", "parked");
            st.change_add_task(&cid, &tid).unwrap();
            (cid, tid)
        };
        runner.start();
        runner.ensure();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if state.lock().task(&task_id).unwrap().status() == Status::Wait {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(state.lock().task(&task_id).unwrap().status(), Status::Wait);
        assert!(!state.lock().change_is_ready(&change_id));

        runner.resume(&task_id);
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        assert_eq!(state.lock().change_status(&change_id), Status::Done);
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_taskset_wiring_runs_whole_graph() {
        let (state, runner) = new_runner();
        runner.add_handlers("work", Some(done_handler()), None);
        let change_id = {
            let mut st = state.lock();
            let cid = st.new_change("test", "fan out");
            let gate = st.new_task("work", "gate");
            let mut fan = TaskSet::new();
            for _ in 0..4 {
                fan.add_task(st.new_task("work", "member"));
            }
            fan.wait_for(&mut st, &gate).unwrap();
            st.change_add_task(&cid, &gate).unwrap();
            fan.attach(&mut st, &cid).unwrap();
            cid
        };
        runner.start();
        runner.ensure();
        assert!(wait_change_ready(&state, &change_id, Duration::from_secs(5)));
        assert_eq!(state.lock().change_status(&change_id), Status::Done);
        runner.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_stop_interrupts_sleeping_handler() {
        let (state, runner) = new_runner();
        runner.add_handlers(
            "sleepy",
            Some(Arc::new(|ctx: &HandlerCtx| {
                // Cooperative long call: bounded by the tomb.
                ctx.tomb().sleep(Duration::from_secs(60));
                Ok(HandlerOutcome::Done)
            })),
            None,
        );
        {
            let mut st = state.lock();
            let cid = st.new_change("test", "sleepy");
            let tid = st.new_task("sleepy", "sleepy");
            st.change_add_task(&cid, &tid).unwrap();
        }
        runner.start();
        runner.ensure();
        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        assert!(runner.stop(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
