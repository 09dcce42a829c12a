//! Top-level runtime facade wiring state, runner and managers together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snaplite_shared::errors::SnapResult;

use crate::boot::Bootloader;
use crate::conflict::ConnRef;
use crate::inhibit::{DEFAULT_INHIBIT_GRACE, ProcessTracker};
use crate::layout::SnapDirs;
use crate::refresh::{AutoRefresh, RefreshBuilder, RefreshPolicy};
use crate::runner::{RunnerOptions, TaskRunner};
use crate::snapop::{self, SnapBackend, SnapManager, SnapManagerConfig};
use crate::state::{Change, DEFAULT_CHANGE_RETENTION, StateGuard, StateLock, Status};

/// Tuning knobs for the runtime.
#[derive(Clone)]
pub struct SnapliteOptions {
    pub home_dir: std::path::PathBuf,
    pub change_retention: Duration,
    pub retry_cap: u32,
    pub poll_interval: Duration,
    pub inhibit_grace: Duration,
    pub busy_retry: Duration,
}

impl Default for SnapliteOptions {
    fn default() -> Self {
        Self {
            home_dir: SnapDirs::default_home(),
            change_retention: DEFAULT_CHANGE_RETENTION,
            retry_cap: crate::runner::DEFAULT_RETRY_CAP,
            poll_interval: crate::runner::DEFAULT_POLL_INTERVAL,
            inhibit_grace: DEFAULT_INHIBIT_GRACE,
            busy_retry: crate::snapop::DEFAULT_BUSY_RETRY,
        }
    }
}

/// The pluggable collaborators the core drives.
pub struct Collaborators {
    pub backend: Arc<dyn SnapBackend>,
    pub tracker: Arc<dyn ProcessTracker>,
    pub bootloader: Arc<dyn Bootloader>,
    pub refresh_builder: Arc<dyn RefreshBuilder>,
    pub refresh_policy: Arc<dyn RefreshPolicy>,
}

impl Collaborators {
    /// Production-shaped defaults around the one collaborator that has no
    /// meaningful default, the snap I/O backend.
    pub fn with_backend(backend: Arc<dyn SnapBackend>) -> Self {
        Self {
            backend,
            tracker: Arc::new(crate::inhibit::CgroupTracker::new()),
            bootloader: Arc::new(crate::boot::MemBootloader::new()),
            refresh_builder: Arc::new(crate::refresh::NoopRefreshBuilder),
            refresh_policy: Arc::new(crate::refresh::ScheduledPolicy),
        }
    }
}

/// The assembled daemon core: persistent state, task runner, snap
/// handlers and the auto-refresh driver.
///
/// Mirrors the lifecycle of the daemon process: construct once, `start`,
/// submit changes, `stop` on shutdown.
pub struct SnapliteRuntime {
    dirs: SnapDirs,
    state: Arc<StateLock>,
    runner: Arc<TaskRunner>,
}

impl SnapliteRuntime {
    /// Build the runtime: create the home directory tree, open (or start)
    /// the state file, and register every snap handler.
    pub fn new(options: SnapliteOptions, collab: Collaborators) -> SnapResult<Self> {
        let dirs = SnapDirs::new(&options.home_dir);
        dirs.ensure_created()?;
        let state = Arc::new(StateLock::open(dirs.state_file())?);

        let runner = Arc::new(TaskRunner::new(
            state.clone(),
            RunnerOptions {
                poll_interval: options.poll_interval,
                retry_cap: options.retry_cap,
                change_retention: options.change_retention,
            },
        ));

        let manager = SnapManager::new(SnapManagerConfig {
            backend: collab.backend,
            tracker: collab.tracker,
            bootloader: collab.bootloader,
            lock_dir: dirs.lock_dir(),
            inhibit_grace: options.inhibit_grace,
            busy_retry: options.busy_retry,
        });
        manager.register(&runner);

        let auto_refresh = Arc::new(AutoRefresh::new(
            state.clone(),
            collab.refresh_builder,
            collab.refresh_policy,
        ));
        {
            let auto_refresh = auto_refresh.clone();
            runner.add_ensure_hook(Arc::new(move || {
                if let Err(e) = auto_refresh.ensure(Utc::now()) {
                    tracing::warn!("Auto-refresh tick failed: {}", e);
                }
            }));
        }

        Ok(Self {
            dirs,
            state,
            runner,
        })
    }

    /// Start the scheduler thread. Idempotent.
    pub fn start(&self) {
        self.runner.start();
    }

    /// Wake the ensure cycle immediately.
    pub fn ensure(&self) {
        self.runner.ensure();
    }

    /// Stop the scheduler and wait for in-flight workers.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.runner.stop(timeout)
    }

    pub fn dirs(&self) -> &SnapDirs {
        &self.dirs
    }

    pub fn state(&self) -> &Arc<StateLock> {
        &self.state
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    // ========================================================================
    // Change submission
    // ========================================================================

    /// Submit an install change; returns the change id.
    pub fn install(&self, name: &str, revision: u32, channel: Option<&str>) -> SnapResult<String> {
        let id = {
            let mut st = self.state.lock();
            snapop::install(&mut st, name, revision, channel)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Submit a refresh change; returns the change id.
    pub fn refresh(&self, name: &str, revision: u32) -> SnapResult<String> {
        let id = {
            let mut st = self.state.lock();
            snapop::refresh(&mut st, name, revision)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Submit a remove change; returns the change id.
    pub fn remove(&self, name: &str) -> SnapResult<String> {
        let id = {
            let mut st = self.state.lock();
            snapop::remove(&mut st, name)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Submit a connect change; returns the change id.
    pub fn connect(&self, conn: &ConnRef) -> SnapResult<String> {
        let id = {
            let mut st = self.state.lock();
            snapop::connect(&mut st, conn)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Submit a disconnect change; returns the change id.
    pub fn disconnect(&self, conn: &ConnRef) -> SnapResult<String> {
        let id = {
            let mut st = self.state.lock();
            snapop::disconnect(&mut st, conn)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Submit an auto-connect change unless a symmetric one is pending.
    pub fn auto_connect(&self, conn: &ConnRef) -> SnapResult<Option<String>> {
        let id = {
            let mut st = self.state.lock();
            snapop::auto_connect(&mut st, conn)?
        };
        self.runner.ensure();
        Ok(id)
    }

    /// Report that the machine rebooted, unparking confirm-boot tasks.
    pub fn mark_rebooted(&self) {
        snapop::mark_rebooted(&self.state, &self.runner);
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Run a closure under the state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut StateGuard<'_>) -> R) -> R {
        let mut st = self.state.lock();
        f(&mut st)
    }

    /// The aggregate status of a change.
    pub fn change_status(&self, change_id: &str) -> Status {
        self.state.lock().change_status(change_id)
    }

    /// Snapshot of a change's metadata.
    pub fn change(&self, change_id: &str) -> Option<Change> {
        self.state.lock().change(change_id).cloned()
    }

    /// Block until a change reaches a terminal status or the timeout
    /// elapses. Returns true when the change is ready.
    pub fn wait_change_ready(&self, change_id: &str, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.state.lock().change_is_ready(change_id) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl std::fmt::Debug for SnapliteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapliteRuntime")
            .field("home_dir", &self.dirs.home_dir())
            .finish()
    }
}

// Compile-time assertion that the runtime can be shared across threads.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<SnapliteRuntime>;
};
