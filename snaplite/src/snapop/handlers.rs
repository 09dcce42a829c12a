//! Do/Undo handlers for the snap task kinds.
//!
//! Handlers follow the lock discipline of the runner: fetch what they need
//! under the lock, release it around every backend call, and re-acquire it
//! to record results. The concrete snap I/O (store download, squashfs
//! mount, profile generation, service control) lives behind the
//! [`SnapBackend`] collaborator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::boot::{BootSnapKind, Bootloader, BootOutcome, evaluate_try, stage_try};
use crate::conflict::ConnRef;
use crate::inhibit::{ProcessTracker, hard_check, soft_check};
use crate::runner::{Handler, HandlerCtx, HandlerOutcome, TaskRunner};
use crate::state::Status;

use super::{
    ConnState, SnapSetup, SnapType, conn_key, conns, drop_snap, snaps, update_snap,
};

/// State bag flag set while a staged boot candidate awaits its reboot.
pub const AWAITING_REBOOT_KEY: &str = "awaiting-reboot";

/// Default backoff when a busy check asks for a later attempt.
pub const DEFAULT_BUSY_RETRY: Duration = Duration::from_secs(60);

// ============================================================================
// BACKEND COLLABORATOR
// ============================================================================

/// Concrete snap I/O, out of scope for the core: handlers call through
/// this trait and tests substitute a recording fake.
pub trait SnapBackend: Send + Sync {
    fn download(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn discard(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn mount(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn unmount(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn setup_profiles(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn remove_profiles(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn link(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn unlink(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn start_services(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn stop_services(&self, setup: &SnapSetup) -> SnapResult<()>;
    fn connect(&self, conn: &ConnRef) -> SnapResult<()>;
    fn disconnect(&self, conn: &ConnRef) -> SnapResult<()>;
}

/// Recording backend with failure injection; the testing twin of the real
/// snap I/O layer.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    fail: Mutex<HashMap<String, String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend call so far, formatted as `"<op> <snap>@<rev>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Make the named operation fail with the given message.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.fail
            .lock()
            .insert(op.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.fail.lock().remove(op);
    }

    fn record(&self, op: &str, what: String) -> SnapResult<()> {
        if let Some(message) = self.fail.lock().get(op) {
            return Err(SnapError::Internal(message.clone()));
        }
        self.calls.lock().push(format!("{} {}", op, what));
        Ok(())
    }

    fn record_setup(&self, op: &str, setup: &SnapSetup) -> SnapResult<()> {
        self.record(op, format!("{}@{}", setup.name, setup.revision))
    }
}

impl SnapBackend for FakeBackend {
    fn download(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("download", setup)
    }

    fn discard(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("discard", setup)
    }

    fn mount(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("mount", setup)
    }

    fn unmount(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("unmount", setup)
    }

    fn setup_profiles(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("setup-profiles", setup)
    }

    fn remove_profiles(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("remove-profiles", setup)
    }

    fn link(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("link", setup)
    }

    fn unlink(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("unlink", setup)
    }

    fn start_services(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("start-services", setup)
    }

    fn stop_services(&self, setup: &SnapSetup) -> SnapResult<()> {
        self.record_setup("stop-services", setup)
    }

    fn connect(&self, conn: &ConnRef) -> SnapResult<()> {
        self.record("connect", conn_key(conn))
    }

    fn disconnect(&self, conn: &ConnRef) -> SnapResult<()> {
        self.record("disconnect", conn_key(conn))
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Collaborators and tuning for the snap handlers.
pub struct SnapManagerConfig {
    pub backend: Arc<dyn SnapBackend>,
    pub tracker: Arc<dyn ProcessTracker>,
    pub bootloader: Arc<dyn Bootloader>,
    pub lock_dir: PathBuf,
    pub inhibit_grace: Duration,
    pub busy_retry: Duration,
}

/// Owns the snap handler implementations and registers them with a
/// runner.
pub struct SnapManager {
    backend: Arc<dyn SnapBackend>,
    tracker: Arc<dyn ProcessTracker>,
    bootloader: Arc<dyn Bootloader>,
    lock_dir: PathBuf,
    inhibit_grace: Duration,
    busy_retry: Duration,
}

impl SnapManager {
    pub fn new(config: SnapManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: config.backend,
            tracker: config.tracker,
            bootloader: config.bootloader,
            lock_dir: config.lock_dir,
            inhibit_grace: config.inhibit_grace,
            busy_retry: config.busy_retry,
        })
    }

    /// Register every snap task kind with the runner.
    pub fn register(self: &Arc<Self>, runner: &TaskRunner) {
        fn h(
            m: &Arc<SnapManager>,
            f: fn(&SnapManager, &HandlerCtx) -> SnapResult<HandlerOutcome>,
        ) -> Handler {
            let m = m.clone();
            Arc::new(move |ctx: &HandlerCtx| f(&m, ctx))
        }

        runner.add_handlers(
            "download",
            Some(h(self, Self::do_download)),
            Some(h(self, Self::undo_download)),
        );
        runner.add_handlers(
            "mount-snap",
            Some(h(self, Self::do_mount)),
            Some(h(self, Self::undo_mount)),
        );
        runner.add_handlers(
            "setup-profiles",
            Some(h(self, Self::do_setup_profiles)),
            Some(h(self, Self::undo_setup_profiles)),
        );
        runner.add_handlers(
            "link-snap",
            Some(h(self, Self::do_link)),
            Some(h(self, Self::undo_link)),
        );
        runner.add_handlers(
            "unlink-current-snap",
            Some(h(self, Self::do_unlink_current)),
            Some(h(self, Self::undo_unlink_current)),
        );
        runner.add_handlers(
            "unlink-snap",
            Some(h(self, Self::do_unlink_current)),
            Some(h(self, Self::undo_unlink_current)),
        );
        runner.add_handlers(
            "start-services",
            Some(h(self, Self::do_start_services)),
            Some(h(self, Self::undo_start_services)),
        );
        runner.add_handlers(
            "stop-services",
            Some(h(self, Self::do_stop_services)),
            Some(h(self, Self::undo_stop_services)),
        );
        runner.add_handlers(
            "remove-profiles",
            Some(h(self, Self::do_remove_profiles)),
            Some(h(self, Self::undo_remove_profiles)),
        );
        runner.add_handlers("discard-snap", Some(h(self, Self::do_discard)), None);
        runner.add_handlers(
            "soft-check-refresh",
            Some(h(self, Self::do_soft_check)),
            None,
        );
        runner.add_handlers(
            "connect",
            Some(h(self, Self::do_connect)),
            Some(h(self, Self::undo_connect)),
        );
        runner.add_handlers(
            "disconnect",
            Some(h(self, Self::do_disconnect)),
            Some(h(self, Self::undo_disconnect)),
        );
        runner.add_handlers(
            "auto-connect",
            Some(h(self, Self::do_auto_connect)),
            Some(h(self, Self::undo_connect)),
        );
        runner.add_handlers(
            "transition-core",
            Some(h(self, Self::do_transition_core)),
            None,
        );
        runner.add_handlers(
            "stage-boot",
            Some(h(self, Self::do_stage_boot)),
            Some(h(self, Self::undo_stage_boot)),
        );
        runner.add_handlers("confirm-boot", Some(h(self, Self::do_confirm_boot)), None);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn setup_of(&self, ctx: &HandlerCtx) -> SnapResult<SnapSetup> {
        let st = ctx.lock();
        st.task(ctx.task_id())
            .ok_or_else(|| SnapError::NotFound(format!("task {}", ctx.task_id())))?
            .get("snap-setup")
    }

    fn conn_of(&self, ctx: &HandlerCtx) -> SnapResult<ConnRef> {
        let st = ctx.lock();
        st.task(ctx.task_id())
            .ok_or_else(|| SnapError::NotFound(format!("task {}", ctx.task_id())))?
            .get("conn")
    }

    fn boot_kind(setup: &SnapSetup) -> SnapResult<BootSnapKind> {
        match setup.snap_type {
            SnapType::Kernel => Ok(BootSnapKind::Kernel),
            SnapType::Os => Ok(BootSnapKind::Core),
            SnapType::App => Err(SnapError::Boot(format!(
                "snap \"{}\" does not participate in the boot protocol",
                setup.name
            ))),
        }
    }

    // ========================================================================
    // Download / mount / profiles
    // ========================================================================

    fn do_download(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.download(&setup)?;
        let mut st = ctx.lock();
        if let Some(task) = st.task_mut(ctx.task_id()) {
            task.set_progress(1, 1);
        }
        Ok(HandlerOutcome::Done)
    }

    fn undo_download(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.discard(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_mount(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.mount(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_mount(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.unmount(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_setup_profiles(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.setup_profiles(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_setup_profiles(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.remove_profiles(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_remove_profiles(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.remove_profiles(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_remove_profiles(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.setup_profiles(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    // ========================================================================
    // Link / unlink
    // ========================================================================

    fn do_link(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let (is_refresh, entry) = {
            let st = ctx.lock();
            let is_refresh = st
                .task(ctx.task_id())
                .and_then(|t| t.change_id())
                .and_then(|cid| st.change(cid))
                .map(|c| matches!(c.kind(), "refresh-snap" | "auto-refresh"))
                .unwrap_or(false);
            (is_refresh, snaps(&st)?.get(&setup.name).cloned())
        };

        // The hard busy check gates the swap for refreshes; the guard
        // keeps the advisory lock and run-inhibition hint held until the
        // swap completed.
        let _guard = if is_refresh {
            let entry = entry.clone().unwrap_or_default();
            let now = Utc::now();
            match hard_check(
                self.tracker.as_ref(),
                &self.lock_dir,
                &setup.name,
                &entry.endure_services,
                entry.first_inhibited_at,
                self.inhibit_grace,
                now,
                ctx.tomb(),
            ) {
                Ok(guard) => Some(guard),
                Err(SnapError::SnapBusy {
                    snap, apps, pids, ..
                }) => {
                    let mut st = ctx.lock();
                    update_snap(&mut st, &setup.name, |e| {
                        if e.first_inhibited_at.is_none() {
                            e.first_inhibited_at = Some(now);
                        }
                    })?;
                    if let Some(task) = st.task_mut(ctx.task_id()) {
                        task.logf(
                            format!("snap \"{}\" busy: apps {:?} pids {:?}", snap, apps, pids),
                            now,
                        );
                    }
                    return Ok(HandlerOutcome::Retry(self.busy_retry));
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        {
            // Record what was there so the undo can put it back.
            let mut st = ctx.lock();
            let task = st
                .task_mut(ctx.task_id())
                .ok_or_else(|| SnapError::NotFound(format!("task {}", ctx.task_id())))?;
            task.set("had-entry", &entry)?;
        }

        self.backend.link(&setup)?;

        let mut st = ctx.lock();
        update_snap(&mut st, &setup.name, |e| {
            e.revision = setup.revision;
            e.channel = setup.channel.clone();
            e.snap_type = setup.snap_type;
            e.active = true;
            e.first_inhibited_at = None;
        })?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_link(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let previous: Option<super::SnapEntry> = {
            let st = ctx.lock();
            st.task(ctx.task_id())
                .and_then(|t| t.get("had-entry").ok())
                .flatten()
        };
        self.backend.unlink(&setup)?;
        let mut st = ctx.lock();
        match previous {
            Some(prev) => {
                let name = setup.name.clone();
                update_snap(&mut st, &name, |e| *e = prev)?;
            }
            None => drop_snap(&mut st, &setup.name)?,
        }
        Ok(HandlerOutcome::Done)
    }

    fn do_unlink_current(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let current = {
            let st = ctx.lock();
            snaps(&st)?.get(&setup.name).cloned().unwrap_or_default()
        };
        {
            let mut st = ctx.lock();
            let task = st
                .task_mut(ctx.task_id())
                .ok_or_else(|| SnapError::NotFound(format!("task {}", ctx.task_id())))?;
            task.set("previous-revision", &current.revision)?;
        }
        let old = SnapSetup {
            revision: current.revision,
            ..setup.clone()
        };
        self.backend.unlink(&old)?;
        let mut st = ctx.lock();
        update_snap(&mut st, &setup.name, |e| e.active = false)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_unlink_current(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let previous: u32 = {
            let st = ctx.lock();
            st.task(ctx.task_id())
                .and_then(|t| t.get("previous-revision").ok())
                .unwrap_or(setup.revision)
        };
        let old = SnapSetup {
            revision: previous,
            ..setup.clone()
        };
        self.backend.link(&old)?;
        let mut st = ctx.lock();
        update_snap(&mut st, &setup.name, |e| {
            e.revision = previous;
            e.active = true;
        })?;
        Ok(HandlerOutcome::Done)
    }

    // ========================================================================
    // Services
    // ========================================================================

    fn do_start_services(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.start_services(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_start_services(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.stop_services(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_stop_services(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.stop_services(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_stop_services(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.start_services(&setup)?;
        Ok(HandlerOutcome::Done)
    }

    // ========================================================================
    // Discard / busy checks
    // ========================================================================

    fn do_discard(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        self.backend.discard(&setup)?;
        let mut st = ctx.lock();
        drop_snap(&mut st, &setup.name)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_soft_check(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        match soft_check(
            self.tracker.as_ref(),
            &self.lock_dir,
            &setup.name,
            ctx.tomb(),
        ) {
            Ok(()) => Ok(HandlerOutcome::Done),
            Err(SnapError::SnapBusy {
                snap, apps, pids, ..
            }) => {
                let mut st = ctx.lock();
                if let Some(task) = st.task_mut(ctx.task_id()) {
                    task.logf(
                        format!("snap \"{}\" busy: apps {:?} pids {:?}", snap, apps, pids),
                        Utc::now(),
                    );
                }
                Ok(HandlerOutcome::Retry(self.busy_retry))
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Interface connections
    // ========================================================================

    fn do_connect(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        self.connect_with(ctx, false)
    }

    fn do_auto_connect(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        self.connect_with(ctx, true)
    }

    fn connect_with(&self, ctx: &HandlerCtx, auto: bool) -> SnapResult<HandlerOutcome> {
        let conn = self.conn_of(ctx)?;
        self.backend.connect(&conn)?;
        let mut st = ctx.lock();
        let mut map = conns(&st)?;
        map.insert(conn_key(&conn), ConnState { auto });
        st.set(super::CONNS_KEY, &map)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_connect(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let conn = self.conn_of(ctx)?;
        self.backend.disconnect(&conn)?;
        let mut st = ctx.lock();
        let mut map = conns(&st)?;
        map.remove(&conn_key(&conn));
        st.set(super::CONNS_KEY, &map)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_disconnect(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let conn = self.conn_of(ctx)?;
        let previous = {
            let st = ctx.lock();
            conns(&st)?.get(&conn_key(&conn)).cloned()
        };
        {
            let mut st = ctx.lock();
            let task = st
                .task_mut(ctx.task_id())
                .ok_or_else(|| SnapError::NotFound(format!("task {}", ctx.task_id())))?;
            task.set("had-conn", &previous)?;
        }
        self.backend.disconnect(&conn)?;
        let mut st = ctx.lock();
        let mut map = conns(&st)?;
        map.remove(&conn_key(&conn));
        st.set(super::CONNS_KEY, &map)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_disconnect(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let conn = self.conn_of(ctx)?;
        let previous: Option<ConnState> = {
            let st = ctx.lock();
            st.task(ctx.task_id())
                .and_then(|t| t.get("had-conn").ok())
                .flatten()
        };
        let Some(previous) = previous else {
            // Nothing was connected before; nothing to restore.
            return Ok(HandlerOutcome::Done);
        };
        self.backend.connect(&conn)?;
        let mut st = ctx.lock();
        let mut map = conns(&st)?;
        map.insert(conn_key(&conn), previous);
        st.set(super::CONNS_KEY, &map)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_transition_core(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let mut st = ctx.lock();
        if let Some(task) = st.task_mut(ctx.task_id()) {
            task.logf("core transition complete", Utc::now());
        }
        Ok(HandlerOutcome::Done)
    }

    // ========================================================================
    // Boot protocol
    // ========================================================================

    fn do_stage_boot(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let kind = Self::boot_kind(&setup)?;
        let candidate = format!("{}_{}.snap", setup.name, setup.revision);
        // Bootloader writes are serialized by the state lock.
        let mut st = ctx.lock();
        stage_try(self.bootloader.as_ref(), kind, &candidate)?;
        st.set(AWAITING_REBOOT_KEY, &true)?;
        Ok(HandlerOutcome::Done)
    }

    fn undo_stage_boot(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let kind = Self::boot_kind(&setup)?;
        let mut st = ctx.lock();
        let mut clear = std::collections::BTreeMap::new();
        clear.insert(kind.try_var().to_string(), String::new());
        clear.insert("snap_mode".to_string(), String::new());
        self.bootloader.set_boot_vars(clear)?;
        st.set(AWAITING_REBOOT_KEY, &false)?;
        Ok(HandlerOutcome::Done)
    }

    fn do_confirm_boot(&self, ctx: &HandlerCtx) -> SnapResult<HandlerOutcome> {
        let setup = self.setup_of(ctx)?;
        let kind = Self::boot_kind(&setup)?;

        let (mode, awaiting) = {
            let st = ctx.lock();
            let vars = self.bootloader.get_boot_vars(&["snap_mode"])?;
            let mode = vars.get("snap_mode").cloned().unwrap_or_default();
            let awaiting = st.get(AWAITING_REBOOT_KEY).unwrap_or(false);
            (mode, awaiting)
        };

        if mode.is_empty() {
            // No try state at all: non-OS path, nothing to confirm.
            return Ok(HandlerOutcome::Done);
        }
        if mode == crate::boot::MODE_TRY && awaiting {
            // Staged but not rebooted yet; parked until the reboot is
            // reported via mark_rebooted.
            return Ok(HandlerOutcome::Wait);
        }

        let mut st = ctx.lock();
        let outcome = evaluate_try(self.bootloader.as_ref(), kind)?;
        st.set(AWAITING_REBOOT_KEY, &false)?;
        match outcome {
            BootOutcome::NoOp => Ok(HandlerOutcome::Done),
            BootOutcome::Success { revision } => {
                if let Some(task) = st.task_mut(ctx.task_id()) {
                    task.logf(format!("boot candidate {} confirmed", revision), Utc::now());
                }
                Ok(HandlerOutcome::Done)
            }
            BootOutcome::Reverted => Err(SnapError::Boot(format!(
                "snap \"{}\" boot candidate did not boot, reverted",
                setup.name
            ))),
        }
    }
}

/// Report that the machine rebooted: clear the awaiting flag and unpark
/// every confirm-boot task so it can evaluate the boot outcome.
pub fn mark_rebooted(state: &crate::state::StateLock, runner: &TaskRunner) {
    let parked: Vec<String> = {
        let mut st = state.lock();
        let _ = st.set(AWAITING_REBOOT_KEY, &false);
        st.tasks()
            .filter(|t| t.kind() == "confirm-boot" && t.status() == Status::Wait)
            .map(|t| t.id().to_string())
            .collect()
    };
    for task_id in parked {
        runner.resume(&task_id);
    }
    runner.ensure();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapop::SnapSetup;

    #[test]
    fn test_fake_backend_records_calls() {
        let backend = FakeBackend::new();
        let setup = SnapSetup {
            name: "browser".to_string(),
            revision: 2,
            channel: None,
            snap_type: SnapType::App,
        };
        backend.download(&setup).unwrap();
        backend.link(&setup).unwrap();
        assert_eq!(backend.calls(), ["download browser@2", "link browser@2"]);
    }

    #[test]
    fn test_fake_backend_failure_injection() {
        let backend = FakeBackend::new();
        let setup = SnapSetup {
            name: "browser".to_string(),
            revision: 2,
            channel: None,
            snap_type: SnapType::App,
        };
        backend.fail_on("link", "disk full");
        let err = backend.link(&setup).unwrap_err();
        assert_eq!(err.to_string(), "internal error: disk full");
        backend.clear_failure("link");
        assert!(backend.link(&setup).is_ok());
    }

    #[test]
    fn test_boot_kind_mapping() {
        let mut setup = SnapSetup {
            name: "kernel".to_string(),
            revision: 42,
            channel: None,
            snap_type: SnapType::Kernel,
        };
        assert_eq!(
            SnapManager::boot_kind(&setup).unwrap(),
            BootSnapKind::Kernel
        );
        setup.snap_type = SnapType::Os;
        assert_eq!(SnapManager::boot_kind(&setup).unwrap(), BootSnapKind::Core);
        setup.snap_type = SnapType::App;
        assert!(SnapManager::boot_kind(&setup).is_err());
    }
}
