//! Integration tests for the change lifecycle: install, abort/undo,
//! refresh inhibition, conflicts, the boot try protocol and schedule
//! computation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use snaplite::runner::{RunnerOptions, TaskRunner};
use snaplite::schedule::{next, parse_schedule};
use snaplite::snapop::{self, SnapEntry};
use snaplite::state::{MemCheckpointer, State, StateLock, Status};
use snaplite::{
    Collaborators, ConnRef, FakeBackend, FakeTracker, MemBootloader, SnapPids, SnapType,
    SnapliteOptions, SnapliteRuntime,
};
use snaplite_shared::errors::SnapError;
use tempfile::TempDir;

// ============================================================================
// TEST FIXTURES
// ============================================================================

/// Test context with an isolated runtime, fake collaborators and automatic
/// cleanup.
struct TestContext {
    runtime: SnapliteRuntime,
    backend: Arc<FakeBackend>,
    tracker: Arc<FakeTracker>,
    bootloader: Arc<MemBootloader>,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = Arc::new(FakeBackend::new());
        let tracker = Arc::new(FakeTracker::new());
        let bootloader = Arc::new(MemBootloader::new());

        let options = SnapliteOptions {
            home_dir: temp_dir.path().to_path_buf(),
            // Fast retries so busy checks resolve within test time.
            busy_retry: Duration::from_millis(50),
            poll_interval: Duration::from_millis(200),
            ..Default::default()
        };
        let collab = Collaborators {
            backend: backend.clone(),
            tracker: tracker.clone(),
            bootloader: bootloader.clone(),
            ..Collaborators::with_backend(backend.clone())
        };
        let runtime = SnapliteRuntime::new(options, collab).expect("Failed to create runtime");
        Self {
            runtime,
            backend,
            tracker,
            bootloader,
            _temp_dir: temp_dir,
        }
    }

    fn seed_snap(&self, name: &str, revision: u32, snap_type: SnapType) {
        self.runtime.with_state(|st| {
            snapop::update_snap(st, name, |e| {
                e.revision = revision;
                e.active = true;
                e.snap_type = snap_type;
            })
            .unwrap();
        });
    }

    fn snap_entry(&self, name: &str) -> Option<SnapEntry> {
        self.runtime
            .with_state(|st| snapop::snaps(st).unwrap().get(name).cloned())
    }

    fn task_status(&self, change_id: &str, kind: &str) -> Option<Status> {
        self.runtime.with_state(|st| {
            let ids = st.change(change_id)?.task_ids().to_vec();
            ids.iter()
                .filter_map(|id| st.task(id))
                .find(|t| t.kind() == kind)
                .map(|t| t.status())
        })
    }

    fn wait_task_status(&self, change_id: &str, kind: &str, status: Status) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.task_status(change_id, kind) == Some(status) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.runtime.stop(Duration::from_secs(5));
    }
}

// ============================================================================
// INSTALL HAPPY PATH
// ============================================================================

#[test]
fn install_runs_task_chain_in_order() {
    let ctx = TestContext::new();
    ctx.runtime.start();

    let change_id = ctx.runtime.install("browser", 1, Some("stable")).unwrap();
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Done);

    assert_eq!(
        ctx.backend.calls(),
        [
            "download browser@1",
            "mount browser@1",
            "setup-profiles browser@1",
            "link browser@1",
            "start-services browser@1",
        ]
    );

    // The snaps bag records the new revision.
    let entry = ctx.snap_entry("browser").unwrap();
    assert_eq!(entry.revision, 1);
    assert!(entry.active);

    // Every task of the change is done.
    ctx.runtime.with_state(|st| {
        let change = st.change(&change_id).unwrap().clone();
        for id in change.task_ids() {
            assert_eq!(st.task(id).unwrap().status(), Status::Done);
        }
    });
}

#[test]
fn install_persists_state_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let backend = Arc::new(FakeBackend::new());
        let options = SnapliteOptions {
            home_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let runtime =
            SnapliteRuntime::new(options, Collaborators::with_backend(backend)).unwrap();
        runtime.start();
        let change_id = runtime.install("browser", 3, None).unwrap();
        assert!(runtime.wait_change_ready(&change_id, Duration::from_secs(5)));
        runtime.stop(Duration::from_secs(5));
    }

    // A fresh runtime over the same home sees the installed snap and the
    // finished change.
    let backend = Arc::new(FakeBackend::new());
    let options = SnapliteOptions {
        home_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let runtime = SnapliteRuntime::new(options, Collaborators::with_backend(backend)).unwrap();
    runtime.with_state(|st| {
        let snaps = snapop::snaps(st).unwrap();
        assert_eq!(snaps["browser"].revision, 3);
        let change = st.changes().next().unwrap();
        assert_eq!(change.kind(), "install-snap");
        assert!(st.change_is_ready(change.id()));
    });
}

// ============================================================================
// INSTALL WITH ABORT
// ============================================================================

#[test]
fn failed_link_aborts_and_undoes_in_reverse() {
    let ctx = TestContext::new();
    ctx.backend.fail_on("link", "disk full");
    ctx.runtime.start();

    let change_id = ctx.runtime.install("browser", 1, None).unwrap();
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Error);

    ctx.runtime.with_state(|st| {
        let change = st.change(&change_id).unwrap().clone();
        let by_kind: Vec<(String, Status)> = change
            .task_ids()
            .iter()
            .filter_map(|id| st.task(id))
            .map(|t| (t.kind().to_string(), t.status()))
            .collect();
        for (kind, status) in &by_kind {
            match kind.as_str() {
                "link-snap" => assert_eq!(*status, Status::Error),
                "start-services" => assert_eq!(*status, Status::Hold),
                _ => assert_eq!(*status, Status::Undone, "{} should be undone", kind),
            }
        }
        // The error message is preserved verbatim.
        let failed = change
            .task_ids()
            .iter()
            .filter_map(|id| st.task(id))
            .find(|t| t.kind() == "link-snap")
            .unwrap();
        assert!(failed.error().unwrap().contains("disk full"));
    });

    // Undo walked the graph in reverse of the wait edges.
    let calls = ctx.backend.calls();
    assert_eq!(
        calls,
        [
            "download browser@1",
            "mount browser@1",
            "setup-profiles browser@1",
            // link failed and is not recorded; compensation follows.
            "remove-profiles browser@1",
            "unmount browser@1",
            "discard browser@1",
        ]
    );
}

// ============================================================================
// REFRESH BUSY AND INHIBITION GRACE
// ============================================================================

#[test]
fn busy_soft_check_retries_until_snap_quiesces() {
    let ctx = TestContext::new();
    ctx.seed_snap("browser", 1, SnapType::App);

    // A running non-service process keeps the soft check busy.
    let mut pids = SnapPids::default();
    pids.apps.insert("browser".to_string(), vec![4242]);
    ctx.tracker.set("browser", pids);

    ctx.runtime.start();
    let change_id = ctx.runtime.refresh("browser", 2).unwrap();

    // The soft check converts busy into retries.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_retry = false;
    while Instant::now() < deadline {
        let retries = ctx.runtime.with_state(|st| {
            st.change(&change_id)
                .unwrap()
                .task_ids()
                .iter()
                .filter_map(|id| st.task(id))
                .find(|t| t.kind() == "soft-check-refresh")
                .map(|t| t.retries())
                .unwrap_or(0)
        });
        if retries > 0 {
            saw_retry = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saw_retry, "soft check should have retried while busy");
    assert_ne!(ctx.runtime.change_status(&change_id), Status::Done);

    // The app exits; the refresh completes.
    ctx.tracker.clear("browser");
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Done);
    assert_eq!(ctx.snap_entry("browser").unwrap().revision, 2);
}

#[test]
fn hard_check_grace_window_forces_refresh() {
    let ctx = TestContext::new();
    ctx.seed_snap("browser", 1, SnapType::App);

    // A running service passes the soft check but fails the hard check.
    let mut pids = SnapPids::default();
    pids.services.insert("updater".to_string(), vec![4242]);
    ctx.tracker.set("browser", pids);

    ctx.runtime.start();
    let change_id = ctx.runtime.refresh("browser", 2).unwrap();

    // Wait for the hard check to fail at least once and stamp the snap.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(entry) = ctx.snap_entry("browser")
            && entry.first_inhibited_at.is_some()
        {
            break;
        }
        assert!(Instant::now() < deadline, "hard check never stamped");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_ne!(ctx.runtime.change_status(&change_id), Status::Done);

    // Simulate two weeks of inhibition by skewing the stamp into the past.
    ctx.runtime.with_state(|st| {
        snapop::update_snap(st, "browser", |e| {
            e.first_inhibited_at = Some(Utc::now() - chrono::Duration::days(15));
        })
        .unwrap();
    });

    // The next attempt forces through despite the running service.
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Done);
    let entry = ctx.snap_entry("browser").unwrap();
    assert_eq!(entry.revision, 2);
    assert_eq!(entry.first_inhibited_at, None);
}

// ============================================================================
// CONFLICT SERIALIZATION
// ============================================================================

#[test]
fn overlapping_mutations_on_one_snap_conflict() {
    let ctx = TestContext::new();
    ctx.seed_snap("a", 1, SnapType::App);

    // Submit an install while the runner is not draining, so it stays
    // in flight.
    ctx.runtime.with_state(|st| {
        snapop::update_snap(st, "a", |e| e.active = false).unwrap();
    });
    let install_id = ctx.runtime.install("a", 2, None).unwrap();

    let err = ctx.runtime.remove("a").unwrap_err();
    match err {
        SnapError::Conflict { snap, kind } => {
            assert_eq!(snap, "a");
            assert_eq!(kind, "install-snap");
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // The first change proceeds unaffected.
    ctx.runtime.start();
    assert!(
        ctx.runtime
            .wait_change_ready(&install_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&install_id), Status::Done);

    // With the install finished the remove goes through.
    let remove_id = ctx.runtime.remove("a").unwrap();
    assert!(
        ctx.runtime
            .wait_change_ready(&remove_id, Duration::from_secs(5))
    );
    assert!(ctx.snap_entry("a").is_none());
}

// ============================================================================
// BOOT TRY PROTOCOL
// ============================================================================

#[test]
fn kernel_refresh_stages_and_confirms_boot() {
    let ctx = TestContext::new();
    ctx.seed_snap("kernel", 41, SnapType::Kernel);
    ctx.bootloader.set_var("snap_kernel", "kernel_41.snap");
    ctx.runtime.start();

    let change_id = ctx.runtime.refresh("kernel", 42).unwrap();

    // The confirm task parks awaiting the reboot; the candidate is
    // staged in try state.
    assert!(ctx.wait_task_status(&change_id, "confirm-boot", Status::Wait));
    assert_eq!(
        ctx.bootloader.var("snap_try_kernel").unwrap(),
        "kernel_42.snap"
    );
    assert_eq!(ctx.bootloader.var("snap_mode").unwrap(), "try");

    // Simulated reboot reached userspace.
    ctx.bootloader.set_var("snap_mode", "trying");
    ctx.runtime.mark_rebooted();

    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Done);
    assert_eq!(ctx.bootloader.var("snap_kernel").unwrap(), "kernel_42.snap");
    assert_eq!(ctx.bootloader.var("snap_try_kernel").unwrap(), "");
    assert_eq!(ctx.bootloader.var("snap_mode").unwrap(), "");
}

#[test]
fn failed_kernel_boot_reverts_and_aborts() {
    let ctx = TestContext::new();
    ctx.seed_snap("kernel", 41, SnapType::Kernel);
    ctx.bootloader.set_var("snap_kernel", "kernel_41.snap");
    ctx.runtime.start();

    let change_id = ctx.runtime.refresh("kernel", 42).unwrap();
    assert!(ctx.wait_task_status(&change_id, "confirm-boot", Status::Wait));

    // The reboot happened but the candidate never reached userspace:
    // snap_mode is still "try".
    ctx.runtime.mark_rebooted();

    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Error);
    // Try state was cleared so the old kernel keeps booting.
    assert_eq!(ctx.bootloader.var("snap_try_kernel").unwrap(), "");
    assert_eq!(ctx.bootloader.var("snap_mode").unwrap(), "");
    assert_eq!(ctx.bootloader.var("snap_kernel").unwrap(), "kernel_41.snap");
    // The link was rolled back to the old revision.
    let entry = ctx.snap_entry("kernel").unwrap();
    assert_eq!(entry.revision, 41);
}

// ============================================================================
// CONNECTIONS
// ============================================================================

#[test]
fn connect_records_connection_state() {
    let ctx = TestContext::new();
    ctx.runtime.start();

    let conn = ConnRef::new("browser", "network", "core", "network");
    let change_id = ctx.runtime.connect(&conn).unwrap();
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    assert_eq!(ctx.runtime.change_status(&change_id), Status::Done);

    ctx.runtime.with_state(|st| {
        let conns = snapop::conns(st).unwrap();
        let state = &conns["browser:network core:network"];
        assert!(!state.auto);
    });

    // Disconnect removes it again.
    let change_id = ctx.runtime.disconnect(&conn).unwrap();
    assert!(
        ctx.runtime
            .wait_change_ready(&change_id, Duration::from_secs(5))
    );
    ctx.runtime
        .with_state(|st| assert!(snapop::conns(st).unwrap().is_empty()));
}

#[test]
fn symmetric_auto_connect_is_dropped() {
    let ctx = TestContext::new();

    let conn = ConnRef::new("a", "net", "b", "net");
    let first = ctx.runtime.auto_connect(&conn).unwrap();
    assert!(first.is_some());

    let mirrored = ConnRef::new("b", "serial", "a", "serial");
    let second = ctx.runtime.auto_connect(&mirrored).unwrap();
    assert!(second.is_none(), "symmetric auto-connect must collapse");
}

// ============================================================================
// ENSURE IDEMPOTENCE
// ============================================================================

#[test]
fn idle_ensure_passes_write_no_checkpoints() {
    let checkpointer = Arc::new(MemCheckpointer::new());
    struct Fwd(Arc<MemCheckpointer>);
    impl snaplite::state::Checkpointer for Fwd {
        fn checkpoint(&self, data: &[u8]) -> snaplite_shared::errors::SnapResult<()> {
            self.0.checkpoint(data)
        }
    }
    let state = Arc::new(StateLock::new(
        State::new(),
        Box::new(Fwd(checkpointer.clone())),
    ));
    let runner = TaskRunner::new(state.clone(), RunnerOptions::default());
    runner.start();

    runner.ensure();
    runner.ensure();
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(checkpointer.count(), 0, "idle passes must not checkpoint");
    assert_eq!(state.lock().tasks().count(), 0);
    runner.stop(Duration::from_secs(5));
}

// ============================================================================
// SCHEDULE COMPUTATION
// ============================================================================

#[test]
fn schedule_next_window_matches_expected_monday() {
    let schedules = parse_schedule("mon,10:00~11:00").unwrap();
    let last = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

    let window = next(&schedules, last).unwrap();
    assert_eq!(
        window.start,
        Utc.with_ymd_and_hms(2023, 1, 2, 10, 0, 0).unwrap()
    );
    assert_eq!(
        window.end,
        Utc.with_ymd_and_hms(2023, 1, 2, 11, 0, 0).unwrap()
    );

    // Repeated computation yields the same deterministic window; the
    // fire instant is randomized inside it.
    assert_eq!(next(&schedules, last), next(&schedules, last));
    let mut rng = rand::rng();
    for _ in 0..20 {
        let fire = window.fire_time(&mut rng);
        assert!(fire >= window.start && fire <= window.end);
    }
}
