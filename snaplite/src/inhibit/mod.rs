//! Refresh inhibition: the two-phase busy check around a snap refresh.
//!
//! The soft check runs early (before downloading or staging) and only
//! consults the process state; the hard check runs just before the snap is
//! swapped on disk and, on success, keeps the advisory lock held and marks
//! the snap run-inhibited so the launcher refuses new instances until the
//! swap completes.

mod lock;
mod pids;

pub use lock::{HINT_INHIBITED_FOR_REFRESH, RunInhibitLock, SnapLock};
pub use pids::{CgroupTracker, FakeTracker, ProcessTracker, SnapPids};

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::runner::Tomb;

/// How long a busy snap may fend off a refresh before the hard check
/// forces it through.
pub const DEFAULT_INHIBIT_GRACE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Bound on waiting for the per-snap advisory lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

fn busy_error(snap: &str, pids: &SnapPids, busy_services: Vec<String>) -> SnapError {
    SnapError::SnapBusy {
        snap: snap.to_string(),
        apps: pids
            .apps
            .keys()
            .cloned()
            .chain(busy_services)
            .collect(),
        hooks: pids.hooks.keys().cloned().collect(),
        pids: pids.all_pids(),
    }
}

/// Early busy check, before downloading or staging anything.
///
/// Takes the advisory lock, enumerates the snap's processes, and releases
/// the lock immediately. Running services are tolerated; any app or hook
/// process fails the check.
///
/// # Errors
///
/// [`SnapError::SnapBusy`] when a non-service process runs;
/// [`SnapError::LockTimeout`] when the advisory lock stays held.
pub fn soft_check(
    tracker: &dyn ProcessTracker,
    lock_dir: &Path,
    snap: &str,
    tomb: &Tomb,
) -> SnapResult<()> {
    let mut lock = SnapLock::open(lock_dir, snap)?;
    lock.lock(tomb, LOCK_TIMEOUT)?;
    let pids = tracker.pids_for_snap(snap)?;
    lock.unlock();

    if !pids.apps.is_empty() || !pids.hooks.is_empty() {
        tracing::debug!(snap = %snap, pids = ?pids.all_pids(), "Soft refresh check: snap busy");
        return Err(busy_error(snap, &pids, Vec::new()));
    }
    Ok(())
}

/// Holds the advisory lock and run-inhibition hint through the disk swap.
///
/// Dropping the guard clears the hint and releases the lock; keep it alive
/// until the swap has completed.
#[derive(Debug)]
pub struct InhibitionGuard {
    _lock: SnapLock,
    inhibit: RunInhibitLock,
    lock_dir: PathBuf,
    snap: String,
}

impl InhibitionGuard {
    pub fn snap(&self) -> &str {
        &self.snap
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }
}

impl Drop for InhibitionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.inhibit.clear() {
            tracing::warn!(snap = %self.snap, "Failed to clear inhibition hint: {}", e);
        }
        // The advisory lock releases when `_lock` drops.
    }
}

/// Late busy check, just before the snap is swapped on disk.
///
/// Stricter than the soft check: services fail it too unless named in
/// `endure`. On success the advisory lock stays held and the
/// run-inhibition hint is stamped; both are released when the returned
/// guard drops after the swap.
///
/// `first_inhibited` is the timestamp the caller stamped when this check
/// first failed; once it is older than `grace` the check force-passes so a
/// snap cannot fend off refreshes forever.
///
/// # Errors
///
/// [`SnapError::SnapBusy`] while busy inside the grace window;
/// [`SnapError::InhibitedBeyondGrace`] when the stamp is in the future
/// (bookkeeping inconsistency); [`SnapError::LockTimeout`] as for
/// [`soft_check`].
pub fn hard_check(
    tracker: &dyn ProcessTracker,
    lock_dir: &Path,
    snap: &str,
    endure: &[String],
    first_inhibited: Option<DateTime<Utc>>,
    grace: Duration,
    now: DateTime<Utc>,
    tomb: &Tomb,
) -> SnapResult<InhibitionGuard> {
    if let Some(t0) = first_inhibited
        && t0 > now
    {
        return Err(SnapError::InhibitedBeyondGrace {
            snap: snap.to_string(),
        });
    }

    let mut lock = SnapLock::open(lock_dir, snap)?;
    lock.lock(tomb, LOCK_TIMEOUT)?;

    let pids = tracker.pids_for_snap(snap)?;
    let busy_services: Vec<String> = pids
        .services
        .keys()
        .filter(|s| !endure.contains(s))
        .cloned()
        .collect();
    let busy = !pids.apps.is_empty() || !pids.hooks.is_empty() || !busy_services.is_empty();

    if busy {
        let grace = chrono::Duration::from_std(grace).expect("fits");
        let forced = first_inhibited
            .map(|t0| t0 + grace <= now)
            .unwrap_or(false);
        if !forced {
            lock.unlock();
            tracing::debug!(snap = %snap, pids = ?pids.all_pids(), "Hard refresh check: snap busy");
            return Err(busy_error(snap, &pids, busy_services));
        }
        tracing::warn!(
            snap = %snap,
            inhibited_since = %first_inhibited.expect("forced implies stamp"),
            "Refresh inhibition grace expired, forcing refresh over running processes"
        );
    }

    let inhibit = RunInhibitLock::new(lock_dir, snap);
    inhibit.set_hint(HINT_INHIBITED_FOR_REFRESH)?;
    Ok(InhibitionGuard {
        _lock: lock,
        inhibit,
        lock_dir: lock_dir.to_path_buf(),
        snap: snap.to_string(),
    })
}
