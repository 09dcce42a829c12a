//! Per-snap lock files.
//!
//! Two files per snap instance live under the lock directory:
//! `<snap>.lock` is the advisory flock(2) serializing refresh-critical
//! sections against the launcher, and `<snap>.inhibit` carries the run
//! inhibition hint the launcher reads before spawning. Only the flock state
//! matters for the advisory lock; the file's existence implies nothing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use snaplite_shared::errors::{SnapError, SnapResult};

use crate::runner::Tomb;

/// Hint value meaning the snap must not start while a refresh swaps it.
pub const HINT_INHIBITED_FOR_REFRESH: &str = "inhibited-for-refresh";

/// Poll step while waiting for a held flock.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Advisory exclusive lock for one snap instance.
#[derive(Debug)]
pub struct SnapLock {
    snap: String,
    file: File,
    locked: bool,
}

impl SnapLock {
    /// Open (creating if needed) the lock file for a snap.
    pub fn open<P: AsRef<Path>>(lock_dir: P, snap: &str) -> SnapResult<Self> {
        let lock_dir = lock_dir.as_ref();
        std::fs::create_dir_all(lock_dir).map_err(|e| {
            SnapError::Storage(format!(
                "cannot create lock directory {}: {}",
                lock_dir.display(),
                e
            ))
        })?;
        let path = lock_dir.join(format!("{}.lock", snap));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                SnapError::Storage(format!("cannot open lock file {}: {}", path.display(), e))
            })?;
        Ok(Self {
            snap: snap.to_string(),
            file,
            locked: false,
        })
    }

    pub fn snap(&self) -> &str {
        &self.snap
    }

    /// Try to take the exclusive flock without blocking.
    pub fn try_lock(&mut self) -> bool {
        let fd = self.file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        self.locked = result == 0;
        self.locked
    }

    /// Take the exclusive flock, polling so the wait stays cancellable.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::LockTimeout`] when the lock stays held past the
    /// bound or the tomb dies while waiting.
    pub fn lock(&mut self, tomb: &Tomb, timeout: Duration) -> SnapResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock() {
                return Ok(());
            }
            if Instant::now() >= deadline || !tomb.sleep(LOCK_POLL) {
                return Err(SnapError::LockTimeout {
                    snap: self.snap.clone(),
                });
            }
        }
    }

    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        let fd = self.file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if result != 0 {
            panic!("flock(LOCK_UN) failed: {}", std::io::Error::last_os_error());
        }
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for SnapLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// The run-inhibition hint file for one snap instance.
///
/// The launcher collaborator takes a shared flock on this file and refuses
/// to start the snap while the hint is non-empty.
#[derive(Debug)]
pub struct RunInhibitLock {
    path: PathBuf,
}

impl RunInhibitLock {
    pub fn new<P: AsRef<Path>>(lock_dir: P, snap: &str) -> Self {
        Self {
            path: lock_dir.as_ref().join(format!("{}.inhibit", snap)),
        }
    }

    /// Write the hint under an exclusive flock.
    pub fn set_hint(&self, hint: &str) -> SnapResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                SnapError::Storage(format!(
                    "cannot open inhibit file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        flock(&file, libc::LOCK_EX)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(hint.as_bytes())?;
        flock(&file, libc::LOCK_UN)?;
        Ok(())
    }

    /// Clear the hint so the launcher may start the snap again.
    pub fn clear(&self) -> SnapResult<()> {
        self.set_hint("")
    }

    /// Read the current hint under a shared flock, the way the launcher
    /// does. A missing file reads as no hint.
    pub fn hint(&self) -> SnapResult<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => {
                return Err(SnapError::Storage(format!(
                    "cannot open inhibit file {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        flock(&file, libc::LOCK_SH)?;
        let mut hint = String::new();
        file.read_to_string(&mut hint)?;
        flock(&file, libc::LOCK_UN)?;
        Ok(hint)
    }
}

fn flock(file: &File, op: libc::c_int) -> SnapResult<()> {
    let result = unsafe { libc::flock(file.as_raw_fd(), op) };
    if result != 0 {
        return Err(SnapError::Storage(format!(
            "flock failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_unlock_cycle() {
        let dir = TempDir::new().unwrap();
        let mut lock = SnapLock::open(dir.path(), "browser").unwrap();
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_second_handle_blocks_while_held() {
        let dir = TempDir::new().unwrap();
        let mut first = SnapLock::open(dir.path(), "browser").unwrap();
        let mut second = SnapLock::open(dir.path(), "browser").unwrap();
        assert!(first.try_lock());
        assert!(!second.try_lock());
        first.unlock();
        assert!(second.try_lock());
    }

    #[test]
    fn test_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let mut held = SnapLock::open(dir.path(), "browser").unwrap();
        assert!(held.try_lock());

        let mut waiter = SnapLock::open(dir.path(), "browser").unwrap();
        let tomb = Tomb::new();
        let err = waiter.lock(&tomb, Duration::from_millis(250)).unwrap_err();
        assert!(matches!(err, SnapError::LockTimeout { .. }));
    }

    #[test]
    fn test_lock_interrupted_by_tomb() {
        let dir = TempDir::new().unwrap();
        let mut held = SnapLock::open(dir.path(), "browser").unwrap();
        assert!(held.try_lock());

        let mut waiter = SnapLock::open(dir.path(), "browser").unwrap();
        let tomb = Tomb::new();
        tomb.kill();
        let err = waiter.lock(&tomb, Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, SnapError::LockTimeout { .. }));
    }

    #[test]
    fn test_different_snaps_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let mut a = SnapLock::open(dir.path(), "a").unwrap();
        let mut b = SnapLock::open(dir.path(), "b").unwrap();
        assert!(a.try_lock());
        assert!(b.try_lock());
    }

    #[test]
    fn test_inhibit_hint_round_trip() {
        let dir = TempDir::new().unwrap();
        let inhibit = RunInhibitLock::new(dir.path(), "browser");
        assert_eq!(inhibit.hint().unwrap(), "");

        inhibit.set_hint(HINT_INHIBITED_FOR_REFRESH).unwrap();
        assert_eq!(inhibit.hint().unwrap(), HINT_INHIBITED_FOR_REFRESH);

        inhibit.clear().unwrap();
        assert_eq!(inhibit.hint().unwrap(), "");
    }
}
