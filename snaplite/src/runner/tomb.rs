//! Cooperative cancellation token shared between the scheduler and its
//! workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Kill token observed cooperatively by the scheduler thread and every
/// worker. Killing never preempts: a handler notices the token at its next
/// check or timed wait.
#[derive(Clone)]
pub struct Tomb {
    inner: Arc<TombInner>,
}

struct TombInner {
    dead: Mutex<bool>,
    cv: Condvar,
}

impl Tomb {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TombInner {
                dead: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Signal every observer to wind down.
    pub fn kill(&self) {
        let mut dead = self.inner.dead.lock();
        *dead = true;
        self.inner.cv.notify_all();
    }

    pub fn is_alive(&self) -> bool {
        !*self.inner.dead.lock()
    }

    /// Sleep for up to `d`, waking early on kill. Returns true while the
    /// tomb is still alive, so handlers can write
    /// `while tomb.sleep(poll) { ... }` retry loops.
    pub fn sleep(&self, d: Duration) -> bool {
        let mut dead = self.inner.dead.lock();
        if *dead {
            return false;
        }
        self.inner.cv.wait_for(&mut dead, d);
        !*dead
    }
}

impl Default for Tomb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_starts_alive() {
        let tomb = Tomb::new();
        assert!(tomb.is_alive());
    }

    #[test]
    fn test_kill_is_observed() {
        let tomb = Tomb::new();
        tomb.kill();
        assert!(!tomb.is_alive());
        assert!(!tomb.sleep(Duration::from_secs(10)));
    }

    #[test]
    fn test_sleep_interrupted_by_kill() {
        let tomb = Tomb::new();
        let observer = tomb.clone();
        let handle = thread::spawn(move || observer.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        tomb.kill();
        // The sleeper returns promptly instead of waiting 30 s.
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_sleep_times_out_while_alive() {
        let tomb = Tomb::new();
        assert!(tomb.sleep(Duration::from_millis(5)));
    }
}
