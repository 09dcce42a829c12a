//! Task and change status model.
//!
//! Defines the possible statuses of a task and the priority order used to
//! derive a change's aggregate status from its tasks.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// A task moves `Do → Doing → Done` on the forward path. On abort the
/// forward path is compensated with `Undo → Undoing → Undone`, tasks that
/// never started become `Hold`, and the failing task itself is `Error`.
/// `Wait` parks a task until another task resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Forward work is pending.
    Do,

    /// A worker is executing the forward handler right now.
    Doing,

    /// Forward work completed successfully.
    Done,

    /// Compensating work is pending (change is aborting).
    Undo,

    /// A worker is executing the undo handler right now.
    Undoing,

    /// Compensating work completed; the forward effects are rolled back.
    Undone,

    /// The task will not run (a predecessor failed or the change aborted
    /// before it started).
    Hold,

    /// The handler failed; the error string is recorded on the task.
    Error,

    /// Parked indefinitely until another task resumes it.
    Wait,
}

/// Priority order for deriving a change's aggregate status.
///
/// The first status in this list that any task of the change holds becomes
/// the change status. Active statuses dominate so an in-flight change never
/// reads as ready; `Error` dominates the settled statuses so an aborted
/// change reads as failed even when every compensation finished.
const AGGREGATE_ORDER: [Status; 9] = [
    Status::Undoing,
    Status::Undo,
    Status::Doing,
    Status::Do,
    Status::Wait,
    Status::Error,
    Status::Undone,
    Status::Done,
    Status::Hold,
];

impl Status {
    /// Check if this status is terminal: no further work will happen.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Hold | Status::Error
        )
    }

    /// Check if this status counts as a successful predecessor for tasks
    /// waiting on it.
    pub fn satisfies_waiters(&self) -> bool {
        matches!(self, Status::Done)
    }

    /// Check if a worker currently owns the task.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Status::Doing | Status::Undoing)
    }

    /// Derive the aggregate status for a set of task statuses.
    ///
    /// An empty set aggregates to `Done` (a change with zero tasks has
    /// nothing left to do).
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut present = [false; 9];
        let mut any = false;
        for status in statuses {
            present[status.order_index()] = true;
            any = true;
        }
        if !any {
            return Status::Done;
        }
        for candidate in AGGREGATE_ORDER {
            if present[candidate.order_index()] {
                return candidate;
            }
        }
        unreachable!("aggregate order covers every status")
    }

    fn order_index(&self) -> usize {
        AGGREGATE_ORDER
            .iter()
            .position(|s| s == self)
            .expect("status present in aggregate order")
    }

    /// Convert to string for logs and the state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Do => "do",
            Status::Doing => "doing",
            Status::Done => "done",
            Status::Undo => "undo",
            Status::Undoing => "undoing",
            Status::Undone => "undone",
            Status::Hold => "hold",
            Status::Error => "error",
            Status::Wait => "wait",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "do" => Ok(Status::Do),
            "doing" => Ok(Status::Doing),
            "done" => Ok(Status::Done),
            "undo" => Ok(Status::Undo),
            "undoing" => Ok(Status::Undoing),
            "undone" => Ok(Status::Undone),
            "hold" => Ok(Status::Hold),
            "error" => Ok(Status::Error),
            "wait" => Ok(Status::Wait),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
