//! Pre-flight conflict detection for new changes.
//!
//! Before a constructor grafts new tasks onto the graph it runs a pure
//! predicate over the current state: mutations on a snap are serialized by
//! rejecting overlap with any non-ready change that already touches it.
//! Some overlaps are ordering problems rather than user errors; those
//! surface as a retry hint instead of a conflict.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::state::State;

/// Backoff suggested while a core transition blocks all other mutations.
const TRANSITION_RETRY: Duration = Duration::from_secs(60);

/// Backoff suggested to serialize a connect behind an in-flight
/// auto-connect.
const AUTO_CONNECT_RETRY: Duration = Duration::from_millis(500);

/// Change kind that migrates the OS snap; while one is pending every other
/// mutation backs off.
pub const TRANSITION_CORE_KIND: &str = "transition-core";

/// Identity of an interface connection: the (plug, slot) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnRef {
    pub plug_snap: String,
    pub plug_name: String,
    pub slot_snap: String,
    pub slot_name: String,
}

impl ConnRef {
    pub fn new(plug_snap: &str, plug_name: &str, slot_snap: &str, slot_name: &str) -> Self {
        Self {
            plug_snap: plug_snap.to_string(),
            plug_name: plug_name.to_string(),
            slot_snap: slot_snap.to_string(),
            slot_name: slot_name.to_string(),
        }
    }

    /// The snaps on either side of the connection.
    pub fn snaps(&self) -> [&str; 2] {
        [&self.plug_snap, &self.slot_snap]
    }

    fn touches(&self, snap: &str) -> bool {
        self.plug_snap == snap || self.slot_snap == snap
    }
}

/// Check whether a new operation on `snaps` may start now.
///
/// `conn` carries the (plug, slot) pair when the new operation is a
/// connect or disconnect, enabling the disjoint-pair exemption.
///
/// # Errors
///
/// - [`SnapError::Conflict`] names the snap and the kind of the in-flight
///   change; the caller must not create the change.
/// - [`SnapError::RetryLater`] asks the caller to re-attempt after a
///   backoff so the two operations serialize.
pub fn check_change_conflict(
    st: &State,
    snaps: &[&str],
    new_kind: &str,
    conn: Option<&ConnRef>,
) -> SnapResult<()> {
    for change in st.changes() {
        if st.change_is_ready(change.id()) {
            continue;
        }
        if change.kind() == TRANSITION_CORE_KIND {
            tracing::debug!(kind = %new_kind, "Change blocked behind core transition");
            return Err(SnapError::RetryLater {
                after: TRANSITION_RETRY,
            });
        }
        for task in change.task_ids().iter().filter_map(|id| st.task(id)) {
            if task.status().is_ready() {
                continue;
            }
            match task.kind() {
                "connect" | "disconnect" => {
                    let Ok(existing) = task.get::<ConnRef>("conn") else {
                        continue;
                    };
                    if let Some(new_conn) = conn {
                        // Connect-class operations on disjoint (plug, slot)
                        // pairs do not conflict, even on the same snap.
                        if existing == *new_conn {
                            return Err(SnapError::Conflict {
                                snap: existing.plug_snap.clone(),
                                kind: change.kind().to_string(),
                            });
                        }
                    } else if let Some(snap) = snaps.iter().find(|&&s| existing.touches(s)) {
                        return Err(SnapError::Conflict {
                            snap: snap.to_string(),
                            kind: change.kind().to_string(),
                        });
                    }
                }
                "auto-connect" => {
                    let owner = task.get::<String>("snap-name").ok();
                    let overlaps = owner
                        .as_deref()
                        .map(|o| snaps.contains(&o))
                        .unwrap_or(false);
                    if !overlaps {
                        continue;
                    }
                    if conn.is_some() || new_kind == "connect" {
                        // Hold the new connect so it runs after the
                        // auto-connect settles.
                        return Err(SnapError::RetryLater {
                            after: AUTO_CONNECT_RETRY,
                        });
                    }
                    return Err(SnapError::Conflict {
                        snap: owner.unwrap_or_default(),
                        kind: change.kind().to_string(),
                    });
                }
                _ => {
                    let Ok(name) = task.get::<String>("snap-name") else {
                        continue;
                    };
                    if snaps.contains(&name.as_str()) {
                        return Err(SnapError::Conflict {
                            snap: name,
                            kind: change.kind().to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// True when an auto-connect between the two snaps is already scheduled in
/// a non-ready change, in either orientation. Callers drop the duplicate
/// attempt instead of queueing it.
pub fn auto_connect_already_pending(st: &State, snap_a: &str, snap_b: &str) -> bool {
    for change in st.changes() {
        if st.change_is_ready(change.id()) {
            continue;
        }
        for task in change.task_ids().iter().filter_map(|id| st.task(id)) {
            if task.kind() != "auto-connect" {
                continue;
            }
            let Ok(conn) = task.get::<ConnRef>("conn") else {
                continue;
            };
            if conn.touches(snap_a) && conn.touches(snap_b) {
                return true;
            }
        }
    }
    false
}
