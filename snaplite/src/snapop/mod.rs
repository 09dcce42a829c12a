//! Snap operations: change constructors and their task graphs.
//!
//! Every state-changing operation is expressed as a change holding a chain
//! of tasks; constructors run the conflict check before grafting anything
//! onto the graph. The concrete snap I/O happens in the registered
//! handlers (see [`handlers`]).

mod handlers;

pub use handlers::{
    AWAITING_REBOOT_KEY, DEFAULT_BUSY_RETRY, FakeBackend, SnapBackend, SnapManager,
    SnapManagerConfig, mark_rebooted,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snaplite_shared::errors::{SnapError, SnapResult};

use crate::conflict::{ConnRef, auto_connect_already_pending, check_change_conflict};
use crate::state::{State, TaskSet};

/// Key of the installed-snaps bag in state.
pub const SNAPS_KEY: &str = "snaps";

/// Key of the interface-connections bag in state.
pub const CONNS_KEY: &str = "conns";

/// What kind of snap a name refers to; kernel and OS snaps go through the
/// bootloader try protocol on refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapType {
    #[default]
    App,
    Kernel,
    Os,
}

impl SnapType {
    pub fn needs_boot_protocol(&self) -> bool {
        matches!(self, SnapType::Kernel | SnapType::Os)
    }
}

/// Entry in the installed-snaps bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SnapEntry {
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "is_default_type")]
    pub snap_type: SnapType,
    /// Services allowed to keep running through a refresh.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endure_services: Vec<String>,
    /// Stamped when a hard busy check first fails; cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_inhibited_at: Option<DateTime<Utc>>,
}

fn is_default_type(t: &SnapType) -> bool {
    *t == SnapType::App
}

/// Per-change description of the snap being operated on; stored in each
/// task's data bag so handlers can re-fetch it after re-acquiring the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapSetup {
    pub name: String,
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "is_default_type")]
    pub snap_type: SnapType,
}

/// State of one interface connection in the conns bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ConnState {
    pub auto: bool,
}

// ============================================================================
// BAG HELPERS
// ============================================================================

/// Read the installed-snaps bag; absent reads as empty.
pub fn snaps(st: &State) -> SnapResult<BTreeMap<String, SnapEntry>> {
    match st.get(SNAPS_KEY) {
        Ok(map) => Ok(map),
        Err(SnapError::NoEntry { .. }) => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

/// Mutate one snap's entry (created default-initialized if absent) and
/// write the bag back.
pub fn update_snap(
    st: &mut State,
    name: &str,
    f: impl FnOnce(&mut SnapEntry),
) -> SnapResult<()> {
    let mut map = snaps(st)?;
    f(map.entry(name.to_string()).or_default());
    st.set(SNAPS_KEY, &map)
}

/// Remove a snap's entry entirely.
pub fn drop_snap(st: &mut State, name: &str) -> SnapResult<()> {
    let mut map = snaps(st)?;
    map.remove(name);
    st.set(SNAPS_KEY, &map)
}

/// Read the connections bag; absent reads as empty.
pub fn conns(st: &State) -> SnapResult<BTreeMap<String, ConnState>> {
    match st.get(CONNS_KEY) {
        Ok(map) => Ok(map),
        Err(SnapError::NoEntry { .. }) => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

/// Canonical key for a connection in the conns bag.
pub fn conn_key(conn: &ConnRef) -> String {
    format!(
        "{}:{} {}:{}",
        conn.plug_snap, conn.plug_name, conn.slot_snap, conn.slot_name
    )
}

// ============================================================================
// CHANGE CONSTRUCTORS
// ============================================================================

/// Build one task, stamping the setup into its bag.
fn setup_task(st: &mut State, kind: &str, summary: String, setup: &SnapSetup) -> SnapResult<String> {
    let tid = st.new_task(kind, &summary);
    let task = st.task_mut(&tid).expect("just created");
    task.set("snap-name", &setup.name)?;
    task.set("snap-setup", setup)?;
    Ok(tid)
}

/// Chain task kinds sequentially into a new task set.
fn chain(
    st: &mut State,
    kinds: &[&str],
    setup: &SnapSetup,
    summaries: impl Fn(&str) -> String,
) -> SnapResult<TaskSet> {
    let mut ts = TaskSet::new();
    let mut prev: Option<String> = None;
    for kind in kinds {
        let tid = setup_task(st, kind, summaries(kind), setup)?;
        if let Some(prev) = &prev {
            st.add_wait(&tid, prev)?;
        }
        ts.add_task(&tid);
        prev = Some(tid);
    }
    Ok(ts)
}

/// Construct an install change for a snap not currently installed.
///
/// Task chain: download → mount-snap → setup-profiles → link-snap →
/// start-services.
pub fn install(
    st: &mut State,
    name: &str,
    revision: u32,
    channel: Option<&str>,
) -> SnapResult<String> {
    check_change_conflict(st, &[name], "install-snap", None)?;
    if snaps(st)?.get(name).map(|e| e.active).unwrap_or(false) {
        return Err(SnapError::InvalidState(format!(
            "snap \"{}\" is already installed",
            name
        )));
    }
    let setup = SnapSetup {
        name: name.to_string(),
        revision,
        channel: channel.map(str::to_string),
        snap_type: SnapType::App,
    };
    let change_id = st.new_change("install-snap", &format!("Install snap \"{}\"", name));
    let ts = chain(
        st,
        &[
            "download",
            "mount-snap",
            "setup-profiles",
            "link-snap",
            "start-services",
        ],
        &setup,
        |kind| format!("{} for snap \"{}\" ({})", kind, name, revision),
    )?;
    ts.attach(st, &change_id)?;
    Ok(change_id)
}

/// Construct a refresh change for an installed snap.
///
/// Task chain: download → soft-check-refresh → stop-services →
/// unlink-current-snap → mount-snap → link-snap → start-services, with
/// stage-boot → confirm-boot spliced in before start-services for kernel
/// and OS snaps.
pub fn refresh(st: &mut State, name: &str, revision: u32) -> SnapResult<String> {
    check_change_conflict(st, &[name], "refresh-snap", None)?;
    let entry = snaps(st)?
        .get(name)
        .cloned()
        .ok_or_else(|| SnapError::NotFound(format!("snap \"{}\"", name)))?;
    let setup = SnapSetup {
        name: name.to_string(),
        revision,
        channel: entry.channel.clone(),
        snap_type: entry.snap_type,
    };
    let change_id = st.new_change(
        "refresh-snap",
        &format!("Refresh snap \"{}\" to revision {}", name, revision),
    );
    let mut kinds = vec![
        "download",
        "soft-check-refresh",
        "stop-services",
        "unlink-current-snap",
        "mount-snap",
        "link-snap",
    ];
    if entry.snap_type.needs_boot_protocol() {
        kinds.push("stage-boot");
        kinds.push("confirm-boot");
    }
    kinds.push("start-services");
    let ts = chain(st, &kinds, &setup, |kind| {
        format!("{} for snap \"{}\" ({})", kind, name, revision)
    })?;
    ts.attach(st, &change_id)?;
    Ok(change_id)
}

/// Construct a remove change for an installed snap.
///
/// Task chain: stop-services → remove-profiles → unlink-snap →
/// discard-snap.
pub fn remove(st: &mut State, name: &str) -> SnapResult<String> {
    check_change_conflict(st, &[name], "remove-snap", None)?;
    let entry = snaps(st)?
        .get(name)
        .cloned()
        .ok_or_else(|| SnapError::NotFound(format!("snap \"{}\"", name)))?;
    let setup = SnapSetup {
        name: name.to_string(),
        revision: entry.revision,
        channel: entry.channel.clone(),
        snap_type: entry.snap_type,
    };
    let change_id = st.new_change("remove-snap", &format!("Remove snap \"{}\"", name));
    let ts = chain(
        st,
        &[
            "stop-services",
            "remove-profiles",
            "unlink-snap",
            "discard-snap",
        ],
        &setup,
        |kind| format!("{} for snap \"{}\"", kind, name),
    )?;
    ts.attach(st, &change_id)?;
    Ok(change_id)
}

fn conn_task(st: &mut State, kind: &str, conn: &ConnRef) -> SnapResult<String> {
    let tid = st.new_task(
        kind,
        &format!(
            "{} {}:{} to {}:{}",
            kind, conn.plug_snap, conn.plug_name, conn.slot_snap, conn.slot_name
        ),
    );
    let task = st.task_mut(&tid).expect("just created");
    task.set("conn", conn)?;
    task.set("snap-name", &conn.plug_snap)?;
    Ok(tid)
}

/// Construct a connect change for a (plug, slot) pair.
pub fn connect(st: &mut State, conn: &ConnRef) -> SnapResult<String> {
    check_change_conflict(
        st,
        &[&conn.plug_snap, &conn.slot_snap],
        "connect",
        Some(conn),
    )?;
    let change_id = st.new_change(
        "connect",
        &format!(
            "Connect {}:{} to {}:{}",
            conn.plug_snap, conn.plug_name, conn.slot_snap, conn.slot_name
        ),
    );
    let tid = conn_task(st, "connect", conn)?;
    st.change_add_task(&change_id, &tid)?;
    Ok(change_id)
}

/// Construct a disconnect change for a (plug, slot) pair.
pub fn disconnect(st: &mut State, conn: &ConnRef) -> SnapResult<String> {
    check_change_conflict(
        st,
        &[&conn.plug_snap, &conn.slot_snap],
        "disconnect",
        Some(conn),
    )?;
    let change_id = st.new_change(
        "disconnect",
        &format!(
            "Disconnect {}:{} from {}:{}",
            conn.plug_snap, conn.plug_name, conn.slot_snap, conn.slot_name
        ),
    );
    let tid = conn_task(st, "disconnect", conn)?;
    st.change_add_task(&change_id, &tid)?;
    Ok(change_id)
}

/// Construct an auto-connect change, unless an equivalent one is already
/// scheduled between the two snaps — then the attempt collapses and `None`
/// is returned.
pub fn auto_connect(st: &mut State, conn: &ConnRef) -> SnapResult<Option<String>> {
    if auto_connect_already_pending(st, &conn.plug_snap, &conn.slot_snap) {
        tracing::debug!(
            plug = %conn.plug_snap,
            slot = %conn.slot_snap,
            "Symmetric auto-connect already pending, dropping"
        );
        return Ok(None);
    }
    check_change_conflict(
        st,
        &[&conn.plug_snap, &conn.slot_snap],
        "auto-connect",
        Some(conn),
    )?;
    let change_id = st.new_change(
        "auto-connect",
        &format!(
            "Automatically connect {}:{} to {}:{}",
            conn.plug_snap, conn.plug_name, conn.slot_snap, conn.slot_name
        ),
    );
    let tid = conn_task(st, "auto-connect", conn)?;
    st.change_add_task(&change_id, &tid)?;
    Ok(Some(change_id))
}

/// Construct the core-transition marker change; while it is pending every
/// other mutation backs off with a retry.
pub fn transition_core(st: &mut State) -> SnapResult<String> {
    let pending = st
        .changes()
        .any(|c| c.kind() == crate::conflict::TRANSITION_CORE_KIND && !st.change_is_ready(c.id()));
    if pending {
        return Err(SnapError::InvalidState(
            "core transition already in progress".to_string(),
        ));
    }
    let change_id = st.new_change(
        crate::conflict::TRANSITION_CORE_KIND,
        "Transition to the new core snap",
    );
    let tid = st.new_task(
        crate::conflict::TRANSITION_CORE_KIND,
        "Transition to the new core snap",
    );
    st.change_add_task(&change_id, &tid)?;
    Ok(change_id)
}
