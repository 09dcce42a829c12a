//! Process enumeration for busy checks.
//!
//! Running snap processes are found by their security tags in the cgroup
//! hierarchy: every app, hook and service of a snap runs inside a
//! transient unit named after its tag (`snap.<name>.<app>-<uuid>.scope`,
//! `snap.<name>.hook.<hook>-<uuid>.scope`, `snap.<name>.<app>.service`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use snaplite_shared::errors::SnapResult;
use walkdir::WalkDir;

/// Running processes of one snap, classified by component.
#[derive(Debug, Default, Clone)]
pub struct SnapPids {
    /// Application name → pids running under transient scopes.
    pub apps: BTreeMap<String, Vec<u32>>,
    /// Hook name → pids.
    pub hooks: BTreeMap<String, Vec<u32>>,
    /// Service name → pids running under service units.
    pub services: BTreeMap<String, Vec<u32>>,
}

impl SnapPids {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.hooks.is_empty() && self.services.is_empty()
    }

    /// Every pid across all components.
    pub fn all_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .apps
            .values()
            .chain(self.hooks.values())
            .chain(self.services.values())
            .flatten()
            .copied()
            .collect();
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

/// Collaborator that enumerates the running processes of a snap.
pub trait ProcessTracker: Send + Sync {
    fn pids_for_snap(&self, snap: &str) -> SnapResult<SnapPids>;
}

/// Tracker that walks the cgroup hierarchy on the host.
pub struct CgroupTracker {
    root: PathBuf,
}

impl CgroupTracker {
    /// Tracker over the standard unified hierarchy mount.
    pub fn new() -> Self {
        Self::with_root("/sys/fs/cgroup")
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for CgroupTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTracker for CgroupTracker {
    fn pids_for_snap(&self, snap: &str) -> SnapResult<SnapPids> {
        let mut pids = SnapPids::default();
        let prefix = format!("snap.{}.", snap);
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let Some(unit) = entry.file_name().to_str() else {
                continue;
            };
            let Some(component) = security_tag_component(unit, &prefix) else {
                continue;
            };
            let procs = read_cgroup_procs(&entry.path().join("cgroup.procs"));
            if procs.is_empty() {
                continue;
            }
            match component {
                Component::App(name) => pids.apps.entry(name).or_default().extend(procs),
                Component::Hook(name) => pids.hooks.entry(name).or_default().extend(procs),
                Component::Service(name) => pids.services.entry(name).or_default().extend(procs),
            }
        }
        Ok(pids)
    }
}

enum Component {
    App(String),
    Hook(String),
    Service(String),
}

/// Classify a unit directory name against `snap.<name>.`; returns the
/// component it runs, or None when the unit belongs to another snap.
fn security_tag_component(unit: &str, prefix: &str) -> Option<Component> {
    let rest = unit.strip_prefix(prefix)?;
    if let Some(service) = rest.strip_suffix(".service") {
        return Some(Component::Service(service.to_string()));
    }
    let scope = rest.strip_suffix(".scope")?;
    // Transient scopes carry a uuid suffix after the last dash.
    let base = scope.rsplit_once('-').map(|(b, _)| b).unwrap_or(scope);
    if let Some(hook) = base.strip_prefix("hook.") {
        Some(Component::Hook(hook.to_string()))
    } else {
        Some(Component::App(base.to_string()))
    }
}

fn read_cgroup_procs(path: &Path) -> Vec<u32> {
    std::fs::read_to_string(path)
        .map(|text| text.lines().filter_map(|l| l.trim().parse().ok()).collect())
        .unwrap_or_default()
}

/// Tracker with injectable process sets; the testing twin of
/// [`CgroupTracker`].
#[derive(Default)]
pub struct FakeTracker {
    by_snap: Mutex<BTreeMap<String, SnapPids>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, snap: &str, pids: SnapPids) {
        self.by_snap.lock().insert(snap.to_string(), pids);
    }

    pub fn clear(&self, snap: &str) {
        self.by_snap.lock().remove(snap);
    }
}

impl ProcessTracker for FakeTracker {
    fn pids_for_snap(&self, snap: &str) -> SnapResult<SnapPids> {
        Ok(self
            .by_snap
            .lock()
            .get(snap)
            .cloned()
            .unwrap_or_default())
    }
}
