//! In-memory bootloader implementation.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use snaplite_shared::errors::SnapResult;

use super::Bootloader;

/// Bootloader backed by an in-memory variable map; the testing twin of the
/// real firmware-backed implementations.
#[derive(Default)]
pub struct MemBootloader {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MemBootloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single variable directly, bypassing the trait. Test hook for
    /// simulating firmware behavior (e.g. the boot path flipping
    /// `snap_mode` to "trying").
    pub fn set_var(&self, name: &str, value: &str) {
        self.vars
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    /// Read a single variable directly.
    pub fn var(&self, name: &str) -> Option<String> {
        self.vars.lock().get(name).cloned()
    }
}

impl Bootloader for MemBootloader {
    fn get_boot_vars(&self, names: &[&str]) -> SnapResult<BTreeMap<String, String>> {
        let vars = self.vars.lock();
        Ok(names
            .iter()
            .filter_map(|n| vars.get(*n).map(|v| (n.to_string(), v.clone())))
            .collect())
    }

    fn set_boot_vars(&self, new_vars: BTreeMap<String, String>) -> SnapResult<()> {
        let mut vars = self.vars.lock();
        for (name, value) in new_vars {
            vars.insert(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_only_known_names() {
        let bl = MemBootloader::new();
        bl.set_var("snap_kernel", "kernel_41.snap");
        let vars = bl
            .get_boot_vars(&["snap_kernel", "snap_try_kernel"])
            .unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["snap_kernel"], "kernel_41.snap");
    }

    #[test]
    fn test_set_applies_whole_map() {
        let bl = MemBootloader::new();
        let mut map = BTreeMap::new();
        map.insert("snap_mode".to_string(), "try".to_string());
        map.insert("snap_try_core".to_string(), "core_11.snap".to_string());
        bl.set_boot_vars(map).unwrap();
        assert_eq!(bl.var("snap_mode").unwrap(), "try");
        assert_eq!(bl.var("snap_try_core").unwrap(), "core_11.snap");
    }
}
