//! Filesystem layout for the daemon's home directory.

use std::path::{Path, PathBuf};

use snaplite_shared::errors::{SnapError, SnapResult};

/// Well-known paths under the daemon home directory.
///
/// ```text
/// home/
/// ├── state.json      # persisted state (atomic temp + rename)
/// ├── lock/           # per-snap advisory and inhibition files
/// └── logs/           # rolling daemon logs
/// ```
#[derive(Debug, Clone)]
pub struct SnapDirs {
    home: PathBuf,
}

impl SnapDirs {
    pub fn new<P: AsRef<Path>>(home: P) -> Self {
        Self {
            home: home.as_ref().to_path_buf(),
        }
    }

    /// The default home directory for the current user.
    pub fn default_home() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("snaplite")
    }

    pub fn home_dir(&self) -> &Path {
        &self.home
    }

    pub fn state_file(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.home.join("lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Create the directory tree.
    pub fn ensure_created(&self) -> SnapResult<()> {
        for dir in [self.home.clone(), self.lock_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                SnapError::Storage(format!("cannot create directory {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

impl Default for SnapDirs {
    fn default() -> Self {
        Self::new(Self::default_home())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_hang_off_home() {
        let dirs = SnapDirs::new("/srv/snaplite");
        assert_eq!(dirs.state_file(), PathBuf::from("/srv/snaplite/state.json"));
        assert_eq!(dirs.lock_dir(), PathBuf::from("/srv/snaplite/lock"));
        assert_eq!(dirs.logs_dir(), PathBuf::from("/srv/snaplite/logs"));
    }

    #[test]
    fn test_ensure_created_builds_tree() {
        let tmp = TempDir::new().unwrap();
        let dirs = SnapDirs::new(tmp.path().join("home"));
        dirs.ensure_created().unwrap();
        assert!(dirs.lock_dir().is_dir());
        assert!(dirs.logs_dir().is_dir());
    }
}
