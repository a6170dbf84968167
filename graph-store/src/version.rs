//! Versioned snapshot directories with atomic promotion.
//!
//! Readers always resolve `okta_v{current}`, the writer builds
//! `okta_v{current + 1}`, and promotion is a single mutex-guarded integer
//! increment. No file renames, no symlinks: readers that resolved the old
//! path keep their handle, new readers get the new version, and retention
//! keeps the previous version alive until the next cycle.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{GraphStoreError, GraphStoreResult};
use crate::reader::GraphReader;

/// Current + previous, so in-flight reader connections survive a promotion.
pub const DEFAULT_KEEP_VERSIONS: usize = 2;

const VERSION_PREFIX: &str = "okta_v";

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub current_version: u64,
    pub current_path: PathBuf,
    pub current_exists: bool,
    pub staging_version: u64,
    pub staging_path: PathBuf,
    pub staging_exists: bool,
}

pub struct VersionManager {
    root: PathBuf,
    keep_versions: usize,
    current: Mutex<u64>,
}

impl VersionManager {
    pub fn new(root: impl Into<PathBuf>, keep_versions: usize) -> GraphStoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let current = detect_current_version(&root);
        info!(
            root = %root.display(),
            version = current,
            keep_versions,
            "Snapshot version manager initialized"
        );
        Ok(Self {
            root,
            keep_versions: keep_versions.max(1),
            current: Mutex::new(current),
        })
    }

    pub fn current_version(&self) -> u64 {
        *self.current.lock()
    }

    /// Path of the reader-visible snapshot.
    pub fn current_path(&self) -> PathBuf {
        let version = *self.current.lock();
        self.version_path(version)
    }

    /// Path of the writer-visible snapshot; the writer creates it lazily.
    pub fn staging_path(&self) -> PathBuf {
        let version = *self.current.lock();
        self.version_path(version + 1)
    }

    /// Atomically make staging the current snapshot.
    ///
    /// With `validate` set, staging must hold at least one user node; an
    /// empty staging snapshot is never promoted. On success the version
    /// counter increments and retention prunes everything beyond the
    /// configured window.
    pub fn promote_staging(&self, validate: bool) -> GraphStoreResult<u64> {
        let mut current = self.current.lock();
        let staging_version = *current + 1;
        let staging = self.version_path(staging_version);

        if !staging.exists() {
            return Err(GraphStoreError::StagingMissing {
                path: staging.display().to_string(),
            });
        }

        if validate {
            let users = GraphReader::open(&staging)?.user_count()?;
            if users == 0 {
                return Err(GraphStoreError::ValidationFailed(format!(
                    "staging v{staging_version} has no user nodes"
                )));
            }
            info!(version = staging_version, users, "Staging snapshot validated");
        }

        let old_version = *current;
        *current = staging_version;
        info!(
            from = old_version,
            to = staging_version,
            path = %staging.display(),
            "Snapshot promoted"
        );

        self.cleanup_keep_newest(*current);
        Ok(staging_version)
    }

    /// Remove every version directory below the current one. Only safe when
    /// no reader still holds an old handle.
    pub fn force_cleanup_old_versions(&self) -> usize {
        let current = *self.current.lock();
        let mut removed = 0;
        for (version, path) in self.list_versions() {
            if version < current {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        info!(version, "Removed old snapshot");
                        removed += 1;
                    }
                    Err(err) => error!(version, error = %err, "Failed to remove old snapshot"),
                }
            }
        }
        removed
    }

    pub fn version_info(&self) -> VersionInfo {
        let current = *self.current.lock();
        let current_path = self.version_path(current);
        let staging_path = self.version_path(current + 1);
        VersionInfo {
            current_version: current,
            current_exists: current_path.exists(),
            staging_version: current + 1,
            staging_exists: staging_path.exists(),
            current_path,
            staging_path,
        }
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.root.join(format!("{VERSION_PREFIX}{version}"))
    }

    fn cleanup_keep_newest(&self, _current: u64) {
        let mut versions = self.list_versions();
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        for (version, path) in versions.into_iter().skip(self.keep_versions) {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => info!(version, "Retention removed old snapshot"),
                Err(err) => warn!(version, error = %err, "Retention failed to remove snapshot"),
            }
        }
    }

    fn list_versions(&self) -> Vec<(u64, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                if !path.is_dir() {
                    return None;
                }
                let name = entry.file_name().into_string().ok()?;
                let version = name.strip_prefix(VERSION_PREFIX)?.parse::<u64>().ok()?;
                Some((version, path))
            })
            .collect()
    }
}

fn detect_current_version(root: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 1;
    };
    entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            if !entry.path().is_dir() {
                return None;
            }
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix(VERSION_PREFIX)?.parse::<u64>().ok()
        })
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initial_version_defaults_to_one() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::new(dir.path(), 2).unwrap();
        assert_eq!(manager.current_version(), 1);
        assert!(manager.current_path().ends_with("okta_v1"));
        assert!(manager.staging_path().ends_with("okta_v2"));
    }

    #[test]
    fn test_detects_highest_existing_version() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("okta_v3")).unwrap();
        std::fs::create_dir_all(dir.path().join("okta_v7")).unwrap();
        std::fs::create_dir_all(dir.path().join("not_a_version")).unwrap();

        let manager = VersionManager::new(dir.path(), 2).unwrap();
        assert_eq!(manager.current_version(), 7);
        assert!(manager.staging_path().ends_with("okta_v8"));
    }

    #[test]
    fn test_promote_requires_staging() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::new(dir.path(), 2).unwrap();
        let err = manager.promote_staging(false).unwrap_err();
        assert!(matches!(err, GraphStoreError::StagingMissing { .. }));
        assert_eq!(manager.current_version(), 1);
    }

    #[test]
    fn test_promote_increments_and_prunes() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::new(dir.path(), 2).unwrap();

        // Three successive promotions without validation.
        for expected in 2..=4u64 {
            std::fs::create_dir_all(manager.staging_path()).unwrap();
            let old_path = manager.current_path();
            assert_eq!(manager.promote_staging(false).unwrap(), expected);
            assert_eq!(manager.current_version(), expected);
            // A reader that resolved the previous path can still use it.
            if expected == 2 {
                assert!(old_path.ends_with("okta_v1"));
            }
        }

        // keep_versions = 2 leaves exactly current + previous on disk.
        let survivors: Vec<u64> = manager.list_versions().into_iter().map(|(v, _)| v).collect();
        let mut survivors = survivors;
        survivors.sort_unstable();
        assert_eq!(survivors, vec![3, 4]);
    }

    #[test]
    fn test_force_cleanup_removes_everything_below_current() {
        let dir = TempDir::new().unwrap();
        let manager = VersionManager::new(dir.path(), 10).unwrap();
        std::fs::create_dir_all(manager.staging_path()).unwrap();
        manager.promote_staging(false).unwrap();
        std::fs::create_dir_all(manager.staging_path()).unwrap();
        manager.promote_staging(false).unwrap();

        assert_eq!(manager.force_cleanup_old_versions(), 1);
        let versions = manager.list_versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].0, 3);
    }
}
