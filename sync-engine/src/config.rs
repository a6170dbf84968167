use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use graph_store::DEFAULT_KEEP_VERSIONS;

/// Storage layout and promotion policy for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding the versioned snapshot directories (`okta_v{N}`).
    pub graph_dir: PathBuf,
    /// SQLite file backing the sync_history sidecar.
    pub metadata_db_path: PathBuf,
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,
    /// Promote staging to current after a clean run.
    #[serde(default = "default_true")]
    pub auto_promote: bool,
    /// When false, a snapshot with any write errors completes but is not
    /// promoted; the stale current version stays visible.
    #[serde(default = "default_true")]
    pub promote_on_errors: bool,
    #[serde(default)]
    pub sync_devices: bool,
}

fn default_keep_versions() -> usize {
    DEFAULT_KEEP_VERSIONS
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            graph_dir: PathBuf::from("./graph_db"),
            metadata_db_path: PathBuf::from("./db/sync_meta.db"),
            keep_versions: DEFAULT_KEEP_VERSIONS,
            auto_promote: true,
            promote_on_errors: true,
            sync_devices: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            graph_dir: std::env::var("GRAPH_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.graph_dir),
            metadata_db_path: std::env::var("METADATA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_db_path),
            keep_versions: std::env::var("GRAPHDB_KEEP_VERSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_KEEP_VERSIONS),
            auto_promote: env_bool("GRAPHDB_AUTO_PROMOTE", true),
            promote_on_errors: env_bool("GRAPHDB_PROMOTE_ON_ERRORS", true),
            sync_devices: env_bool("SYNC_OKTA_DEVICES", false),
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
