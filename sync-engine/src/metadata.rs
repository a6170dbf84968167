//! Operational sidecar for sync state.
//!
//! A single small SQLite table, `sync_history`, written by the orchestrator
//! and read by progress surfaces while a sync is running. Lives outside the
//! versioned graph world on purpose: progress data must stay live across
//! snapshot promotions.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::SyncEngineResult;

/// Rows retained per tenant; older history is dropped after each sync.
pub const SYNC_HISTORY_KEEP: i64 = 100;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    sync_type TEXT NOT NULL DEFAULT 'graph',
    status TEXT NOT NULL DEFAULT 'running',
    start_time TEXT NOT NULL,
    end_time TEXT,
    success INTEGER,
    error_details TEXT,
    users_count INTEGER NOT NULL DEFAULT 0,
    groups_count INTEGER NOT NULL DEFAULT 0,
    apps_count INTEGER NOT NULL DEFAULT 0,
    policies_count INTEGER NOT NULL DEFAULT 0,
    devices_count INTEGER NOT NULL DEFAULT 0,
    progress_percentage INTEGER NOT NULL DEFAULT 0,
    graphdb_version INTEGER,
    graphdb_promoted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_history_tenant
    ON sync_history(tenant_id, start_time);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SyncHistoryRow {
    pub id: i64,
    pub tenant_id: String,
    pub sync_type: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_details: Option<String>,
    pub users_count: i64,
    pub groups_count: i64,
    pub apps_count: i64,
    pub policies_count: i64,
    pub devices_count: i64,
    pub progress_percentage: i64,
    pub graphdb_version: Option<i64>,
    pub graphdb_promoted: bool,
}

/// Partial update applied to a sync_history row. Unset fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct SyncRecordPatch {
    pub status: Option<SyncStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub error_details: Option<String>,
    pub users_count: Option<i64>,
    pub groups_count: Option<i64>,
    pub apps_count: Option<i64>,
    pub policies_count: Option<i64>,
    pub devices_count: Option<i64>,
    pub progress_percentage: Option<i64>,
    pub graphdb_version: Option<i64>,
    pub graphdb_promoted: Option<bool>,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub async fn open(path: &Path) -> SyncEngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::SyncEngineError::Config(e.to_string()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(path = %path.display(), "Metadata store ready");
        Ok(Self { pool })
    }

    pub async fn create_sync_record(
        &self,
        tenant_id: &str,
        sync_type: &str,
    ) -> SyncEngineResult<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_history (tenant_id, sync_type, status, start_time)
             VALUES (?, ?, 'running', ?)",
        )
        .bind(tenant_id)
        .bind(sync_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let sync_id = result.last_insert_rowid();
        info!(sync_id, tenant_id, sync_type, "Created sync record");
        Ok(sync_id)
    }

    pub async fn update_sync_record(
        &self,
        sync_id: i64,
        patch: &SyncRecordPatch,
    ) -> SyncEngineResult<()> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE sync_history SET ");
        let mut any = false;
        {
            let mut fields = builder.separated(", ");
            if let Some(status) = patch.status {
                fields.push("status = ").push_bind_unseparated(status.as_str());
                any = true;
            }
            if let Some(end_time) = patch.end_time {
                fields.push("end_time = ").push_bind_unseparated(end_time);
                any = true;
            }
            if let Some(success) = patch.success {
                fields.push("success = ").push_bind_unseparated(success);
                any = true;
            }
            if let Some(error_details) = &patch.error_details {
                fields
                    .push("error_details = ")
                    .push_bind_unseparated(error_details.clone());
                any = true;
            }
            if let Some(count) = patch.users_count {
                fields.push("users_count = ").push_bind_unseparated(count);
                any = true;
            }
            if let Some(count) = patch.groups_count {
                fields.push("groups_count = ").push_bind_unseparated(count);
                any = true;
            }
            if let Some(count) = patch.apps_count {
                fields.push("apps_count = ").push_bind_unseparated(count);
                any = true;
            }
            if let Some(count) = patch.policies_count {
                fields.push("policies_count = ").push_bind_unseparated(count);
                any = true;
            }
            if let Some(count) = patch.devices_count {
                fields.push("devices_count = ").push_bind_unseparated(count);
                any = true;
            }
            if let Some(pct) = patch.progress_percentage {
                fields
                    .push("progress_percentage = ")
                    .push_bind_unseparated(pct);
                any = true;
            }
            if let Some(version) = patch.graphdb_version {
                fields
                    .push("graphdb_version = ")
                    .push_bind_unseparated(version);
                any = true;
            }
            if let Some(promoted) = patch.graphdb_promoted {
                fields
                    .push("graphdb_promoted = ")
                    .push_bind_unseparated(promoted);
                any = true;
            }
        }
        if !any {
            return Ok(());
        }

        builder.push(" WHERE id = ").push_bind(sync_id);
        builder.build().execute(&self.pool).await?;
        debug!(sync_id, "Updated sync record");
        Ok(())
    }

    pub async fn get_active_sync(
        &self,
        tenant_id: &str,
    ) -> SyncEngineResult<Option<SyncHistoryRow>> {
        let row = sqlx::query_as::<_, SyncHistoryRow>(
            "SELECT * FROM sync_history
             WHERE tenant_id = ? AND status = 'running'
             ORDER BY start_time DESC
             LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_last_completed_sync(
        &self,
        tenant_id: &str,
    ) -> SyncEngineResult<Option<SyncHistoryRow>> {
        let row = sqlx::query_as::<_, SyncHistoryRow>(
            "SELECT * FROM sync_history
             WHERE tenant_id = ? AND status IN ('completed', 'failed', 'canceled')
             ORDER BY end_time DESC
             LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_sync_history(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> SyncEngineResult<Vec<SyncHistoryRow>> {
        let rows = sqlx::query_as::<_, SyncHistoryRow>(
            "SELECT * FROM sync_history
             WHERE tenant_id = ?
             ORDER BY start_time DESC
             LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop everything but the newest `keep` rows for the tenant.
    pub async fn cleanup_old_sync_records(
        &self,
        tenant_id: &str,
        keep: i64,
    ) -> SyncEngineResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_history
             WHERE tenant_id = ? AND id NOT IN (
                 SELECT id FROM sync_history
                 WHERE tenant_id = ?
                 ORDER BY start_time DESC
                 LIMIT ?
             )",
        )
        .bind(tenant_id)
        .bind(tenant_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(tenant_id, deleted, "Pruned old sync history rows");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(&dir.path().join("meta.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_patch_record() {
        let (_dir, store) = store().await;
        let sync_id = store.create_sync_record("acme", "graph").await.unwrap();

        let active = store.get_active_sync("acme").await.unwrap().unwrap();
        assert_eq!(active.id, sync_id);
        assert_eq!(active.status, "running");
        assert_eq!(active.users_count, 0);
        assert!(!active.graphdb_promoted);

        store
            .update_sync_record(
                sync_id,
                &SyncRecordPatch {
                    users_count: Some(42),
                    progress_percentage: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let active = store.get_active_sync("acme").await.unwrap().unwrap();
        assert_eq!(active.users_count, 42);
        assert_eq!(active.progress_percentage, 50);

        store
            .update_sync_record(
                sync_id,
                &SyncRecordPatch {
                    status: Some(SyncStatus::Completed),
                    end_time: Some(Utc::now()),
                    success: Some(true),
                    graphdb_version: Some(2),
                    graphdb_promoted: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.get_active_sync("acme").await.unwrap().is_none());
        let last = store.get_last_completed_sync("acme").await.unwrap().unwrap();
        assert_eq!(last.status, "completed");
        assert_eq!(last.success, Some(true));
        assert_eq!(last.graphdb_version, Some(2));
        assert!(last.graphdb_promoted);
    }

    #[tokio::test]
    async fn test_empty_patch_is_a_no_op() {
        let (_dir, store) = store().await;
        let sync_id = store.create_sync_record("acme", "graph").await.unwrap();
        store
            .update_sync_record(sync_id, &SyncRecordPatch::default())
            .await
            .unwrap();
        let active = store.get_active_sync("acme").await.unwrap().unwrap();
        assert_eq!(active.status, "running");
    }

    #[tokio::test]
    async fn test_history_retention() {
        let (_dir, store) = store().await;
        for _ in 0..5 {
            let id = store.create_sync_record("acme", "graph").await.unwrap();
            store
                .update_sync_record(
                    id,
                    &SyncRecordPatch {
                        status: Some(SyncStatus::Completed),
                        end_time: Some(Utc::now()),
                        success: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let deleted = store.cleanup_old_sync_records("acme", 3).await.unwrap();
        assert_eq!(deleted, 2);
        let history = store.get_sync_history("acme", 10).await.unwrap();
        assert_eq!(history.len(), 3);

        // Other tenants are untouched.
        assert!(store.get_sync_history("other", 10).await.unwrap().is_empty());
    }
}
