//! End-to-end sync run.
//!
//! Opens the staging snapshot, streams entities out of Okta in dependency
//! order (groups → applications → users → devices → policies) straight into
//! the graph writer, patches the sync_history row after every batch, and
//! promotes staging on success. Failure or cancellation leaves staging on
//! disk for the next run and records the terminal status.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use graph_store::{EntityCounts, GraphWriter, VersionManager};
use okta_client::fetch::BatchProcessor;
use okta_client::progress::ProgressSink;
use okta_client::{CancelFlag, OktaClientResult, OktaConfig, OktaFetcher, OktaHttpClient};

use crate::config::SyncConfig;
use crate::error::{SyncEngineError, SyncEngineResult};
use crate::metadata::{MetadataStore, SYNC_HISTORY_KEEP, SyncRecordPatch, SyncStatus};

// Coarse phase ladder reported through sync_history. The user phase scales
// inside its span because it dominates wall-clock time.
const PROGRESS_GROUPS: i64 = 15;
const PROGRESS_APPS: i64 = 35;
const PROGRESS_USERS_BASE: i64 = 35;
const PROGRESS_USERS_SPAN: i64 = 40;
const PROGRESS_DEVICES: i64 = 85;
const PROGRESS_POLICIES: i64 = 95;

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub sync_id: i64,
    pub counts: EntityCounts,
    pub version: u64,
    pub promoted: bool,
    pub write_errors: u64,
}

pub struct SyncOrchestrator {
    okta_config: Arc<OktaConfig>,
    sync_config: Arc<SyncConfig>,
    versions: Arc<VersionManager>,
    metadata: MetadataStore,
    cancel: CancelFlag,
    sink: Arc<dyn ProgressSink>,
}

impl SyncOrchestrator {
    pub fn new(
        okta_config: Arc<OktaConfig>,
        sync_config: Arc<SyncConfig>,
        versions: Arc<VersionManager>,
        metadata: MetadataStore,
        cancel: CancelFlag,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            okta_config,
            sync_config,
            versions,
            metadata,
            cancel,
            sink,
        }
    }

    /// Run one complete sync. Reuses `existing_sync_id` when the control
    /// surface already created the row.
    pub async fn run(&self, existing_sync_id: Option<i64>) -> SyncEngineResult<SyncOutcome> {
        let tenant = self.okta_config.tenant_id();
        let sync_id = match existing_sync_id {
            Some(id) => id,
            None => self.metadata.create_sync_record(&tenant, "graph").await?,
        };
        info!(sync_id, tenant = %tenant, "Starting graph sync");

        match self.run_phases(sync_id, &tenant).await {
            Ok(outcome) => {
                self.metadata
                    .update_sync_record(
                        sync_id,
                        &SyncRecordPatch {
                            status: Some(SyncStatus::Completed),
                            end_time: Some(Utc::now()),
                            success: Some(true),
                            progress_percentage: Some(100),
                            users_count: Some(outcome.counts.users as i64),
                            groups_count: Some(outcome.counts.groups as i64),
                            apps_count: Some(outcome.counts.apps as i64),
                            policies_count: Some(outcome.counts.policies as i64),
                            devices_count: Some(outcome.counts.devices as i64),
                            graphdb_version: Some(outcome.version as i64),
                            graphdb_promoted: Some(outcome.promoted),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.metadata
                    .cleanup_old_sync_records(&tenant, SYNC_HISTORY_KEEP)
                    .await?;
                info!(
                    sync_id,
                    promoted = outcome.promoted,
                    version = outcome.version,
                    write_errors = outcome.write_errors,
                    "Graph sync completed"
                );
                Ok(outcome)
            }
            Err(err) if err.is_canceled() => {
                warn!(sync_id, "Graph sync canceled");
                self.finalize_with_status(sync_id, SyncStatus::Canceled, "Sync canceled by user")
                    .await;
                Err(SyncEngineError::Canceled)
            }
            Err(err) => {
                error!(sync_id, error = %err, "Graph sync failed");
                self.finalize_with_status(sync_id, SyncStatus::Failed, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn finalize_with_status(&self, sync_id: i64, status: SyncStatus, detail: &str) {
        let patch = SyncRecordPatch {
            status: Some(status),
            end_time: Some(Utc::now()),
            success: Some(false),
            error_details: Some(detail.to_string()),
            graphdb_promoted: Some(false),
            ..Default::default()
        };
        if let Err(err) = self.metadata.update_sync_record(sync_id, &patch).await {
            error!(sync_id, error = %err, "Failed to record terminal sync status");
        }
    }

    async fn run_phases(&self, sync_id: i64, tenant: &str) -> SyncEngineResult<SyncOutcome> {
        let staging = self.versions.staging_path();
        let writer = Arc::new(GraphWriter::open(
            &staging,
            &self.okta_config.custom_attributes,
        )?);
        info!(path = %staging.display(), "Writing to staging snapshot");

        let client = Arc::new(OktaHttpClient::new(
            self.okta_config.clone(),
            self.sink.clone(),
            self.cancel.clone(),
        )?);
        let fetcher = OktaFetcher::new(client);

        // Groups first: everything downstream hangs edges off them. Each
        // phase sink is scoped so its writer handle is released before the
        // post-sync validation read.
        self.ensure_not_canceled()?;
        {
            let sink = self.phase_sink(
                sync_id,
                tenant,
                &writer,
                GraphWriter::sync_groups,
                |count| SyncRecordPatch {
                    groups_count: Some(count),
                    progress_percentage: Some(PROGRESS_GROUPS),
                    ..Default::default()
                },
            );
            fetcher.stream_groups(None, &sink).await?;
        }

        self.ensure_not_canceled()?;
        {
            let sink = self.phase_sink(
                sync_id,
                tenant,
                &writer,
                GraphWriter::sync_applications,
                |count| SyncRecordPatch {
                    apps_count: Some(count),
                    progress_percentage: Some(PROGRESS_APPS),
                    ..Default::default()
                },
            );
            fetcher.stream_applications(None, &sink).await?;
        }

        self.ensure_not_canceled()?;
        {
            let sink = self.phase_sink(
                sync_id,
                tenant,
                &writer,
                GraphWriter::sync_users,
                |count| SyncRecordPatch {
                    users_count: Some(count),
                    progress_percentage: Some(user_progress(count)),
                    ..Default::default()
                },
            );
            fetcher.stream_users(None, &sink).await?;
        }

        if self.sync_config.sync_devices {
            self.ensure_not_canceled()?;
            let sink = self.phase_sink(
                sync_id,
                tenant,
                &writer,
                GraphWriter::sync_devices,
                |count| SyncRecordPatch {
                    devices_count: Some(count),
                    progress_percentage: Some(PROGRESS_DEVICES),
                    ..Default::default()
                },
            );
            fetcher.stream_devices(None, &sink).await?;
        }

        self.ensure_not_canceled()?;
        {
            let sink = self.phase_sink(
                sync_id,
                tenant,
                &writer,
                GraphWriter::sync_policies,
                |count| SyncRecordPatch {
                    policies_count: Some(count),
                    progress_percentage: Some(PROGRESS_POLICIES),
                    ..Default::default()
                },
            );
            fetcher.stream_policies(None, &sink).await?;
        }

        // Derived edges need both endpoint phases complete.
        writer.link_governed_by(tenant)?;
        writer.link_reports_to(tenant)?;

        let counts = writer.entity_counts(tenant)?;
        let write_errors = writer.write_errors();
        info!(?counts, write_errors, "Entity sync complete");

        // Release the snapshot file lock before any validation read.
        drop(writer);

        self.ensure_not_canceled()?;
        let mut promoted = false;
        if self.sync_config.auto_promote {
            if write_errors > 0 && !self.sync_config.promote_on_errors {
                warn!(
                    write_errors,
                    "Skipping promotion: snapshot has write errors and promote_on_errors is off"
                );
            } else {
                self.versions.promote_staging(true)?;
                promoted = true;
                info!(version = self.versions.current_version(), "Staging snapshot promoted");
            }
        }

        Ok(SyncOutcome {
            sync_id,
            counts,
            version: self.versions.current_version(),
            promoted,
            write_errors,
        })
    }

    fn phase_sink<T: Send + Sync + 'static>(
        &self,
        sync_id: i64,
        tenant: &str,
        writer: &Arc<GraphWriter>,
        write: fn(&GraphWriter, &[T], &str) -> usize,
        patch: fn(i64) -> SyncRecordPatch,
    ) -> PhaseSink<T> {
        PhaseSink {
            writer: writer.clone(),
            metadata: self.metadata.clone(),
            sync_id,
            tenant: tenant.to_string(),
            counted: AtomicI64::new(0),
            write,
            patch,
        }
    }

    fn ensure_not_canceled(&self) -> SyncEngineResult<()> {
        if self.cancel.is_canceled() {
            Err(SyncEngineError::Canceled)
        } else {
            Ok(())
        }
    }
}

fn user_progress(count: i64) -> i64 {
    let scaled = count * PROGRESS_USERS_SPAN / 500;
    PROGRESS_USERS_BASE + scaled.min(PROGRESS_USERS_SPAN)
}

/// Streaming callback for one entity phase: writes the batch immediately and
/// patches the sync_history row so a polling reader never sees a count ahead
/// of what is actually on disk.
struct PhaseSink<T: Send + 'static> {
    writer: Arc<GraphWriter>,
    metadata: MetadataStore,
    sync_id: i64,
    tenant: String,
    counted: AtomicI64,
    write: fn(&GraphWriter, &[T], &str) -> usize,
    patch: fn(i64) -> SyncRecordPatch,
}

#[async_trait]
impl<T: Send + Sync + 'static> BatchProcessor<T> for PhaseSink<T> {
    async fn process(&self, batch: Vec<T>) -> OktaClientResult<()> {
        let synced = (self.write)(&self.writer, &batch, &self.tenant) as i64;
        let total = self.counted.fetch_add(synced, Ordering::SeqCst) + synced;

        // Progress rows are best-effort; the graph write already happened.
        if let Err(err) = self
            .metadata
            .update_sync_record(self.sync_id, &(self.patch)(total))
            .await
        {
            warn!(sync_id = self.sync_id, error = %err, "Failed to patch sync progress");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_progress_stays_in_phase_span() {
        assert_eq!(user_progress(0), 35);
        assert_eq!(user_progress(250), 55);
        assert_eq!(user_progress(500), 75);
        // Large tenants cap at the top of the user span.
        assert_eq!(user_progress(50_000), 75);
    }
}
