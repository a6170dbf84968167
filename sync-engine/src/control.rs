//! Sync-control surface.
//!
//! At most one sync runs per tenant: a second start while one is active
//! returns the running sync id with an `already_running` outcome instead of
//! spawning another. Cancellation sets the cooperative flag; the running
//! orchestrator unwinds at its next check.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use graph_store::VersionManager;
use okta_client::progress::{ProgressSink, TracingSink};
use okta_client::{CancelFlag, OktaConfig};

use crate::config::SyncConfig;
use crate::error::SyncEngineResult;
use crate::metadata::{MetadataStore, SyncHistoryRow};
use crate::orchestrator::SyncOrchestrator;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { sync_id: i64 },
    AlreadyRunning { sync_id: i64 },
}

struct ActiveSync {
    sync_id: i64,
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

pub struct SyncService {
    okta_config: Arc<OktaConfig>,
    sync_config: Arc<SyncConfig>,
    versions: Arc<VersionManager>,
    metadata: MetadataStore,
    sink: Arc<dyn ProgressSink>,
    active: Arc<DashMap<String, ActiveSync>>,
}

impl SyncService {
    pub async fn new(okta_config: OktaConfig, sync_config: SyncConfig) -> SyncEngineResult<Self> {
        let metadata = MetadataStore::open(&sync_config.metadata_db_path).await?;
        let versions = Arc::new(VersionManager::new(
            &sync_config.graph_dir,
            sync_config.keep_versions,
        )?);
        Ok(Self {
            okta_config: Arc::new(okta_config),
            sync_config: Arc::new(sync_config),
            versions,
            metadata,
            sink: Arc::new(TracingSink),
            active: Arc::new(DashMap::new()),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    pub fn tenant_id(&self) -> String {
        self.okta_config.tenant_id()
    }

    /// Start a sync for the configured tenant, unless one is already running.
    pub async fn start_sync(&self) -> SyncEngineResult<StartOutcome> {
        let tenant = self.tenant_id();
        if let Some(active) = self.active.get(&tenant) {
            if !active.handle.is_finished() {
                info!(tenant = %tenant, sync_id = active.sync_id, "Sync already running");
                return Ok(StartOutcome::AlreadyRunning {
                    sync_id: active.sync_id,
                });
            }
        }
        self.active.remove(&tenant);

        let sync_id = self.metadata.create_sync_record(&tenant, "graph").await?;
        let cancel = CancelFlag::new();
        let orchestrator = SyncOrchestrator::new(
            self.okta_config.clone(),
            self.sync_config.clone(),
            self.versions.clone(),
            self.metadata.clone(),
            cancel.clone(),
            self.sink.clone(),
        );

        let registry = self.active.clone();
        let tenant_key = tenant.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = orchestrator.run(Some(sync_id)).await {
                error!(sync_id, error = %err, "Sync task ended with error");
            }
            registry.remove(&tenant_key);
        });

        self.active.insert(
            tenant,
            ActiveSync {
                sync_id,
                cancel,
                handle,
            },
        );
        Ok(StartOutcome::Started { sync_id })
    }

    /// Request cancellation of the running sync. Returns false when nothing
    /// is running. Cancellation is cooperative and may take a moment to land.
    pub fn cancel_sync(&self) -> bool {
        let tenant = self.tenant_id();
        match self.active.get(&tenant) {
            Some(active) if !active.handle.is_finished() => {
                info!(tenant = %tenant, sync_id = active.sync_id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// The active sync row if one is running, otherwise the last terminal row.
    pub async fn status(&self) -> SyncEngineResult<Option<SyncHistoryRow>> {
        let tenant = self.tenant_id();
        if let Some(active) = self.metadata.get_active_sync(&tenant).await? {
            return Ok(Some(active));
        }
        self.metadata.get_last_completed_sync(&tenant).await
    }

    /// Block until the currently running sync task (if any) finishes.
    pub async fn wait_for_completion(&self) {
        let tenant = self.tenant_id();
        let handle = self.active.remove(&tenant).map(|(_, active)| active.handle);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
