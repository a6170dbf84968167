//! Per-entity-kind fetchers with streaming batch delivery.
//!
//! Each `stream_*` method paginates one Okta collection, transforms each page
//! into typed records, resolves relationship fan-out where the entity needs
//! it (apps → group assignments, users → appLinks/groups/factors) and hands
//! every batch to the caller's [`BatchProcessor`]. Memory stays bounded by
//! page size, never by dataset size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OktaConfig;
use crate::error::{OktaClientError, OktaClientResult};
use crate::http::{ApiRequest, OktaHttpClient};
use crate::models::{
    AppGroupAssignment, AppLinkRecord, ApplicationRecord, DeviceRecord, FactorRecord, GroupRecord,
    PolicyRecord, UserRecord,
};

pub const USER_PAGE_SIZE: usize = 200;
pub const GROUP_PAGE_SIZE: usize = 1000;
pub const APP_PAGE_SIZE: usize = 100;
pub const POLICY_PAGE_SIZE: usize = 200;
pub const DEVICE_PAGE_SIZE: usize = 200;

/// Policy collections fetched per sync, one query per type.
pub const POLICY_TYPES: [&str; 4] = ["OKTA_SIGN_ON", "PASSWORD", "MFA_ENROLL", "ACCESS_POLICY"];

/// Consumes one transformed batch per fetched page. The orchestrator's
/// implementations write straight to the graph so nothing accumulates.
#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync {
    async fn process(&self, batch: Vec<T>) -> OktaClientResult<()>;
}

/// Accumulate-mode adapter for callers that want the full list.
#[derive(Debug, Default)]
pub struct CollectingProcessor<T> {
    items: Mutex<Vec<T>>,
}

impl<T> CollectingProcessor<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items.into_inner()
    }
}

#[async_trait]
impl<T: Send + 'static> BatchProcessor<T> for CollectingProcessor<T> {
    async fn process(&self, batch: Vec<T>) -> OktaClientResult<()> {
        self.items.lock().extend(batch);
        Ok(())
    }
}

pub struct OktaFetcher {
    client: Arc<OktaHttpClient>,
}

impl OktaFetcher {
    pub fn new(client: Arc<OktaHttpClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &OktaHttpClient {
        &self.client
    }

    fn config(&self) -> &OktaConfig {
        self.client.config()
    }

    /// Groups first: they are edge targets for everything that follows.
    pub async fn stream_groups(
        &self,
        since: Option<DateTime<Utc>>,
        processor: &dyn BatchProcessor<GroupRecord>,
    ) -> OktaClientResult<usize> {
        let mut query = vec![("limit".to_string(), GROUP_PAGE_SIZE.to_string())];
        if let Some(since) = &since {
            query.push(("filter".to_string(), last_updated_filter(since)));
        }
        info!(page_size = GROUP_PAGE_SIZE, "Starting group sync");

        let mut pager = self.client.paginate("/api/v1/groups", query);
        let mut total = 0usize;
        while let Some(page) = pager.next_page().await? {
            let batch: Vec<GroupRecord> = page.iter().filter_map(GroupRecord::from_api).collect();
            if batch.len() < page.len() {
                warn!(
                    skipped = page.len() - batch.len(),
                    "Skipped groups with missing ids"
                );
            }
            total += batch.len();
            if !batch.is_empty() {
                processor.process(batch).await?;
            }
        }
        info!(count = total, "Group sync fetched");
        Ok(total)
    }

    /// Applications with their group assignments attached. The per-app
    /// `/apps/{id}/groups` fan-out runs `max_concurrent_apps` wide.
    pub async fn stream_applications(
        &self,
        since: Option<DateTime<Utc>>,
        processor: &dyn BatchProcessor<ApplicationRecord>,
    ) -> OktaClientResult<usize> {
        let mut query = vec![("limit".to_string(), APP_PAGE_SIZE.to_string())];
        if let Some(since) = &since {
            query.push(("filter".to_string(), last_updated_filter(since)));
        }
        info!(page_size = APP_PAGE_SIZE, "Starting application sync");

        let mut pager = self.client.paginate("/api/v1/apps", query);
        let mut total = 0usize;
        while let Some(page) = pager.next_page().await? {
            let apps: Vec<ApplicationRecord> =
                page.iter().filter_map(ApplicationRecord::from_api).collect();

            let mut enriched = Vec::with_capacity(apps.len());
            let mut fan_out = futures_util::stream::iter(apps.into_iter().map(|app| async move {
                let assignments = self.app_groups(&app.okta_id).await;
                (assignments, app)
            }))
            .buffer_unordered(self.config().max_concurrent_apps());

            while let Some((assignments, mut app)) = fan_out.next().await {
                match assignments {
                    Ok(assignments) => {
                        app.group_assignments = assignments;
                        enriched.push(app);
                    }
                    Err(err @ (OktaClientError::Canceled | OktaClientError::Authentication(_))) => {
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(app_id = %app.okta_id, error = %err, "Failed to fetch app group assignments");
                        self.client.progress().increment_entity_errors("applications", 1);
                    }
                }
            }
            drop(fan_out);

            total += enriched.len();
            if !enriched.is_empty() {
                processor.process(enriched).await?;
            }
        }
        info!(count = total, "Application sync fetched");
        Ok(total)
    }

    /// Users with relationship fan-out. Pages are processed in chunks of
    /// `max_concurrent_users`, which also bounds cancellation latency to a
    /// handful of users.
    pub async fn stream_users(
        &self,
        since: Option<DateTime<Utc>>,
        processor: &dyn BatchProcessor<UserRecord>,
    ) -> OktaClientResult<usize> {
        let query = self.user_query(since.as_ref());
        info!(page_size = USER_PAGE_SIZE, "Starting user sync");

        let mut pager = self.client.paginate("/api/v1/users", query);
        let mut total = 0usize;
        while let Some(page) = pager.next_page().await? {
            for chunk in page.chunks(self.config().max_concurrent_users()) {
                if self.client.cancel_flag().is_canceled() {
                    return Err(OktaClientError::Canceled);
                }

                let results =
                    futures_util::future::join_all(chunk.iter().map(|raw| self.process_user(raw)))
                        .await;

                let mut batch = Vec::with_capacity(chunk.len());
                for result in results {
                    match result {
                        Ok(Some(user)) => batch.push(user),
                        Ok(None) => {
                            warn!("Skipped user with missing id");
                            self.client.progress().increment_entity_errors("users", 1);
                        }
                        Err(err @ (OktaClientError::Canceled
                        | OktaClientError::Authentication(_))) => return Err(err),
                        Err(err) => {
                            warn!(error = %err, "Failed to process user");
                            self.client.progress().increment_entity_errors("users", 1);
                        }
                    }
                }

                total += batch.len();
                if !batch.is_empty() {
                    processor.process(batch).await?;
                }
            }
        }
        info!(count = total, "User sync fetched");
        Ok(total)
    }

    /// One query per policy type; a failing type logs and moves on so a
    /// single misbehaving collection does not sink the whole phase.
    pub async fn stream_policies(
        &self,
        since: Option<DateTime<Utc>>,
        processor: &dyn BatchProcessor<PolicyRecord>,
    ) -> OktaClientResult<usize> {
        let mut total = 0usize;
        for policy_type in POLICY_TYPES {
            if self.client.cancel_flag().is_canceled() {
                return Err(OktaClientError::Canceled);
            }
            info!(policy_type, "Fetching policies");

            let mut query = vec![
                ("type".to_string(), policy_type.to_string()),
                ("limit".to_string(), POLICY_PAGE_SIZE.to_string()),
            ];
            if let Some(since) = &since {
                query.push(("filter".to_string(), last_updated_filter(since)));
            }

            let mut pager = self.client.paginate("/api/v1/policies", query);
            loop {
                match pager.next_page().await {
                    Ok(Some(page)) => {
                        let batch: Vec<PolicyRecord> = page
                            .iter()
                            .filter_map(|raw| PolicyRecord::from_api(raw, policy_type))
                            .collect();
                        if batch.len() < page.len() {
                            warn!(
                                policy_type,
                                skipped = page.len() - batch.len(),
                                "Skipped policies with missing data"
                            );
                        }
                        total += batch.len();
                        if !batch.is_empty() {
                            processor.process(batch).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(err @ (OktaClientError::Canceled
                    | OktaClientError::Authentication(_))) => return Err(err),
                    Err(err) => {
                        warn!(policy_type, error = %err, "Error fetching policies, continuing with next type");
                        break;
                    }
                }
            }
        }
        info!(count = total, "Policy sync fetched");
        Ok(total)
    }

    /// Devices with `_embedded.users` expanded into owner relationships.
    pub async fn stream_devices(
        &self,
        since: Option<DateTime<Utc>>,
        processor: &dyn BatchProcessor<DeviceRecord>,
    ) -> OktaClientResult<usize> {
        let mut query = vec![
            ("limit".to_string(), DEVICE_PAGE_SIZE.to_string()),
            ("expand".to_string(), "userSummary".to_string()),
        ];
        if let Some(since) = &since {
            query.push(("search".to_string(), last_updated_filter(since)));
        }
        info!(page_size = DEVICE_PAGE_SIZE, "Starting device sync");

        let mut pager = self.client.paginate("/api/v1/devices", query);
        let mut total = 0usize;
        while let Some(page) = pager.next_page().await? {
            let batch: Vec<DeviceRecord> = page.iter().filter_map(DeviceRecord::from_api).collect();
            if batch.len() < page.len() {
                warn!(
                    skipped = page.len() - batch.len(),
                    "Skipped devices with missing ids"
                );
            }
            total += batch.len();
            if !batch.is_empty() {
                processor.process(batch).await?;
            }
        }
        info!(count = total, "Device sync fetched");
        Ok(total)
    }

    async fn process_user(&self, raw: &Value) -> OktaClientResult<Option<UserRecord>> {
        let Some(mut user) = UserRecord::from_api(raw, &self.config().custom_attributes) else {
            return Ok(None);
        };

        // Deprovisioned users keep only their node; Okta 404s most of their
        // relationship endpoints anyway.
        if user.is_deprovisioned() {
            debug!(user_id = %user.okta_id, "Deprovisioned user, skipping relationship fan-out");
            return Ok(Some(user));
        }

        let (app_links, groups, factors) = tokio::join!(
            self.user_app_links(&user.okta_id),
            self.user_groups(&user.okta_id),
            self.user_factors(&user.okta_id),
        );
        user.app_links = app_links?;
        user.group_memberships = groups?;
        user.factors = factors?;

        debug!(
            user_id = %user.okta_id,
            app_links = user.app_links.len(),
            groups = user.group_memberships.len(),
            factors = user.factors.len(),
            custom_attributes = user.custom_attributes.len(),
            "User processed"
        );
        Ok(Some(user))
    }

    async fn user_app_links(&self, user_id: &str) -> OktaClientResult<Vec<AppLinkRecord>> {
        let req = ApiRequest::get(format!("/api/v1/users/{user_id}/appLinks"))
            .with_entity_label("user_app_links");
        match self.client.request(req).await {
            Ok(response) => Ok(response
                .data
                .iter()
                .filter_map(AppLinkRecord::from_api)
                .collect()),
            Err(err) => self.tolerate_fan_out_error(user_id, "app links", err),
        }
    }

    async fn user_groups(&self, user_id: &str) -> OktaClientResult<Vec<String>> {
        let req = ApiRequest::get(format!("/api/v1/users/{user_id}/groups"))
            .with_entity_label("user_groups");
        match self.client.request(req).await {
            Ok(response) => Ok(response
                .data
                .iter()
                .filter_map(|g| g.get("id").and_then(Value::as_str).map(str::to_string))
                .collect()),
            Err(err) => self.tolerate_fan_out_error(user_id, "groups", err),
        }
    }

    async fn user_factors(&self, user_id: &str) -> OktaClientResult<Vec<FactorRecord>> {
        let req = ApiRequest::get(format!("/api/v1/users/{user_id}/factors"))
            .with_entity_label("user_factors");
        match self.client.request(req).await {
            Ok(response) => Ok(response
                .data
                .iter()
                .filter_map(FactorRecord::from_api)
                .collect()),
            Err(err) => self.tolerate_fan_out_error(user_id, "factors", err),
        }
    }

    async fn app_groups(&self, app_id: &str) -> OktaClientResult<Vec<AppGroupAssignment>> {
        let req = ApiRequest::get(format!("/api/v1/apps/{app_id}/groups"))
            .with_query("limit", "100")
            .with_entity_label("app_groups");
        let response = self.client.request(req).await?;
        Ok(response
            .data
            .iter()
            .filter_map(AppGroupAssignment::from_api)
            .collect())
    }

    /// Fan-out error policy: 404 means the user was deprovisioned or deleted
    /// mid-sync and is written without the relationship; auth failures and
    /// cancellation unwind; everything else degrades to an empty list.
    fn tolerate_fan_out_error<T>(
        &self,
        user_id: &str,
        what: &str,
        err: OktaClientError,
    ) -> OktaClientResult<Vec<T>> {
        match err {
            err if err.is_not_found() => {
                debug!(user_id, what, "User not found during fan-out (likely deprovisioned)");
                Ok(Vec::new())
            }
            err @ (OktaClientError::Canceled | OktaClientError::Authentication(_)) => Err(err),
            err => {
                warn!(user_id, what, error = %err, "Fan-out call failed, continuing without relationship");
                Ok(Vec::new())
            }
        }
    }

    fn user_query(&self, since: Option<&DateTime<Utc>>) -> Vec<(String, String)> {
        let mut query = vec![("limit".to_string(), USER_PAGE_SIZE.to_string())];
        if self.config().sync_deprovisioned_users {
            query.push((
                "search".to_string(),
                user_search_expression(self.config(), since),
            ));
        } else if let Some(since) = since {
            query.push(("filter".to_string(), last_updated_filter(since)));
        }
        query
    }
}

/// Okta timestamp literal for `filter`/`search` expressions.
pub fn format_okta_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn last_updated_filter(since: &DateTime<Utc>) -> String {
    format!("lastUpdated gt \"{}\"", format_okta_timestamp(since))
}

/// Combined search expression: the ACTIVE-family statuses (optionally
/// incremental) OR deprovisioned users (optionally bounded by the configured
/// created/updated cutoffs).
pub fn user_search_expression(config: &OktaConfig, since: Option<&DateTime<Utc>>) -> String {
    const DEFAULT_STATUSES: [&str; 7] = [
        "STAGED",
        "PROVISIONED",
        "ACTIVE",
        "RECOVERY",
        "PASSWORD_EXPIRED",
        "LOCKED_OUT",
        "SUSPENDED",
    ];

    let status_filter = DEFAULT_STATUSES
        .iter()
        .map(|s| format!("status eq \"{s}\""))
        .collect::<Vec<_>>()
        .join(" or ");

    let default_filter = match since {
        Some(since) => format!("({status_filter}) and {}", last_updated_filter(since)),
        None => status_filter,
    };

    let mut depr_conditions = vec!["status eq \"DEPROVISIONED\"".to_string()];
    if let Some(created_after) = config.depr_user_created_after_iso() {
        depr_conditions.push(format!("created gt \"{created_after}\""));
    }
    if let Some(updated_after) = config.depr_user_updated_after_iso() {
        depr_conditions.push(format!("lastUpdated gt \"{updated_after}\""));
    }
    if let Some(since) = since {
        depr_conditions.push(last_updated_filter(since));
    }
    let depr_filter = depr_conditions.join(" and ");

    format!("({default_filter}) or ({depr_filter})")
}
