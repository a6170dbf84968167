//! The single point through which every Okta API call flows.
//!
//! Responsibilities: bearer/SSWS auth, server-directed retry on 429,
//! `Link`-header pagination, response-shape normalization, rate-limit header
//! monitoring and structured progress eventing. A semaphore sized to the
//! configured concurrent limit gates every outbound call, and a short
//! inter-call delay prevents burst pathologies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::auth::TokenManager;
use crate::cancel::CancelFlag;
use crate::config::OktaConfig;
use crate::error::{OktaClientError, OktaClientResult};
use crate::progress::{ProgressSink, ProgressTracker};

/// Retry budget for rate-limited calls; beyond this the caller sees E0000047.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Short pause after each call so bursts don't trip the concurrent limit.
const INTER_CALL_DELAY: Duration = Duration::from_millis(100);

/// Concurrent-regime waits are short: slots free as requests complete.
const CONCURRENT_WAIT_CAP_SECS: u64 = 30;
const CONCURRENT_DEFAULT_RETRY_AFTER_SECS: u64 = 15;
const CONCURRENT_JITTER_MAX_SECS: f64 = 3.0;

/// Org-wide waits trust Okta's clock, capped for safety.
const ORG_WIDE_WAIT_CAP_SECS: u64 = 300;
const ORG_WIDE_DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub endpoint: String,
    pub method: HttpMethod,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Stop pagination once this many items have been accumulated; the final
    /// page is truncated so the caller gets exactly this count.
    pub max_results: Option<usize>,
    /// Batch label for automatic error attribution in progress events.
    pub entity_label: Option<String>,
}

impl ApiRequest {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_entity_label(mut self, label: &str) -> Self {
        self.entity_label = Some(label.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub data: Vec<Value>,
    pub pages: usize,
    pub total_items: usize,
    pub limited_by_max_results: bool,
}

#[derive(Debug, Clone, Default)]
struct RateLimitInfo {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset: Option<String>,
}

impl RateLimitInfo {
    fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        Self {
            limit: get("x-rate-limit-limit"),
            remaining: get("x-rate-limit-remaining"),
            reset: headers
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    /// Okta signals the concurrent regime with a zeroed limit pair.
    fn is_concurrent_regime(&self) -> bool {
        self.limit == Some(0) && self.remaining == Some(0)
    }
}

struct RawPage {
    data: Value,
    link_header: String,
}

pub struct OktaHttpClient {
    http: reqwest::Client,
    config: Arc<OktaConfig>,
    tokens: TokenManager,
    semaphore: Arc<Semaphore>,
    progress: ProgressTracker,
    cancel: CancelFlag,
}

impl OktaHttpClient {
    pub fn new(
        config: Arc<OktaConfig>,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelFlag,
    ) -> OktaClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        info!(
            concurrent_limit = config.concurrent_limit,
            timeout_secs = config.request_timeout_secs,
            max_pages = config.max_pages,
            "Okta API client configured"
        );

        Ok(Self {
            tokens: TokenManager::new(&config, http.clone()),
            semaphore: Arc::new(Semaphore::new(config.concurrent_limit)),
            progress: ProgressTracker::new(sink),
            cancel,
            http,
            config,
        })
    }

    pub fn config(&self) -> &OktaConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Issue a request. GET requests paginate automatically via `Link`
    /// headers; other methods are single-shot.
    pub async fn request(&self, req: ApiRequest) -> OktaClientResult<ApiResponse> {
        let result = self.request_inner(&req).await;
        if let Err(err) = &result {
            if let Some(label) = &req.entity_label {
                if !matches!(err, OktaClientError::Canceled) {
                    self.progress.increment_entity_errors(label, 1);
                    debug!(label = %label, error = %err, "Attributed error to entity batch");
                }
            }
        }
        result
    }

    async fn request_inner(&self, req: &ApiRequest) -> OktaClientResult<ApiResponse> {
        if req.method != HttpMethod::Get {
            let raw = self
                .single_request(
                    &req.endpoint,
                    req.method,
                    Some(req.query.as_slice()),
                    req.body.as_ref(),
                )
                .await?;
            let data = normalize_response(raw.data);
            let total_items = data.len();
            return Ok(ApiResponse {
                data,
                pages: 1,
                total_items,
                limited_by_max_results: false,
            });
        }

        let query = optimize_query(&req.endpoint, req.query.clone());
        let mut pager = self.paginate(&req.endpoint, query);
        let mut data: Vec<Value> = Vec::new();

        while let Some(page) = pager.next_page().await? {
            data.extend(page);
            if let Some(max) = req.max_results {
                if data.len() >= max {
                    data.truncate(max);
                    info!(
                        endpoint = %req.endpoint,
                        max_results = max,
                        pages = pager.pages(),
                        "Max results reached, stopping pagination"
                    );
                    pager.finish("completed_max_reached");
                    return Ok(ApiResponse {
                        data,
                        pages: pager.pages(),
                        total_items: max,
                        limited_by_max_results: true,
                    });
                }
            }
        }

        let total_items = data.len();
        Ok(ApiResponse {
            data,
            pages: pager.pages().max(1),
            total_items,
            limited_by_max_results: false,
        })
    }

    /// Page-at-a-time access for the streaming fetchers.
    pub fn paginate(&self, endpoint: &str, query: Vec<(String, String)>) -> Paginator<'_> {
        Paginator {
            client: self,
            endpoint: endpoint.to_string(),
            label: format!("paginate_{}", endpoint_label(endpoint)),
            query,
            next_url: None,
            pages: 0,
            items_seen: 0,
            discovery_started: false,
            done: false,
            finished: false,
        }
    }

    async fn single_request(
        &self,
        endpoint: &str,
        method: HttpMethod,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> OktaClientResult<RawPage> {
        let url = if endpoint.starts_with("http") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.config.base_url())
        } else {
            format!("{}/{endpoint}", self.config.base_url())
        };

        let mut retries = 0u32;
        loop {
            if self.cancel.is_canceled() {
                return Err(OktaClientError::Canceled);
            }

            let auth_header = self.tokens.auth_header().await?;
            let mut builder = self
                .http
                .request(method.as_reqwest(), &url)
                .header("Authorization", auth_header)
                .header("Accept", "application/json");
            if let Some(query) = query {
                if !query.is_empty() {
                    builder = builder.query(query);
                }
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| OktaClientError::Canceled)?;

            metrics::counter!("okta_api_requests_total").increment(1);
            let response = match builder.send().await {
                Ok(response) => {
                    tokio::time::sleep(INTER_CALL_DELAY).await;
                    drop(permit);
                    response
                }
                Err(err) => {
                    drop(permit);
                    error!(url = %url, error = %err, "Okta API request failed");
                    if err.is_timeout() {
                        return Err(OktaClientError::Timeout {
                            seconds: self.config.request_timeout_secs,
                        });
                    }
                    return Err(OktaClientError::Http(err));
                }
            };

            let rate = RateLimitInfo::from_headers(response.headers());
            self.monitor_rate_limit(&url, &rate);

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries >= MAX_RATE_LIMIT_RETRIES {
                    error!(
                        url = %url,
                        retries = MAX_RATE_LIMIT_RETRIES,
                        "Rate limit retries exhausted"
                    );
                    return Err(OktaClientError::RateLimitExhausted {
                        retries: MAX_RATE_LIMIT_RETRIES,
                    });
                }
                self.wait_for_rate_limit(endpoint, &response, &rate, retries)
                    .await;
                continue;
            }

            return self.process_response(response).await;
        }
    }

    fn monitor_rate_limit(&self, url: &str, rate: &RateLimitInfo) {
        let (Some(limit), Some(remaining)) = (rate.limit, rate.remaining) else {
            return;
        };
        if limit == 0 {
            return;
        }
        debug!(
            url = %url,
            remaining,
            limit,
            reset = rate.reset.as_deref().unwrap_or(""),
            "Rate limit status"
        );
        if remaining * 10 <= limit {
            warn!(url = %url, remaining, limit, "Rate limit critical: under 10% remaining");
        } else if remaining * 4 <= limit {
            warn!(url = %url, remaining, limit, "Rate limit low: under 25% remaining");
        }
    }

    async fn wait_for_rate_limit(
        &self,
        endpoint: &str,
        response: &reqwest::Response,
        rate: &RateLimitInfo,
        attempt: u32,
    ) {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let concurrent = rate.is_concurrent_regime();
        let wait_secs = if concurrent {
            // Concurrent slots free as in-flight requests complete; jitter
            // staggers retries so they don't all land on the same slot.
            let base = retry_after
                .unwrap_or(CONCURRENT_DEFAULT_RETRY_AFTER_SECS)
                .min(CONCURRENT_WAIT_CAP_SECS) as f64;
            let jitter = rand::thread_rng().gen_range(0.0..CONCURRENT_JITTER_MAX_SECS);
            warn!(
                endpoint = %endpoint,
                base_secs = base,
                jitter_secs = format!("{jitter:.1}"),
                attempt,
                max_retries = MAX_RATE_LIMIT_RETRIES,
                "Concurrent rate limit exceeded"
            );
            base + jitter
        } else {
            let base = retry_after
                .unwrap_or(ORG_WIDE_DEFAULT_RETRY_AFTER_SECS)
                .min(ORG_WIDE_WAIT_CAP_SECS);
            warn!(
                endpoint = %endpoint,
                wait_secs = base,
                remaining = rate.remaining.unwrap_or(0),
                limit = rate.limit.unwrap_or(0),
                reset = rate.reset.as_deref().unwrap_or(""),
                attempt,
                max_retries = MAX_RATE_LIMIT_RETRIES,
                "Org-wide rate limit exceeded"
            );
            base as f64
        };

        metrics::counter!("okta_rate_limit_waits_total").increment(1);
        metrics::histogram!("okta_rate_limit_wait_seconds").record(wait_secs);
        self.progress.rate_limit_wait(
            &format!("rate_limit_{}", endpoint_label(endpoint)),
            wait_secs,
            concurrent,
        );
        tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
    }

    async fn process_response(&self, response: reqwest::Response) -> OktaClientResult<RawPage> {
        let status = response.status();
        let link_header = response
            .headers()
            .get_all("link")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");

        match status {
            StatusCode::UNAUTHORIZED => {
                // A token Okta rejected will keep failing; drop it and let the
                // caller decide, rather than looping on auth.
                self.tokens.clear();
                Err(OktaClientError::Authentication(
                    "invalid or expired credentials".into(),
                ))
            }
            StatusCode::FORBIDDEN => Err(OktaClientError::Forbidden(
                "insufficient permissions for this operation".into(),
            )),
            StatusCode::NOT_FOUND => Err(OktaClientError::NotFound(
                response.url().path().to_string(),
            )),
            status if status.is_server_error() => Err(OktaClientError::Server {
                status: status.as_u16(),
            }),
            status if status.is_client_error() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let code = body
                    .get("errorCode")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN_ERROR")
                    .to_string();
                let mut summary = body
                    .get("errorSummary")
                    .and_then(Value::as_str)
                    .unwrap_or("request rejected")
                    .to_string();
                if let Some(causes) = body.get("errorCauses").and_then(Value::as_array) {
                    let details: Vec<&str> = causes
                        .iter()
                        .filter_map(|c| c.get("errorSummary").and_then(Value::as_str))
                        .collect();
                    if !details.is_empty() {
                        summary = format!("{summary} Causes: {}", details.join(", "));
                    }
                }
                Err(OktaClientError::Api {
                    code,
                    summary,
                    status: status.as_u16(),
                })
            }
            _ => {
                let data = response.json::<Value>().await?;
                Ok(RawPage { data, link_header })
            }
        }
    }
}

/// Follows `Link; rel="next"` chains one page at a time, emitting discovery
/// progress events with a running item count.
pub struct Paginator<'a> {
    client: &'a OktaHttpClient,
    endpoint: String,
    label: String,
    query: Vec<(String, String)>,
    next_url: Option<String>,
    pages: usize,
    items_seen: usize,
    discovery_started: bool,
    done: bool,
    finished: bool,
}

impl Paginator<'_> {
    pub async fn next_page(&mut self) -> OktaClientResult<Option<Vec<Value>>> {
        if self.done {
            self.finish("completed");
            return Ok(None);
        }
        if self.client.cancel.is_canceled() {
            return Err(OktaClientError::Canceled);
        }

        let raw = if self.pages == 0 {
            self.client
                .single_request(
                    &self.endpoint,
                    HttpMethod::Get,
                    Some(self.query.as_slice()),
                    None,
                )
                .await?
        } else {
            // Pagination URLs from the Link header are absolute and already
            // carry their own query string.
            let url = self.next_url.clone().unwrap_or_default();
            self.client
                .single_request(&url, HttpMethod::Get, None, None)
                .await?
        };

        self.pages += 1;
        let items = normalize_response(raw.data);
        let next = extract_next_url(&raw.link_header);

        if items.is_empty() {
            debug!(endpoint = %self.endpoint, page = self.pages, "Empty page, stopping pagination");
            self.done = true;
            self.finish("completed");
            return Ok(None);
        }

        self.items_seen += items.len();
        if next.is_some() && !self.discovery_started {
            self.discovery_started = true;
            self.client.progress.discovery_start(&self.label, 0);
            info!(endpoint = %self.endpoint, "Paginating - collecting all pages");
        }
        if self.discovery_started {
            self.client
                .progress
                .discovery_page(&self.label, self.items_seen as u64);
        }

        self.next_url = next;
        if self.next_url.is_none() || self.pages >= self.client.config.max_pages {
            if self.pages >= self.client.config.max_pages && self.next_url.is_some() {
                warn!(
                    endpoint = %self.endpoint,
                    max_pages = self.client.config.max_pages,
                    "Page safety cap reached, stopping pagination"
                );
            }
            self.done = true;
        }

        Ok(Some(items))
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn total_items(&self) -> usize {
        self.items_seen
    }

    pub fn finish(&mut self, status: &str) {
        if self.discovery_started && !self.finished {
            self.finished = true;
            self.client
                .progress
                .discovery_complete(&self.label, self.items_seen as u64, status);
            info!(
                endpoint = %self.endpoint,
                total_items = self.items_seen,
                pages = self.pages,
                "Pagination complete"
            );
        }
        self.done = true;
    }
}

/// Inject the endpoint-specific maximum page size when the caller did not
/// supply one, to minimize page count against the rate limit.
pub fn optimize_query(endpoint: &str, mut query: Vec<(String, String)>) -> Vec<(String, String)> {
    if query.iter().any(|(k, _)| k == "limit") {
        return query;
    }
    let limit = if endpoint.contains("/logs") {
        "1000"
    } else if endpoint.contains("/users") || endpoint.contains("/groups") || endpoint.contains("/apps")
    {
        "200"
    } else {
        "100"
    };
    query.push(("limit".to_string(), limit.to_string()));
    query
}

/// Extract the `rel="next"` URL from a (possibly multi-valued) Link header.
pub fn extract_next_url(link_header: &str) -> Option<String> {
    if !link_header.contains("rel=\"next\"") {
        return None;
    }
    for part in link_header.split(',') {
        if part.contains("rel=\"next\"") {
            let url = part
                .split(';')
                .next()?
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>');
            return Some(url.to_string());
        }
    }
    None
}

/// Normalize Okta's inconsistent list wrappers to a plain item sequence.
///
/// Patterns seen across Okta endpoints: a bare array; `{value: [...]}`
/// (IAM/SCIM); `{results: [...]}` (search); `{items: [...]}` (paginated);
/// `{data: [...]}` (collections); `{_embedded: {x: [...]}}`; a single
/// resource object; a metadata-only envelope.
pub fn normalize_response(data: Value) -> Vec<Value> {
    match data {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(map) => {
            for key in ["value", "results", "items", "data"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.clone();
                }
            }
            if let Some(Value::Object(embedded)) = map.get("_embedded") {
                for value in embedded.values() {
                    if let Value::Array(items) = value {
                        return items.clone();
                    }
                }
            }
            // Dynamic wrapper: any non-metadata key holding a non-empty list.
            for (key, value) in &map {
                if let Value::Array(items) = value {
                    if !items.is_empty()
                        && !matches!(key.as_str(), "_links" | "meta" | "metadata" | "pagination")
                    {
                        return items.clone();
                    }
                }
            }
            let resource_markers = ["id", "okta_id", "userId", "groupId", "appId", "name", "login", "email"];
            if resource_markers.iter().any(|k| map.contains_key(*k)) {
                return vec![Value::Object(map)];
            }
            let metadata_keys = [
                "_links", "meta", "metadata", "totalCount", "totalResults", "count", "size",
                "limit", "after", "cursor",
            ];
            if !map.is_empty() && map.keys().all(|k| metadata_keys.contains(&k.as_str())) {
                return Vec::new();
            }
            vec![Value::Object(map)]
        }
        other => vec![other],
    }
}

fn endpoint_label(endpoint: &str) -> String {
    let without_scheme = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    // Absolute pagination URLs carry the host; strip it down to the path.
    let path = if endpoint.starts_with("http") {
        without_scheme
            .find('/')
            .map_or("", |idx| &without_scheme[idx..])
    } else {
        without_scheme
    };
    path.trim_matches('/')
        .replace("api/v1/", "")
        .split('?')
        .next()
        .unwrap_or_default()
        .replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_bare_array() {
        let data = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(normalize_response(data).len(), 2);
    }

    #[test]
    fn test_normalize_known_wrappers() {
        for key in ["value", "results", "items", "data"] {
            let data = json!({key: [{"id": "a"}], "totalCount": 1});
            let items = normalize_response(data);
            assert_eq!(items.len(), 1, "wrapper {key}");
        }
    }

    #[test]
    fn test_normalize_embedded() {
        let data = json!({"_embedded": {"users": [{"id": "u1"}, {"id": "u2"}]}});
        assert_eq!(normalize_response(data).len(), 2);
    }

    #[test]
    fn test_normalize_single_resource_promoted() {
        let data = json!({"id": "u1", "status": "ACTIVE"});
        let items = normalize_response(data);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "u1");
    }

    #[test]
    fn test_normalize_metadata_only_is_empty() {
        let data = json!({"_links": {}, "totalCount": 0});
        assert!(normalize_response(data).is_empty());
        assert!(normalize_response(Value::Null).is_empty());
    }

    #[test]
    fn test_extract_next_url() {
        let header = "<https://acme.okta.com/api/v1/users?after=abc&limit=200>; rel=\"next\"";
        assert_eq!(
            extract_next_url(header).as_deref(),
            Some("https://acme.okta.com/api/v1/users?after=abc&limit=200")
        );

        let multi = "<https://acme.okta.com/api/v1/users?limit=200>; rel=\"self\", \
                     <https://acme.okta.com/api/v1/users?after=xyz&limit=200>; rel=\"next\"";
        assert_eq!(
            extract_next_url(multi).as_deref(),
            Some("https://acme.okta.com/api/v1/users?after=xyz&limit=200")
        );

        assert!(extract_next_url("<https://x>; rel=\"self\"").is_none());
        assert!(extract_next_url("").is_none());
    }

    #[test]
    fn test_optimize_query_injects_endpoint_maximum() {
        let q = optimize_query("/api/v1/logs", vec![]);
        assert!(q.contains(&("limit".to_string(), "1000".to_string())));

        let q = optimize_query("/api/v1/users", vec![]);
        assert!(q.contains(&("limit".to_string(), "200".to_string())));

        let q = optimize_query("/api/v1/policies", vec![]);
        assert!(q.contains(&("limit".to_string(), "100".to_string())));

        // Caller-supplied limit wins.
        let q = optimize_query(
            "/api/v1/groups",
            vec![("limit".to_string(), "1000".to_string())],
        );
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].1, "1000");
    }

    #[test]
    fn test_endpoint_label() {
        assert_eq!(endpoint_label("/api/v1/users"), "users");
        assert_eq!(endpoint_label("/api/v1/apps/a1/groups"), "apps_a1_groups");
        assert_eq!(
            endpoint_label("https://acme.okta.com/api/v1/users?after=x"),
            "users"
        );
    }

    #[test]
    fn test_concurrent_regime_detection() {
        let rate = RateLimitInfo {
            limit: Some(0),
            remaining: Some(0),
            reset: None,
        };
        assert!(rate.is_concurrent_regime());

        let rate = RateLimitInfo {
            limit: Some(600),
            remaining: Some(0),
            reset: None,
        };
        assert!(!rate.is_concurrent_regime());
    }
}
