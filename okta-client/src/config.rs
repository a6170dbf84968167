use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{OktaClientError, OktaClientResult};

/// Default concurrent-call budget. Okta's published in-flight limits are
/// 35 for Free/One App orgs and 75 for Workforce/Customer Identity; 18
/// sits safely inside the free-tier budget at the default rate-limit slider.
pub const DEFAULT_CONCURRENT_LIMIT: usize = 18;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_PAGES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    ApiToken {
        token: String,
    },
    OAuth2 {
        client_id: String,
        private_key_pem: String,
        scopes: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OktaConfig {
    /// Org URL as configured, e.g. `https://acme.okta.com`. Scheme is kept
    /// so tests can point the client at a plain-HTTP mock server.
    pub org_url: String,
    pub auth: AuthMethod,
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Tenant-configured Okta profile fields promoted to first-class
    /// columns on the User node.
    #[serde(default)]
    pub custom_attributes: Vec<String>,
    #[serde(default)]
    pub sync_deprovisioned_users: bool,
    #[serde(default)]
    pub depr_user_created_after: Option<NaiveDate>,
    #[serde(default)]
    pub depr_user_updated_after: Option<NaiveDate>,
}

fn default_concurrent_limit() -> usize {
    DEFAULT_CONCURRENT_LIMIT
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_PAGES
}

impl OktaConfig {
    /// Build configuration from the process environment.
    ///
    /// Required: `OKTA_ORG_URL`, plus `OKTA_API_TOKEN` (when
    /// `TOKEN_METHOD=API_TOKEN`, the default) or the
    /// `OKTA_OAUTH2_CLIENT_ID` / `OKTA_OAUTH2_PRIVATE_KEY_PEM` /
    /// `OKTA_OAUTH2_SCOPES` triple (when `TOKEN_METHOD=OAUTH2`).
    pub fn from_env() -> OktaClientResult<Self> {
        let org_url = std::env::var("OKTA_ORG_URL")
            .map_err(|_| OktaClientError::Config("OKTA_ORG_URL is not set".into()))?;

        let token_method = std::env::var("TOKEN_METHOD")
            .unwrap_or_else(|_| "API_TOKEN".into())
            .to_uppercase();

        let auth = match token_method.as_str() {
            "OAUTH2" => {
                let client_id = required_env("OKTA_OAUTH2_CLIENT_ID")?;
                let private_key_pem = required_env("OKTA_OAUTH2_PRIVATE_KEY_PEM")?;
                if !private_key_pem.contains("BEGIN") || !private_key_pem.contains("PRIVATE KEY") {
                    return Err(OktaClientError::Config(
                        "OKTA_OAUTH2_PRIVATE_KEY_PEM must be a PEM-encoded private key".into(),
                    ));
                }
                let scopes = required_env("OKTA_OAUTH2_SCOPES")?
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string();
                AuthMethod::OAuth2 {
                    client_id,
                    private_key_pem,
                    scopes,
                }
            }
            _ => AuthMethod::ApiToken {
                token: required_env("OKTA_API_TOKEN")?,
            },
        };

        let concurrent_limit = std::env::var("OKTA_CONCURRENT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONCURRENT_LIMIT);

        let custom_attributes = std::env::var("OKTA_USER_CUSTOM_ATTRIBUTES")
            .map(|v| parse_attribute_list(&v))
            .unwrap_or_default();

        let sync_deprovisioned_users = std::env::var("SYNC_DEPROVISIONED_USERS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            org_url: normalize_org_url(&org_url),
            auth,
            concurrent_limit,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_pages: DEFAULT_MAX_PAGES,
            custom_attributes,
            sync_deprovisioned_users,
            depr_user_created_after: parse_cutoff_date("DEPR_USER_CREATED_AFTER")?,
            depr_user_updated_after: parse_cutoff_date("DEPR_USER_UPDATED_AFTER")?,
        })
    }

    pub fn base_url(&self) -> String {
        normalize_org_url(&self.org_url)
    }

    /// Okta domain with no scheme, used for the OAuth2 token endpoint.
    pub fn domain(&self) -> String {
        self.base_url()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }

    /// The tenant identifier is the first DNS label of the org URL. It is an
    /// opaque partition key; no cross-tenant deduplication happens on it.
    pub fn tenant_id(&self) -> String {
        self.domain()
            .split(['.', ':'])
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Each user fans out ~2 follow-up calls (groups, factors), so half the
    /// in-flight budget keeps the org under its concurrent limit.
    pub fn max_concurrent_users(&self) -> usize {
        (self.concurrent_limit / 2).max(1)
    }

    /// The per-app group-assignment endpoint has its own 500 rpm budget;
    /// 0.4 of the in-flight limit stays under it with natural latency.
    pub fn max_concurrent_apps(&self) -> usize {
        ((self.concurrent_limit as f64 * 0.4) as usize).max(1)
    }

    /// Groups make no follow-up calls, so they can use most of the budget.
    pub fn max_concurrent_groups(&self) -> usize {
        ((self.concurrent_limit as f64 * 0.8) as usize).max(1)
    }

    pub fn depr_user_created_after_iso(&self) -> Option<String> {
        self.depr_user_created_after
            .map(|d| format!("{}T00:00:00.000Z", d.format("%Y-%m-%d")))
    }

    pub fn depr_user_updated_after_iso(&self) -> Option<String> {
        self.depr_user_updated_after
            .map(|d| format!("{}T00:00:00.000Z", d.format("%Y-%m-%d")))
    }
}

fn required_env(name: &str) -> OktaClientResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| OktaClientError::Config(format!("{name} is not set")))
}

fn parse_cutoff_date(name: &str) -> OktaClientResult<Option<NaiveDate>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                OktaClientError::Config(format!("{name} must be in YYYY-MM-DD format, got {raw}"))
            }),
        _ => Ok(None),
    }
}

fn normalize_org_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn parse_attribute_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(limit: usize) -> OktaConfig {
        OktaConfig {
            org_url: "https://acme.okta.com".into(),
            auth: AuthMethod::ApiToken {
                token: "00token".into(),
            },
            concurrent_limit: limit,
            request_timeout_secs: 30,
            max_pages: 100,
            custom_attributes: vec![],
            sync_deprovisioned_users: false,
            depr_user_created_after: None,
            depr_user_updated_after: None,
        }
    }

    #[test]
    fn test_derived_concurrency_bounds() {
        let config = test_config(18);
        assert_eq!(config.max_concurrent_users(), 9);
        assert_eq!(config.max_concurrent_apps(), 7);
        assert_eq!(config.max_concurrent_groups(), 14);

        // Never drops to zero even for a tiny budget.
        let config = test_config(1);
        assert_eq!(config.max_concurrent_users(), 1);
        assert_eq!(config.max_concurrent_apps(), 1);
        assert_eq!(config.max_concurrent_groups(), 1);
    }

    #[test]
    fn test_tenant_id_from_org_url() {
        let config = test_config(18);
        assert_eq!(config.tenant_id(), "acme");
        assert_eq!(config.domain(), "acme.okta.com");

        let mut config = test_config(18);
        config.org_url = "http://127.0.0.1:4545".into();
        assert_eq!(config.tenant_id(), "127");
    }

    #[test]
    fn test_org_url_normalization() {
        assert_eq!(
            normalize_org_url("acme.okta.com/"),
            "https://acme.okta.com"
        );
        assert_eq!(
            normalize_org_url("https://acme.okta.com"),
            "https://acme.okta.com"
        );
        assert_eq!(
            normalize_org_url("http://localhost:8080/"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_attribute_list_parsing() {
        assert_eq!(
            parse_attribute_list("SLT_DEPT, costCenter ,, division"),
            vec!["SLT_DEPT", "costCenter", "division"]
        );
        assert!(parse_attribute_list("").is_empty());
    }

    #[test]
    fn test_cutoff_date_iso() {
        let mut config = test_config(18);
        config.depr_user_created_after = NaiveDate::from_ymd_opt(2024, 1, 15);
        assert_eq!(
            config.depr_user_created_after_iso().as_deref(),
            Some("2024-01-15T00:00:00.000Z")
        );
        assert_eq!(config.depr_user_updated_after_iso(), None);
    }
}
