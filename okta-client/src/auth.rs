//! Authentication against the Okta API.
//!
//! Two methods, selected by configuration: a static SSWS API token, or the
//! OAuth2 client-credentials grant with a private-key-JWT client assertion
//! (RFC 7523) against the org authorization server. OAuth2 access tokens are
//! cached and re-minted 60 seconds before their stated expiry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{AuthMethod, OktaConfig};
use crate::error::{OktaClientError, OktaClientResult};

/// Client assertions are short-lived by design: five minutes.
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Refresh the cached bearer this long before its stated expiry.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    nbf: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
}

/// Produces the `Authorization` header value for every outbound call.
pub struct TokenManager {
    http: reqwest::Client,
    auth: AuthMethod,
    token_endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(config: &OktaConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            auth: config.auth.clone(),
            token_endpoint: format!("{}/oauth2/v1/token", config.base_url()),
            cached: Mutex::new(None),
        }
    }

    pub async fn auth_header(&self) -> OktaClientResult<String> {
        match &self.auth {
            AuthMethod::ApiToken { token } => Ok(format!("SSWS {token}")),
            AuthMethod::OAuth2 {
                client_id,
                private_key_pem,
                scopes,
            } => {
                if let Some(token) = self.valid_cached_token() {
                    return Ok(format!("Bearer {token}"));
                }
                let token = self
                    .exchange_assertion(client_id, private_key_pem, scopes)
                    .await?;
                Ok(format!("Bearer {token}"))
            }
        }
    }

    /// Drop the cached bearer. Called on 401 so the failure surfaces to the
    /// caller instead of retrying with a token Okta already rejected.
    pub fn clear(&self) {
        *self.cached.lock() = None;
    }

    fn valid_cached_token(&self) -> Option<String> {
        let guard = self.cached.lock();
        let cached = guard.as_ref()?;
        let margin = ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        (Utc::now() + margin < cached.expires_at).then(|| cached.bearer.clone())
    }

    async fn exchange_assertion(
        &self,
        client_id: &str,
        private_key_pem: &str,
        scopes: &str,
    ) -> OktaClientResult<String> {
        let assertion = self.mint_assertion(client_id, private_key_pem)?;
        debug!(endpoint = %self.token_endpoint, "Exchanging client assertion for access token");

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", scopes),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "OAuth2 token exchange failed");
            return Err(OktaClientError::OAuth(format!(
                "token exchange failed with HTTP {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| OktaClientError::OAuth(format!("malformed token response: {e}")))?;

        let expires_at = Utc::now() + ChronoDuration::seconds(token.expires_in);
        *self.cached.lock() = Some(CachedToken {
            bearer: token.access_token.clone(),
            expires_at,
        });
        info!(expires_in = token.expires_in, "OAuth2 access token minted");

        Ok(token.access_token)
    }

    #[cfg(test)]
    fn inject_token(&self, bearer: &str, expires_at: DateTime<Utc>) {
        *self.cached.lock() = Some(CachedToken {
            bearer: bearer.to_string(),
            expires_at,
        });
    }

    fn mint_assertion(&self, client_id: &str, private_key_pem: &str) -> OktaClientResult<String> {
        let now = Utc::now().timestamp();
        // Backdate iat/nbf by a small random skew so assertions stay valid
        // against org clocks up to 30s behind ours.
        let skew = rand::thread_rng().gen_range(0..=30);

        let claims = AssertionClaims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: self.token_endpoint.clone(),
            iat: now - skew,
            nbf: now - skew,
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: Uuid::new_v4().to_string(),
        };

        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| OktaClientError::OAuth(format!("invalid private key: {e}")))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| OktaClientError::OAuth(format!("failed to sign assertion: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_token_header_is_static() {
        let config = OktaConfig {
            org_url: "https://acme.okta.com".into(),
            auth: AuthMethod::ApiToken {
                token: "00abcdef".into(),
            },
            concurrent_limit: 18,
            request_timeout_secs: 30,
            max_pages: 100,
            custom_attributes: vec![],
            sync_deprovisioned_users: false,
            depr_user_created_after: None,
            depr_user_updated_after: None,
        };
        let manager = TokenManager::new(&config, reqwest::Client::new());
        let header = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(manager.auth_header())
            .unwrap();
        assert_eq!(header, "SSWS 00abcdef");
    }

    fn oauth_config(pem: &str) -> OktaConfig {
        OktaConfig {
            org_url: "https://acme.okta.com/".into(),
            auth: AuthMethod::OAuth2 {
                client_id: "0oa-client".into(),
                private_key_pem: pem.into(),
                scopes: "okta.users.read okta.groups.read".into(),
            },
            concurrent_limit: 18,
            request_timeout_secs: 30,
            max_pages: 100,
            custom_attributes: vec![],
            sync_deprovisioned_users: false,
            depr_user_created_after: None,
            depr_user_updated_after: None,
        }
    }

    #[test]
    fn test_token_endpoint_derivation() {
        let manager = TokenManager::new(&oauth_config("x"), reqwest::Client::new());
        assert_eq!(
            manager.token_endpoint,
            "https://acme.okta.com/oauth2/v1/token"
        );
    }

    #[tokio::test]
    async fn test_cached_bearer_is_reused_until_refresh_margin() {
        let manager = TokenManager::new(&oauth_config("not-a-key"), reqwest::Client::new());

        // Comfortably inside the TTL: no exchange happens, cached wins.
        manager.inject_token("tok-1", Utc::now() + ChronoDuration::seconds(600));
        let header = manager.auth_header().await.unwrap();
        assert_eq!(header, "Bearer tok-1");

        // Inside the 60s refresh margin: a re-mint is attempted, which fails
        // here because the key is garbage. Proves the cache was not used.
        manager.inject_token("tok-1", Utc::now() + ChronoDuration::seconds(30));
        let err = manager.auth_header().await.unwrap_err();
        assert!(matches!(err, OktaClientError::OAuth(_)));
    }

    #[tokio::test]
    async fn test_clear_drops_cached_token() {
        let manager = TokenManager::new(&oauth_config("not-a-key"), reqwest::Client::new());
        manager.inject_token("tok-1", Utc::now() + ChronoDuration::seconds(600));
        manager.clear();
        // With no cached token the manager must mint, which fails on the
        // garbage key instead of silently reusing the cleared bearer.
        assert!(manager.auth_header().await.is_err());
    }
}
