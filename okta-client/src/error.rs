use thiserror::Error;

pub type OktaClientResult<T> = Result<T, OktaClientError>;

#[derive(Debug, Error)]
pub enum OktaClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access forbidden: {0}")]
    Forbidden(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("rate limit budget exhausted after {retries} retries")]
    RateLimitExhausted { retries: u32 },

    #[error("Okta service unavailable (HTTP {status})")]
    Server { status: u16 },

    #[error("Okta API error {code}: {summary}")]
    Api {
        code: String,
        summary: String,
        status: u16,
    },

    #[error("OAuth2 error: {0}")]
    OAuth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation canceled")]
    Canceled,
}

impl OktaClientError {
    /// Okta-style error code for logging and sync_history attribution.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Http(_) => "NETWORK_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Authentication(_) => "E0000011",
            Self::Forbidden(_) => "E0000006",
            Self::NotFound(_) => "E0000007",
            Self::RateLimitExhausted { .. } => "E0000047",
            Self::Server { .. } => "E0000009",
            Self::Api { code, .. } => code,
            Self::OAuth(_) => "E0000011",
            Self::Config(_) | Self::Serialization(_) => "UNKNOWN_ERROR",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Timeout { .. } | Self::Server { .. }
        )
    }

    /// 404s during per-user fan-out are expected for deprovisioned users
    /// and must not be treated as failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = OktaClientError::RateLimitExhausted { retries: 5 };
        assert_eq!(err.error_code(), "E0000047");
        assert!(!err.is_retryable());

        let err = OktaClientError::Server { status: 503 };
        assert_eq!(err.error_code(), "E0000009");
        assert!(err.is_retryable());

        let err = OktaClientError::Authentication("bad token".into());
        assert_eq!(err.error_code(), "E0000011");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(OktaClientError::NotFound("/api/v1/users/x".into()).is_not_found());
        assert!(!OktaClientError::Canceled.is_not_found());
    }
}
