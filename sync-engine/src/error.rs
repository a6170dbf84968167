use thiserror::Error;

use okta_client::OktaClientError;

pub type SyncEngineResult<T> = Result<T, SyncEngineError>;

#[derive(Debug, Error)]
pub enum SyncEngineError {
    #[error("Okta client error: {0}")]
    Client(#[from] OktaClientError),

    #[error("graph store error: {0}")]
    Graph(#[from] graph_store::GraphStoreError),

    #[error("metadata database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("sync canceled")]
    Canceled,
}

impl SyncEngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::Client(OktaClientError::Canceled)
        )
    }
}
