use thiserror::Error;

pub type GraphStoreResult<T> = Result<T, GraphStoreError>;

#[derive(Debug, Error)]
pub enum GraphStoreError {
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging snapshot not found at {path}")]
    StagingMissing { path: String },

    #[error("snapshot validation failed: {0}")]
    ValidationFailed(String),

    #[error("schema error: {0}")]
    Schema(String),
}
