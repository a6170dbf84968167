pub mod auth;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod models;
pub mod progress;

pub use cancel::CancelFlag;
pub use config::{AuthMethod, OktaConfig};
pub use error::{OktaClientError, OktaClientResult};
pub use fetch::{BatchProcessor, CollectingProcessor, OktaFetcher};
pub use http::{ApiRequest, ApiResponse, HttpMethod, OktaHttpClient};
pub use progress::{ChannelSink, ProgressEvent, ProgressKind, ProgressSink, ProgressTracker, TracingSink};
