pub mod error;
pub mod reader;
pub mod schema;
pub mod version;
pub mod writer;

pub use error::{GraphStoreError, GraphStoreResult};
pub use reader::GraphReader;
pub use version::{DEFAULT_KEEP_VERSIONS, VersionInfo, VersionManager};
pub use writer::{EntityCounts, GraphWriter, SNAPSHOT_DB_FILE};
