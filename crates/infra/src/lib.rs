//! Infrastructure layer: backing stores, catalog, writer and the queue handle.

pub mod catalog;
pub mod config;
pub mod error;
pub mod handle;
pub mod locks;
pub mod stats;
pub mod store;
pub mod writer;


pub use catalog::DatasetCatalog;
pub use config::{ConfigError, DatabaseConfig, HandleConfig, Mode, QueryFilters};
pub use error::{JobsDbError, JobsDbResult};
pub use handle::{Handle, MonitorHandle};
pub use stats::{InMemoryStats, NoopStats, StatsSink, TracingStats};
pub use store::{BackingStore, DatasetSummary, InMemoryBackingStore, PostgresBackingStore, StoreError};
pub use writer::{JobWriter, WriterQueue};
