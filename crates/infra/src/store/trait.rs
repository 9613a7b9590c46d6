use chrono::{DateTime, Utc};
use thiserror::Error;

use jobsdb_core::{Dataset, Job, JobQuery, JobStatus, StoredJob};

/// Errors from a backing store adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Pool exhausted/closed or the connection dropped.
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store query failed: {0}")]
    Query(String),

    /// Bulk copy rejected; nothing from the batch was committed.
    #[error("bulk copy failed: {0}")]
    Copy(String),

    #[error("store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    /// A row could not be decoded.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// Failure scheduled on the in-memory store.
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Aggregate view of one dataset used by retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatasetSummary {
    pub jobs: u64,
    /// Jobs with at least one terminal status row.
    pub terminal_jobs: u64,
    pub newest_job_at: Option<DateTime<Utc>>,
}

impl DatasetSummary {
    pub fn fully_processed(&self) -> bool {
        self.jobs > 0 && self.jobs == self.terminal_jobs
    }
}

/// Storage boundary for datasets.
///
/// Every mutating call is a single transaction: it either commits in full or
/// leaves no trace, including when the returned future is dropped mid-flight.
#[async_trait::async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Names of all user tables, in no particular order.
    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    /// Create the job and status tables of `dataset` together.
    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    /// Drop both tables of `dataset` together.
    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError>;

    /// Bulk insert `jobs` into `job_table`; returns the number of rows copied.
    async fn copy_jobs(&self, job_table: &str, jobs: &[Job]) -> Result<u64, StoreError>;

    async fn count_jobs(&self, job_table: &str) -> Result<u64, StoreError>;

    /// Jobs of `dataset` without any status row, in insertion order.
    async fn fetch_unprocessed(&self, dataset: &Dataset, query: &JobQuery) -> Result<Vec<StoredJob>, StoreError>;

    /// Append status rows across one or more datasets in one transaction.
    async fn append_statuses(&self, batches: &[(Dataset, Vec<JobStatus>)]) -> Result<(), StoreError>;

    async fn dataset_summary(&self, dataset: &Dataset) -> Result<DatasetSummary, StoreError>;
}
