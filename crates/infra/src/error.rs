//! Error returned by the handle and its components.

use thiserror::Error;

use jobsdb_core::{DatasetError, DatasetIndex, IndexError, JobError};

use crate::config::ConfigError;
use crate::store::StoreError;

pub type JobsDbResult<T> = Result<T, JobsDbError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobsDbError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidJob(#[from] JobError),

    /// Mutation attempted on a read-only handle.
    #[error("handle is read-only")]
    ReadOnly,

    #[error("store called with an empty batch")]
    EmptyBatch,

    /// The catalog is empty even after a refresh.
    #[error("no dataset available for writing")]
    NoDataset,

    #[error("writer queue is closed")]
    WriterClosed,

    #[error("cluster migration is disabled for this handle")]
    MigrationDisabled,

    #[error("query filter '{0}' is not enabled for this handle")]
    FilterNotAllowed(String),

    #[error("unknown dataset {0}")]
    UnknownDataset(DatasetIndex),
}
