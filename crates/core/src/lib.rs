//! `jobsdb-core`: dataset indexes, allocation and job records.
//!
//! This crate is pure: no I/O, no async, no logging.

pub mod allocator;
pub mod dataset;
pub mod error;
pub mod index;
pub mod job;

pub use allocator::{
    MAX_INDEX_DEPTH, compute_append_idx, compute_idx_for_cluster_migration,
    compute_idx_for_cluster_migration_str, compute_insert_idx, compute_insert_idx_str,
};
pub use dataset::{Dataset, MAX_IDENTIFIER_LEN, MAX_PREFIX_LEN, TableKind, TablePrefix};
pub use error::{DatasetError, IndexError, JobError};
pub use index::DatasetIndex;
pub use job::{Job, JobQuery, JobState, JobStatus, JobStatusUpdate, ParameterFilter, StoredJob};
