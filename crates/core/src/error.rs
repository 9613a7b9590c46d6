//! Error model for index, dataset and job primitives.

use thiserror::Error;

/// Failures of dataset index parsing and allocation.
///
/// All variants are deterministic: the same inputs always yield the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The textual index was not a well-formed `_`-separated list of integers.
    #[error("malformed dataset index '{index}': {reason}")]
    Format { index: String, reason: String },

    /// `before` does not sort strictly before `after`.
    #[error("dataset index '{before}' does not sort before '{after}'")]
    Order { before: String, after: String },

    /// No index within the depth bound fits between the two neighbours.
    #[error("no dataset index fits between '{before}' and '{after}'")]
    NoRoom { before: String, after: String },

    /// Cluster migration was requested against an empty catalog.
    #[error("cluster migration needs at least one existing dataset")]
    EmptyCatalog,

    /// The anchor of a cluster migration is not a single-level regular dataset.
    #[error("dataset '{table}' is split and cannot anchor a cluster migration")]
    SplitAnchor { table: String },

    /// The catalog holds a split dataset, which cluster migration cannot reason about.
    #[error("dataset '{table}' is split; cluster migration requires single-level datasets")]
    SplitCatalog { table: String },
}

impl IndexError {
    pub fn format(index: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            index: index.into(),
            reason: reason.into(),
        }
    }
}

/// Failures of dataset naming.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatasetError {
    /// Table prefix does not match `[a-z][a-z0-9_]*` or is too long.
    #[error("invalid table prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    /// A generated table name would be truncated by Postgres.
    #[error("table name '{table}' is {len} bytes, limit is {max}")]
    NameTooLong { table: String, len: usize, max: usize },
}

/// A job rejected before reaching the store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// `parameters` or `event_payload` is not valid JSON.
    #[error("job {uuid}: field '{field}' is not valid JSON: {reason}")]
    InvalidJson {
        uuid: uuid::Uuid,
        field: &'static str,
        reason: String,
    },

    /// A text column exceeds its storage width or contains a NUL byte.
    #[error("job {uuid}: field '{field}' rejected: {reason}")]
    InvalidField {
        uuid: uuid::Uuid,
        field: &'static str,
        reason: String,
    },
}
