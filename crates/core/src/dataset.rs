//! Datasets and their table naming convention.
//!
//! A dataset with index `i` under prefix `p` owns the tables `p_jobs_i` and
//! `p_job_status_i`.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;
use crate::index::DatasetIndex;

/// Longest accepted prefix. Deep indexes can still overflow
/// [`MAX_IDENTIFIER_LEN`]; see [`Dataset::check_identifiers`].
pub const MAX_PREFIX_LEN: usize = 40;

/// Postgres truncates identifiers beyond this many bytes (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

const JOBS_INFIX: &str = "_jobs_";
const STATUS_INFIX: &str = "_job_status_";

/// Validated table prefix of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TablePrefix(String);

impl TablePrefix {
    pub fn parse(prefix: &str) -> Result<Self, DatasetError> {
        let invalid = |reason: &str| DatasetError::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        };

        let mut chars = prefix.chars();
        match chars.next() {
            None => return Err(invalid("empty prefix")),
            Some(c) if !c.is_ascii_lowercase() => return Err(invalid("must start with a lowercase letter")),
            Some(_) => {}
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(invalid("only lowercase letters, digits and '_' are allowed"));
        }
        if prefix.len() > MAX_PREFIX_LEN {
            return Err(invalid("too long"));
        }
        Ok(Self(prefix.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn job_table(&self, index: &DatasetIndex) -> String {
        job_table_name(&self.0, index)
    }

    pub fn job_status_table(&self, index: &DatasetIndex) -> String {
        format!("{}{STATUS_INFIX}{index}", self.0)
    }

    /// Classify a table name belonging to this prefix.
    ///
    /// Returns `None` for tables of other prefixes and for names whose suffix
    /// is not a valid index.
    pub fn classify(&self, table: &str) -> Option<(TableKind, DatasetIndex)> {
        let rest = table.strip_prefix(self.0.as_str())?;
        let (kind, suffix) = if let Some(suffix) = rest.strip_prefix(JOBS_INFIX) {
            (TableKind::Jobs, suffix)
        } else if let Some(suffix) = rest.strip_prefix(STATUS_INFIX) {
            (TableKind::JobStatus, suffix)
        } else {
            return None;
        };
        DatasetIndex::parse(suffix).ok().map(|index| (kind, index))
    }
}

impl fmt::Display for TablePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TablePrefix {
    type Error = DatasetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TablePrefix> for String {
    fn from(value: TablePrefix) -> Self {
        value.0
    }
}

/// Job table name for `index` under a raw prefix.
pub fn job_table_name(prefix: &str, index: &DatasetIndex) -> String {
    format!("{prefix}{JOBS_INFIX}{index}")
}

/// Which half of a dataset a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Jobs,
    JobStatus,
}

/// One shard of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub job_table: String,
    pub job_status_table: String,
    pub index: DatasetIndex,
}

impl Dataset {
    pub fn new(prefix: &TablePrefix, index: DatasetIndex) -> Self {
        Self {
            job_table: prefix.job_table(&index),
            job_status_table: prefix.job_status_table(&index),
            index,
        }
    }

    /// Both table names fit in a Postgres identifier.
    ///
    /// A truncated name would parse back as a different index, so a dataset
    /// whose names are too long must never be created.
    pub fn check_identifiers(&self) -> Result<(), DatasetError> {
        for table in [&self.job_table, &self.job_status_table] {
            if table.len() > MAX_IDENTIFIER_LEN {
                return Err(DatasetError::NameTooLong {
                    table: table.clone(),
                    len: table.len(),
                    max: MAX_IDENTIFIER_LEN,
                });
            }
        }
        Ok(())
    }
}
