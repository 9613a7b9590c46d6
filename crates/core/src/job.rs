//! Jobs and job status records.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::index::DatasetIndex;

/// Storage width of the `custom_val` column.
pub const CUSTOM_VAL_MAX_LEN: usize = 64;

/// A job as submitted by a producer.
///
/// `parameters` and `event_payload` are opaque JSON documents kept as bytes;
/// they are only checked for well-formedness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub user_id: String,
    pub custom_val: String,
    pub parameters: Vec<u8>,
    pub event_payload: Vec<u8>,
}

impl Job {
    /// New job with a time-ordered UUID.
    pub fn new(
        user_id: impl Into<String>,
        custom_val: impl Into<String>,
        parameters: impl Into<Vec<u8>>,
        event_payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            user_id: user_id.into(),
            custom_val: custom_val.into(),
            parameters: parameters.into(),
            event_payload: event_payload.into(),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        self.check_text("user_id", &self.user_id)?;
        self.check_text("custom_val", &self.custom_val)?;
        if self.custom_val.len() > CUSTOM_VAL_MAX_LEN {
            return Err(JobError::InvalidField {
                uuid: self.uuid,
                field: "custom_val",
                reason: format!("longer than {CUSTOM_VAL_MAX_LEN} bytes"),
            });
        }
        self.check_json("parameters", &self.parameters)?;
        self.check_json("event_payload", &self.event_payload)
    }

    fn check_text(&self, field: &'static str, value: &str) -> Result<(), JobError> {
        if value.contains('\0') {
            return Err(JobError::InvalidField {
                uuid: self.uuid,
                field,
                reason: "contains a NUL byte".to_string(),
            });
        }
        Ok(())
    }

    fn check_json(&self, field: &'static str, bytes: &[u8]) -> Result<(), JobError> {
        serde_json::from_slice::<serde::de::IgnoredAny>(bytes)
            .map(|_| ())
            .map_err(|err| JobError::InvalidJson {
                uuid: self.uuid,
                field,
                reason: err.to_string(),
            })
    }
}

/// A job read back from a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJob {
    pub job_id: i64,
    pub dataset: DatasetIndex,
    pub created_at: DateTime<Utc>,
    pub job: Job,
}

/// Processing state recorded in a status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Executing,
    Succeeded,
    Waiting,
    Failed,
    Aborted,
    Migrated,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Executing,
        JobState::Succeeded,
        JobState::Waiting,
        JobState::Failed,
        JobState::Aborted,
        JobState::Migrated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Executing => "executing",
            JobState::Succeeded => "succeeded",
            JobState::Waiting => "waiting",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
            JobState::Migrated => "migrated",
        }
    }

    /// States after which a job is never picked up again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Aborted | JobState::Migrated)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// One row of a status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: i64,
    pub state: JobState,
    pub attempt: i16,
    pub exec_time: DateTime<Utc>,
    pub retry_time: DateTime<Utc>,
    pub error_code: String,
    pub error_response: Value,
    pub parameters: Value,
}

impl JobStatus {
    /// First attempt status stamped with `now`, no error details.
    pub fn new(job_id: i64, state: JobState, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state,
            attempt: 1,
            exec_time: now,
            retry_time: now,
            error_code: String::new(),
            error_response: Value::Object(Default::default()),
            parameters: Value::Object(Default::default()),
        }
    }

    pub fn with_attempt(mut self, attempt: i16) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, response: Value) -> Self {
        self.error_code = code.into();
        self.error_response = response;
        self
    }
}

/// A status to append to the dataset holding `job_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusUpdate {
    pub dataset: DatasetIndex,
    pub status: JobStatus,
}

impl StoredJob {
    pub fn status_update(&self, state: JobState, now: DateTime<Utc>) -> JobStatusUpdate {
        JobStatusUpdate {
            dataset: self.dataset.clone(),
            status: JobStatus::new(self.job_id, state, now),
        }
    }
}

/// Filter on a top-level string field of `parameters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterFilter {
    pub name: String,
    pub value: String,
}

/// Selection of jobs without any status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    /// Match any of these `custom_val`s; empty matches all.
    pub custom_vals: Vec<String>,
    /// All filters must match.
    pub parameter_filters: Vec<ParameterFilter>,
    pub limit: usize,
}

impl JobQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            custom_vals: Vec::new(),
            parameter_filters: Vec::new(),
            limit,
        }
    }

    pub fn custom_val(mut self, value: impl Into<String>) -> Self {
        self.custom_vals.push(value.into());
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter_filters.push(ParameterFilter {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// JSON object used for containment matching against `parameters`.
    pub fn parameter_containment(&self) -> Value {
        let object = self
            .parameter_filters
            .iter()
            .map(|filter| (filter.name.clone(), Value::String(filter.value.clone())))
            .collect();
        Value::Object(object)
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.custom_vals.is_empty() && !self.custom_vals.iter().any(|v| *v == job.custom_val) {
            return false;
        }
        if self.parameter_filters.is_empty() {
            return true;
        }
        let Ok(Value::Object(parameters)) = serde_json::from_slice::<Value>(&job.parameters) else {
            return false;
        };
        self.parameter_filters
            .iter()
            .all(|filter| parameters.get(&filter.name).and_then(Value::as_str) == Some(filter.value.as_str()))
    }
}
