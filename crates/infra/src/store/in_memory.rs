use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use jobsdb_core::{Dataset, Job, JobQuery, JobStatus, StoredJob};

use super::r#trait::{BackingStore, DatasetSummary, StoreError};

#[derive(Debug, Clone)]
struct JobRow {
    job_id: i64,
    created_at: DateTime<Utc>,
    job: Job,
}

#[derive(Debug)]
enum Table {
    Jobs { next_id: i64, rows: Vec<JobRow> },
    JobStatus { rows: Vec<JobStatus> },
    Other,
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_copy: bool,
    fail_copy_after: Option<usize>,
    fail_next_create: bool,
}

/// In-memory backing store.
///
/// Intended for tests/dev. Copies are staged and applied only once the whole
/// batch is accepted, mirroring a committed transaction. Failures can be
/// scheduled to exercise rollback paths.
#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    tables: RwLock<BTreeMap<String, Table>>,
    faults: Mutex<Faults>,
    queries: AtomicU64,
    deny_queries: AtomicBool,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls served so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Panic on any store call while set.
    pub fn deny_queries(&self, deny: bool) {
        self.deny_queries.store(deny, Ordering::SeqCst);
    }

    /// Make the next `copy_jobs` fail before staging anything.
    pub fn fail_next_copy(&self) {
        self.with_faults(|f| f.fail_next_copy = true);
    }

    /// Make the next `copy_jobs` fail after staging `rows` rows.
    pub fn fail_copy_after(&self, rows: usize) {
        self.with_faults(|f| f.fail_copy_after = Some(rows));
    }

    /// Make the next `create_dataset` fail; neither table is created.
    pub fn fail_next_create(&self) {
        self.with_faults(|f| f.fail_next_create = true);
    }

    /// Register a table unrelated to any dataset, or one half of a dataset.
    pub fn create_raw_table(&self, name: &str) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let table = if name.contains("_job_status_") {
            Table::JobStatus { rows: Vec::new() }
        } else if name.contains("_jobs_") {
            Table::Jobs { next_id: 1, rows: Vec::new() }
        } else {
            Table::Other
        };
        tables.insert(name.to_string(), table);
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.read_tables().map(|t| t.contains_key(name)).unwrap_or(false)
    }

    /// Rows currently committed in a job or status table.
    pub fn row_count(&self, name: &str) -> usize {
        let Ok(tables) = self.read_tables() else {
            return 0;
        };
        match tables.get(name) {
            Some(Table::Jobs { rows, .. }) => rows.len(),
            Some(Table::JobStatus { rows }) => rows.len(),
            _ => 0,
        }
    }

    /// Overwrite `created_at` of every job in `job_table`.
    pub fn backdate_jobs(&self, job_table: &str, created_at: DateTime<Utc>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(Table::Jobs { rows, .. }) = tables.get_mut(job_table) {
            for row in rows {
                row.created_at = created_at;
            }
        }
    }

    fn with_faults(&self, f: impl FnOnce(&mut Faults)) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut faults);
    }

    fn record_query(&self) {
        assert!(
            !self.deny_queries.load(Ordering::SeqCst),
            "store queried while queries are denied"
        );
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn read_tables(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Table>>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Query("lock poisoned".to_string()))
    }

    fn write_tables(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Table>>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Query("lock poisoned".to_string()))
    }

    fn terminal_job_ids(tables: &BTreeMap<String, Table>, status_table: &str) -> Result<HashSet<i64>, StoreError> {
        match tables.get(status_table) {
            Some(Table::JobStatus { rows }) => Ok(rows
                .iter()
                .filter(|status| status.state.is_terminal())
                .map(|status| status.job_id)
                .collect()),
            _ => Err(StoreError::UnknownTable(status_table.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.record_query();
        let tables = self.read_tables()?;
        // Reverse order: callers must sort.
        Ok(tables.keys().rev().cloned().collect())
    }

    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.record_query();
        let fail = {
            let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut faults.fail_next_create)
        };

        let mut tables = self.write_tables()?;
        for name in [&dataset.job_table, &dataset.job_status_table] {
            if tables.contains_key(name) {
                return Err(StoreError::TableExists(name.clone()));
            }
        }
        if fail {
            return Err(StoreError::Injected(format!("create {}", dataset.job_status_table)));
        }
        tables.insert(
            dataset.job_table.clone(),
            Table::Jobs {
                next_id: 1,
                rows: Vec::new(),
            },
        );
        tables.insert(dataset.job_status_table.clone(), Table::JobStatus { rows: Vec::new() });
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.record_query();
        let mut tables = self.write_tables()?;
        if !tables.contains_key(&dataset.job_table) {
            return Err(StoreError::UnknownTable(dataset.job_table.clone()));
        }
        tables.remove(&dataset.job_status_table);
        tables.remove(&dataset.job_table);
        Ok(())
    }

    async fn copy_jobs(&self, job_table: &str, jobs: &[Job]) -> Result<u64, StoreError> {
        self.record_query();
        let (fail_now, fail_after) = {
            let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            (
                std::mem::take(&mut faults.fail_next_copy),
                faults.fail_copy_after.take(),
            )
        };
        if fail_now {
            return Err(StoreError::Injected(format!("copy into {job_table}")));
        }

        let now = Utc::now();
        let mut staged = Vec::with_capacity(jobs.len());
        for job in jobs {
            if fail_after == Some(staged.len()) {
                return Err(StoreError::Injected(format!(
                    "copy into {job_table} after {} rows",
                    staged.len()
                )));
            }
            staged.push(job.clone());
        }

        let mut tables = self.write_tables()?;
        let Some(Table::Jobs { next_id, rows }) = tables.get_mut(job_table) else {
            return Err(StoreError::UnknownTable(job_table.to_string()));
        };
        let copied = staged.len() as u64;
        for job in staged {
            rows.push(JobRow {
                job_id: *next_id,
                created_at: now,
                job,
            });
            *next_id += 1;
        }
        Ok(copied)
    }

    async fn count_jobs(&self, job_table: &str) -> Result<u64, StoreError> {
        self.record_query();
        let tables = self.read_tables()?;
        match tables.get(job_table) {
            Some(Table::Jobs { rows, .. }) => Ok(rows.len() as u64),
            _ => Err(StoreError::UnknownTable(job_table.to_string())),
        }
    }

    async fn fetch_unprocessed(&self, dataset: &Dataset, query: &JobQuery) -> Result<Vec<StoredJob>, StoreError> {
        self.record_query();
        let tables = self.read_tables()?;
        let Some(Table::Jobs { rows, .. }) = tables.get(&dataset.job_table) else {
            return Err(StoreError::UnknownTable(dataset.job_table.clone()));
        };
        let Some(Table::JobStatus { rows: statuses }) = tables.get(&dataset.job_status_table) else {
            return Err(StoreError::UnknownTable(dataset.job_status_table.clone()));
        };

        let seen: HashSet<i64> = statuses.iter().map(|status| status.job_id).collect();
        Ok(rows
            .iter()
            .filter(|row| !seen.contains(&row.job_id) && query.matches(&row.job))
            .take(query.limit)
            .map(|row| StoredJob {
                job_id: row.job_id,
                dataset: dataset.index.clone(),
                created_at: row.created_at,
                job: row.job.clone(),
            })
            .collect())
    }

    async fn append_statuses(&self, batches: &[(Dataset, Vec<JobStatus>)]) -> Result<(), StoreError> {
        self.record_query();
        let mut tables = self.write_tables()?;

        for (dataset, statuses) in batches {
            let Some(Table::Jobs { rows, .. }) = tables.get(&dataset.job_table) else {
                return Err(StoreError::UnknownTable(dataset.job_table.clone()));
            };
            let known: HashSet<i64> = rows.iter().map(|row| row.job_id).collect();
            if let Some(orphan) = statuses.iter().find(|status| !known.contains(&status.job_id)) {
                return Err(StoreError::Query(format!(
                    "job {} does not exist in {}",
                    orphan.job_id, dataset.job_table
                )));
            }
            if !matches!(tables.get(&dataset.job_status_table), Some(Table::JobStatus { .. })) {
                return Err(StoreError::UnknownTable(dataset.job_status_table.clone()));
            }
        }

        for (dataset, statuses) in batches {
            if let Some(Table::JobStatus { rows }) = tables.get_mut(&dataset.job_status_table) {
                rows.extend(statuses.iter().cloned());
            }
        }
        Ok(())
    }

    async fn dataset_summary(&self, dataset: &Dataset) -> Result<DatasetSummary, StoreError> {
        self.record_query();
        let tables = self.read_tables()?;
        let Some(Table::Jobs { rows, .. }) = tables.get(&dataset.job_table) else {
            return Err(StoreError::UnknownTable(dataset.job_table.clone()));
        };
        let terminal = Self::terminal_job_ids(&tables, &dataset.job_status_table)?;
        Ok(DatasetSummary {
            jobs: rows.len() as u64,
            terminal_jobs: rows.iter().filter(|row| terminal.contains(&row.job_id)).count() as u64,
            newest_job_at: rows.iter().map(|row| row.created_at).max(),
        })
    }
}
