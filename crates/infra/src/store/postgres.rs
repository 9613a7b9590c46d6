//! Postgres-backed dataset store.
//!
//! Each dataset is a pair of tables created and dropped in one transaction.
//! Jobs are written with `COPY ... FROM STDIN` inside a transaction, so a
//! batch is visible in full after commit or not at all.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (undefined table) | `42P01` | `UnknownTable` |
//! | Database (duplicate table) | `42P07` | `TableExists` |
//! | Database (bad copy data) | `22P02`, `22P04` | `Copy` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Connection` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Query` |

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use jobsdb_core::{Dataset, Job, JobQuery, JobState, JobStatus, StoredJob};

use super::copy::{copy_statement, encode_copy_rows};
use super::r#trait::{BackingStore, DatasetSummary, StoreError};
use crate::config::DatabaseConfig;

const LIST_TABLES: &str = r#"
    SELECT tablename
    FROM pg_catalog.pg_tables
    WHERE schemaname = current_schema()
"#;

/// Postgres dataset store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackingStore {
    pool: Arc<PgPool>,
}

impl PostgresBackingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Open a pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn create_job_table_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE "{table}" (
            job_id BIGSERIAL PRIMARY KEY,
            uuid UUID NOT NULL,
            user_id TEXT NOT NULL,
            custom_val VARCHAR(64) NOT NULL,
            parameters JSONB NOT NULL,
            event_payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    )
}

fn create_status_table_sql(table: &str, job_table: &str) -> String {
    format!(
        r#"CREATE TABLE "{table}" (
            id BIGSERIAL,
            job_id BIGINT NOT NULL REFERENCES "{job_table}" (job_id),
            job_state VARCHAR(64) NOT NULL,
            attempt SMALLINT NOT NULL,
            exec_time TIMESTAMPTZ NOT NULL,
            retry_time TIMESTAMPTZ NOT NULL,
            error_code VARCHAR(32) NOT NULL,
            error_response JSONB NOT NULL,
            parameters JSONB NOT NULL,
            PRIMARY KEY (job_id, job_state, id)
        )"#
    )
}

fn terminal_states_sql() -> String {
    JobState::ALL
        .iter()
        .filter(|state| state.is_terminal())
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait::async_trait]
impl BackingStore for PostgresBackingStore {
    #[instrument(skip(self), err)]
    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(LIST_TABLES)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tables", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("tablename")
                    .map_err(|e| StoreError::Corrupt(format!("failed to read table name: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self, dataset), fields(index = %dataset.index), err)]
    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(&create_job_table_sql(&dataset.job_table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_job_table", e))?;
        sqlx::query(&create_status_table_sql(&dataset.job_status_table, &dataset.job_table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("create_status_table", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, dataset), fields(index = %dataset.index), err)]
    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(&format!(r#"DROP TABLE "{}""#, dataset.job_status_table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_status_table", e))?;
        sqlx::query(&format!(r#"DROP TABLE "{}""#, dataset.job_table))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_job_table", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, jobs), fields(job_count = jobs.len()), err)]
    async fn copy_jobs(&self, job_table: &str, jobs: &[Job]) -> Result<u64, StoreError> {
        let payload = encode_copy_rows(jobs)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut copy = tx
            .copy_in_raw(&copy_statement(job_table))
            .await
            .map_err(|e| map_sqlx_error("copy_in", e))?;
        copy.send(payload)
            .await
            .map_err(|e| map_sqlx_error("copy_send", e))?;
        let copied = copy
            .finish()
            .await
            .map_err(|e| map_sqlx_error("copy_finish", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(copied)
    }

    #[instrument(skip(self), err)]
    async fn count_jobs(&self, job_table: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(&format!(r#"SELECT COUNT(*) AS total FROM "{job_table}""#))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Corrupt(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self, dataset, query), fields(index = %dataset.index, limit = query.limit), err)]
    async fn fetch_unprocessed(&self, dataset: &Dataset, query: &JobQuery) -> Result<Vec<StoredJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT j.job_id, j.uuid, j.user_id, j.custom_val,
                   j.parameters::text AS parameters,
                   j.event_payload::text AS event_payload,
                   j.created_at
            FROM "{jobs}" j
            WHERE NOT EXISTS (SELECT 1 FROM "{status}" s WHERE s.job_id = j.job_id)
                AND (cardinality($1::text[]) = 0 OR j.custom_val = ANY($1))
                AND j.parameters @> $2::jsonb
            ORDER BY j.job_id ASC
            LIMIT $3
            "#,
            jobs = dataset.job_table,
            status = dataset.job_status_table,
        );

        let rows = sqlx::query(&sql)
            .bind(&query.custom_vals)
            .bind(query.parameter_containment())
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_unprocessed", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |e: sqlx::Error| StoreError::Corrupt(format!("failed to decode job row: {e}"));
            let parameters: String = row.try_get("parameters").map_err(decode)?;
            let event_payload: String = row.try_get("event_payload").map_err(decode)?;
            jobs.push(StoredJob {
                job_id: row.try_get("job_id").map_err(decode)?,
                dataset: dataset.index.clone(),
                created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
                job: Job {
                    uuid: row.try_get::<Uuid, _>("uuid").map_err(decode)?,
                    user_id: row.try_get("user_id").map_err(decode)?,
                    custom_val: row.try_get("custom_val").map_err(decode)?,
                    parameters: parameters.into_bytes(),
                    event_payload: event_payload.into_bytes(),
                },
            });
        }
        Ok(jobs)
    }

    #[instrument(skip(self, batches), fields(datasets = batches.len()), err)]
    async fn append_statuses(&self, batches: &[(Dataset, Vec<JobStatus>)]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (dataset, statuses) in batches {
            let sql = format!(
                r#"
                INSERT INTO "{}" (
                    job_id, job_state, attempt, exec_time, retry_time,
                    error_code, error_response, parameters
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
                dataset.job_status_table
            );
            for status in statuses {
                sqlx::query(&sql)
                    .bind(status.job_id)
                    .bind(status.state.as_str())
                    .bind(status.attempt)
                    .bind(status.exec_time)
                    .bind(status.retry_time)
                    .bind(&status.error_code)
                    .bind(&status.error_response)
                    .bind(&status.parameters)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("insert_status", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, dataset), fields(index = %dataset.index), err)]
    async fn dataset_summary(&self, dataset: &Dataset) -> Result<DatasetSummary, StoreError> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) AS jobs,
                COUNT(*) FILTER (WHERE EXISTS (
                    SELECT 1 FROM "{status}" s
                    WHERE s.job_id = j.job_id AND s.job_state IN ({terminal})
                )) AS terminal_jobs,
                MAX(j.created_at) AS newest_job_at
            FROM "{jobs}" j
            "#,
            status = dataset.job_status_table,
            jobs = dataset.job_table,
            terminal = terminal_states_sql(),
        );

        let row = sqlx::query(&sql)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("dataset_summary", e))?;

        let decode = |e: sqlx::Error| StoreError::Corrupt(format!("failed to decode summary: {e}"));
        let jobs: i64 = row.try_get("jobs").map_err(decode)?;
        let terminal_jobs: i64 = row.try_get("terminal_jobs").map_err(decode)?;
        Ok(DatasetSummary {
            jobs: jobs.max(0) as u64,
            terminal_jobs: terminal_jobs.max(0) as u64,
            newest_job_at: row.try_get::<Option<DateTime<Utc>>, _>("newest_job_at").map_err(decode)?,
        })
    }
}

/// Map a SQLx error to a `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => StoreError::UnknownTable(msg),
                Some("42P07") => StoreError::TableExists(msg),
                Some("22P02") | Some("22P04") => StoreError::Copy(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Connection(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => StoreError::Connection(format!("connection pool timed out in {operation}")),
        sqlx::Error::Io(e) => StoreError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Connection(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_quotes_identifiers_and_links_status_to_jobs() {
        let sql = create_status_table_sql("tt_job_status_1_1", "tt_jobs_1_1");
        assert!(sql.starts_with(r#"CREATE TABLE "tt_job_status_1_1""#));
        assert!(sql.contains(r#"REFERENCES "tt_jobs_1_1" (job_id)"#));
        assert!(sql.contains("PRIMARY KEY (job_id, job_state, id)"));

        let sql = create_job_table_sql("tt_jobs_1_1");
        assert!(sql.contains("custom_val VARCHAR(64) NOT NULL"));
        assert!(sql.contains("created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"));
    }

    #[test]
    fn table_listing_stays_in_current_schema() {
        assert!(LIST_TABLES.contains("schemaname = current_schema()"));
        assert!(!LIST_TABLES.contains("!="));
    }

    #[test]
    fn terminal_state_list() {
        assert_eq!(terminal_states_sql(), "'succeeded', 'aborted', 'migrated'");
    }

    #[test]
    fn pool_errors_map_to_connection() {
        assert!(matches!(
            map_sqlx_error("list_tables", sqlx::Error::PoolClosed),
            StoreError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error("list_tables", sqlx::Error::RowNotFound),
            StoreError::Query(_)
        ));
    }
}
