//! Queue handle: the entry point producers and processors use.
//!
//! Dataset allocation, creation and removal all run under one allocation
//! mutex and hold the catalog's membership lock while the dataset set
//! changes. Status updates take per-dataset locks in index order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use jobsdb_core::{
    Dataset, DatasetIndex, Job, JobQuery, JobStatus, JobStatusUpdate, StoredJob, TablePrefix, compute_append_idx,
    compute_idx_for_cluster_migration, compute_insert_idx,
};

use crate::catalog::DatasetCatalog;
use crate::config::{HandleConfig, Mode};
use crate::error::{JobsDbError, JobsDbResult};
use crate::locks::KeyedLocks;
use crate::stats::{DATASETS_CREATED, StatsSink};
use crate::store::{BackingStore, bounded};
use crate::writer::{JobWriter, WriterQueue};

pub struct Handle<S> {
    config: HandleConfig,
    prefix: TablePrefix,
    store: Arc<S>,
    catalog: Arc<DatasetCatalog<S>>,
    writer: Arc<JobWriter<S>>,
    writer_queue: Option<WriterQueue>,
    stats: Arc<dyn StatsSink>,
    allocation: Mutex<()>,
    dataset_locks: KeyedLocks<DatasetIndex>,
}

impl<S: BackingStore> Handle<S> {
    /// Validate `config`, load the catalog and make the handle ready for use.
    ///
    /// A read-write handle over an empty catalog creates dataset `1`. The writer
    /// queue, when enabled, is spawned on the current runtime.
    #[instrument(skip(config, store, stats), fields(prefix = %config.table_prefix, mode = ?config.mode), err)]
    pub async fn setup(config: HandleConfig, store: Arc<S>, stats: Arc<dyn StatsSink>) -> JobsDbResult<Self> {
        config.validate()?;
        let prefix = config.prefix()?;
        let timeout = config.store_timeout();

        let catalog = Arc::new(DatasetCatalog::new(prefix.clone(), Arc::clone(&store), timeout));
        let writer = Arc::new(JobWriter::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&stats),
            timeout,
        ));
        let writer_queue = config
            .enable_writer_queue
            .then(|| WriterQueue::spawn(Arc::clone(&writer), config.writer_workers, config.writer_queue_capacity));

        let handle = Self {
            config,
            prefix,
            store,
            catalog,
            writer,
            writer_queue,
            stats,
            allocation: Mutex::new(()),
            dataset_locks: KeyedLocks::new(),
        };

        let datasets = handle.catalog.refresh().await?;
        if datasets.is_empty() && handle.config.mode == Mode::ReadWrite {
            let _allocating = handle.allocation.lock().await;
            handle.create_dataset_locked(DatasetIndex::regular(1)?).await?;
        }
        info!(datasets = handle.catalog.snapshot().len(), "jobsdb handle ready");
        Ok(handle)
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub fn table_prefix(&self) -> &TablePrefix {
        &self.prefix
    }

    pub fn catalog(&self) -> &DatasetCatalog<S> {
        &self.catalog
    }

    fn ensure_writable(&self) -> JobsDbResult<()> {
        match self.config.mode {
            Mode::ReadWrite => Ok(()),
            Mode::ReadOnly => Err(JobsDbError::ReadOnly),
        }
    }

    /// Durably store a batch of jobs in the tail dataset.
    ///
    /// With the writer queue enabled the batch is handed to a worker and this
    /// call resolves with the worker's outcome.
    pub async fn store(&self, jobs: Vec<Job>) -> JobsDbResult<()> {
        self.ensure_writable()?;
        match &self.writer_queue {
            Some(queue) => queue.submit(jobs).await.map(|_| ()),
            None => self.writer.write(&jobs).await.map(|_| ()),
        }
    }

    /// Ordered dataset list; `refresh_from_db` re-reads it from the store.
    pub async fn get_ds_list(&self, refresh_from_db: bool) -> JobsDbResult<Vec<Dataset>> {
        Ok(self.catalog.get_ds_list(refresh_from_db).await?)
    }

    /// Append a new tail dataset once the current tail holds `max_ds_size` jobs.
    pub async fn add_new_ds_if_full(&self) -> JobsDbResult<Option<Dataset>> {
        self.ensure_writable()?;
        let _allocating = self.allocation.lock().await;

        let Some(tail) = self.catalog.tail_or_refresh().await? else {
            return Err(JobsDbError::NoDataset);
        };
        let count = bounded(
            "count_jobs",
            self.config.store_timeout(),
            self.store.count_jobs(&tail.job_table),
        )
        .await?;
        if count < self.config.max_ds_size {
            return Ok(None);
        }

        debug!(index = %tail.index, count, limit = self.config.max_ds_size, "tail dataset full");
        let index = compute_append_idx(&self.catalog.snapshot())?;
        self.create_dataset_locked(index).await.map(Some)
    }

    /// Create a dataset ordered right after `index` and before its successor.
    ///
    /// When `index` is the tail the new dataset becomes the new tail.
    pub async fn insert_ds_after(&self, index: &DatasetIndex) -> JobsDbResult<Dataset> {
        self.ensure_writable()?;
        let _allocating = self.allocation.lock().await;
        self.catalog.refresh().await?;

        let anchor = self
            .catalog
            .find(index)
            .ok_or_else(|| JobsDbError::UnknownDataset(index.clone()))?;
        let next = match self.catalog.neighbour_after(&anchor.index) {
            Some(after) => compute_insert_idx(&anchor.index, &after.index)?,
            None => compute_append_idx(&self.catalog.snapshot())?,
        };
        self.create_dataset_locked(next).await
    }

    /// Create the import dataset that receives another node's jobs ahead of
    /// `anchor`.
    pub async fn add_ds_for_cluster_migration(&self, anchor: &DatasetIndex) -> JobsDbResult<Dataset> {
        self.ensure_writable()?;
        if !self.config.migration_enabled {
            return Err(JobsDbError::MigrationDisabled);
        }
        let _allocating = self.allocation.lock().await;
        let datasets = self.catalog.refresh().await?;

        let anchor = self
            .catalog
            .find(anchor)
            .ok_or_else(|| JobsDbError::UnknownDataset(anchor.clone()))?;
        let index = compute_idx_for_cluster_migration(self.prefix.as_str(), &datasets, &anchor)?;
        self.create_dataset_locked(index).await
    }

    async fn create_dataset_locked(&self, index: DatasetIndex) -> JobsDbResult<Dataset> {
        let dataset = Dataset::new(&self.prefix, index);
        dataset.check_identifiers()?;

        let _membership = self.catalog.lock_membership().await;
        bounded(
            "create_dataset",
            self.config.store_timeout(),
            self.store.create_dataset(&dataset),
        )
        .await?;
        self.catalog.insert(dataset.clone()).await;
        self.stats.count(DATASETS_CREATED, 1);
        info!(index = %dataset.index, job_table = %dataset.job_table, "created dataset");
        Ok(dataset)
    }

    /// Jobs without a status row, oldest dataset first, up to `query.limit`.
    pub async fn get_unprocessed(&self, query: &JobQuery) -> JobsDbResult<Vec<StoredJob>> {
        self.check_filters(query)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let mut datasets = self.catalog.snapshot();
        if datasets.is_empty() {
            datasets = self.catalog.refresh().await?;
        }

        let mut jobs = Vec::new();
        for dataset in datasets.iter() {
            let remaining = query.limit - jobs.len();
            let page = JobQuery {
                limit: remaining,
                ..query.clone()
            };
            let found = bounded(
                "fetch_unprocessed",
                self.config.store_timeout(),
                self.store.fetch_unprocessed(dataset, &page),
            )
            .await?;
            jobs.extend(found);
            if jobs.len() >= query.limit {
                break;
            }
        }
        Ok(jobs)
    }

    fn check_filters(&self, query: &JobQuery) -> JobsDbResult<()> {
        let allowed = &self.config.query_filters;
        if !query.custom_vals.is_empty() && !allowed.custom_val {
            return Err(JobsDbError::FilterNotAllowed("custom_val".to_string()));
        }
        for filter in &query.parameter_filters {
            if !allowed.parameters.iter().any(|name| *name == filter.name) {
                return Err(JobsDbError::FilterNotAllowed(filter.name.clone()));
            }
        }
        Ok(())
    }

    /// Append status rows, grouped per dataset, in one transaction.
    pub async fn update_job_status(&self, updates: &[JobStatusUpdate]) -> JobsDbResult<()> {
        self.ensure_writable()?;
        if updates.is_empty() {
            return Ok(());
        }

        let mut grouped: BTreeMap<DatasetIndex, Vec<JobStatus>> = BTreeMap::new();
        for update in updates {
            grouped
                .entry(update.dataset.clone())
                .or_default()
                .push(update.status.clone());
        }

        let mut batches = Vec::with_capacity(grouped.len());
        for (index, statuses) in grouped {
            let dataset = self
                .catalog
                .find(&index)
                .ok_or_else(|| JobsDbError::UnknownDataset(index.clone()))?;
            batches.push((dataset, statuses));
        }

        let _locked = self
            .dataset_locks
            .lock_all(batches.iter().map(|(dataset, _)| dataset.index.clone()))
            .await;
        bounded(
            "append_statuses",
            self.config.store_timeout(),
            self.store.append_statuses(&batches),
        )
        .await?;
        Ok(())
    }

    /// Drop leading datasets whose jobs are all finished and whose newest job
    /// is older than the retention window. The tail is never dropped.
    pub async fn drop_expired_datasets(&self, now: DateTime<Utc>) -> JobsDbResult<Vec<Dataset>> {
        self.ensure_writable()?;
        let Some(retention) = self.config.retention() else {
            return Ok(Vec::new());
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let _allocating = self.allocation.lock().await;
        let _membership = self.catalog.lock_membership().await;
        let datasets = self.catalog.snapshot();
        let Some((_tail, leading)) = datasets.split_last() else {
            return Ok(Vec::new());
        };

        let mut dropped = Vec::new();
        for dataset in leading {
            let summary = bounded(
                "dataset_summary",
                self.config.store_timeout(),
                self.store.dataset_summary(dataset),
            )
            .await?;
            let expired = summary.fully_processed() && summary.newest_job_at.is_some_and(|newest| newest < cutoff);
            if !expired {
                break;
            }

            let _locked = self.dataset_locks.lock(&dataset.index).await;
            bounded(
                "drop_dataset",
                self.config.store_timeout(),
                self.store.drop_dataset(dataset),
            )
            .await?;
            self.catalog.remove(&dataset.index).await;
            self.dataset_locks.remove(&dataset.index);
            info!(index = %dataset.index, jobs = summary.jobs, "dropped expired dataset");
            dropped.push(dataset.clone());
        }
        Ok(dropped)
    }

    /// Close the writer queue and wait for its workers.
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.writer_queue {
            queue.shutdown().await;
        }
        info!("jobsdb handle stopped");
    }
}

impl<S: BackingStore> Handle<S> {
    /// Periodically append a new tail dataset when the current one is full.
    pub fn spawn_tail_monitor(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let handle = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        match handle.add_new_ds_if_full().await {
                            Ok(Some(dataset)) => debug!(index = %dataset.index, "tail monitor appended dataset"),
                            Ok(None) => {}
                            Err(err) => warn!(error = %err, "tail monitor check failed"),
                        }
                    }
                }
            }
            debug!("tail monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown),
            join: Some(join),
        }
    }
}

/// Handle to stop and join a background monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Request shutdown and wait for the monitor to stop.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}
