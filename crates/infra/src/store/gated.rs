//! In-memory store whose calls can be parked mid-flight, for interleaving tests.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use jobsdb_core::{Dataset, Job, JobQuery, JobStatus, StoredJob};

use super::in_memory::InMemoryBackingStore;
use super::r#trait::{BackingStore, DatasetSummary, StoreError};

struct Gate {
    parked: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Wraps [`InMemoryBackingStore`]. An armed operation parks once: `list_tables`
/// after reading the listing, `copy_jobs` before copying anything.
#[derive(Default)]
pub(crate) struct GatedStore {
    pub(crate) inner: InMemoryBackingStore,
    gates: Mutex<HashMap<&'static str, Gate>>,
}

impl GatedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park the next call of `operation`. Returns a receiver that fires once the
    /// call is parked and a sender that lets it continue.
    pub(crate) fn arm(&self, operation: &'static str) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (parked_tx, parked_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).insert(
            operation,
            Gate {
                parked: parked_tx,
                release: release_rx,
            },
        );
        (parked_rx, release_tx)
    }

    async fn pass(&self, operation: &'static str) {
        let gate = self.gates.lock().unwrap_or_else(|e| e.into_inner()).remove(operation);
        if let Some(Gate { parked, release }) = gate {
            let _ = parked.send(());
            let _ = release.await;
        }
    }
}

#[async_trait::async_trait]
impl BackingStore for GatedStore {
    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let tables = self.inner.list_tables().await?;
        self.pass("list_tables").await;
        Ok(tables)
    }

    async fn create_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.inner.create_dataset(dataset).await
    }

    async fn drop_dataset(&self, dataset: &Dataset) -> Result<(), StoreError> {
        self.inner.drop_dataset(dataset).await
    }

    async fn copy_jobs(&self, job_table: &str, jobs: &[Job]) -> Result<u64, StoreError> {
        self.pass("copy_jobs").await;
        self.inner.copy_jobs(job_table, jobs).await
    }

    async fn count_jobs(&self, job_table: &str) -> Result<u64, StoreError> {
        self.inner.count_jobs(job_table).await
    }

    async fn fetch_unprocessed(&self, dataset: &Dataset, query: &JobQuery) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.fetch_unprocessed(dataset, query).await
    }

    async fn append_statuses(&self, batches: &[(Dataset, Vec<JobStatus>)]) -> Result<(), StoreError> {
        self.inner.append_statuses(batches).await
    }

    async fn dataset_summary(&self, dataset: &Dataset) -> Result<DatasetSummary, StoreError> {
        self.inner.dataset_summary(dataset).await
    }
}
