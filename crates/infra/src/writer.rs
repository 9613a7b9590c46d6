//! Batch writer and the optional writer queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use jobsdb_core::Job;

use crate::catalog::DatasetCatalog;
use crate::error::{JobsDbError, JobsDbResult};
use crate::stats::{JOBS_STORED, STORE_TIMER, StatsSink, start_timer};
use crate::store::{BackingStore, bounded};

/// Writes whole batches into the tail dataset.
pub struct JobWriter<S> {
    store: Arc<S>,
    catalog: Arc<DatasetCatalog<S>>,
    stats: Arc<dyn StatsSink>,
    store_timeout: Duration,
}

impl<S: BackingStore> JobWriter<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<DatasetCatalog<S>>,
        stats: Arc<dyn StatsSink>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            stats,
            store_timeout,
        }
    }

    /// Copy `jobs` into the tail dataset in one transaction.
    ///
    /// The batch is validated before any store access. Returns the number of
    /// rows committed, which is always `jobs.len()` on success.
    pub async fn write(&self, jobs: &[Job]) -> JobsDbResult<u64> {
        if jobs.is_empty() {
            return Err(JobsDbError::EmptyBatch);
        }
        for job in jobs {
            job.validate()?;
        }

        // Held until commit so the tail cannot be replaced or dropped mid-copy.
        let _membership = self.catalog.pin_membership().await;
        let tail = self.catalog.tail_or_refresh().await?.ok_or(JobsDbError::NoDataset)?;

        let _timer = start_timer(&self.stats, STORE_TIMER);
        let copied = bounded(
            "copy_jobs",
            self.store_timeout,
            self.store.copy_jobs(&tail.job_table, jobs),
        )
        .await?;

        self.stats.count(JOBS_STORED, copied);
        debug!(index = %tail.index, jobs = copied, "stored job batch");
        Ok(copied)
    }
}

struct WriteRequest {
    jobs: Vec<Job>,
    done: oneshot::Sender<JobsDbResult<u64>>,
}

/// Fixed pool of workers draining a bounded channel of batches.
///
/// `submit` waits for channel capacity, so producers slow down when the
/// workers fall behind.
pub struct WriterQueue {
    sender: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriterQueue {
    /// Spawn `workers` tasks on the current runtime.
    pub fn spawn<S: BackingStore>(writer: Arc<JobWriter<S>>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<WriteRequest>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let writer = Arc::clone(&writer);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker_loop(worker, writer, receiver))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a batch and wait for the worker's outcome.
    pub async fn submit(&self, jobs: Vec<Job>) -> JobsDbResult<u64> {
        let sender = {
            let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone().ok_or(JobsDbError::WriterClosed)?
        };

        let (done, outcome) = oneshot::channel();
        sender
            .send(WriteRequest { jobs, done })
            .await
            .map_err(|_| JobsDbError::WriterClosed)?;
        outcome.await.map_err(|_| JobsDbError::WriterClosed)?
    }

    /// Stop accepting batches, let workers drain what is queued, and join them.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "writer worker ended abnormally");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

async fn worker_loop<S: BackingStore>(
    worker: usize,
    writer: Arc<JobWriter<S>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteRequest>>>,
) {
    loop {
        let request = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(request) = request else {
            break;
        };

        let outcome = writer.write(&request.jobs).await;
        if let Err(err) = &outcome {
            warn!(worker, error = %err, jobs = request.jobs.len(), "writer worker failed to store batch");
        }
        // The submitter may have given up waiting.
        let _ = request.done.send(outcome);
    }
    debug!(worker, "writer worker stopped");
}
