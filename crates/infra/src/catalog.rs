//! Ordered list of datasets known to a handle.
//!
//! The snapshot is swapped in whole on refresh, so readers see either the old
//! or the new list and never a partial one. Refresh, insert and remove all
//! serialise on one update lock; a refresh that read the store before a
//! concurrent create can therefore never overwrite the created dataset.
//!
//! Membership changes (create, drop) hold [`DatasetCatalog::lock_membership`]
//! exclusively while writers hold [`DatasetCatalog::pin_membership`] from tail
//! lookup to commit.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock as AsyncRwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use jobsdb_core::{Dataset, DatasetIndex, TableKind, TablePrefix};

use crate::store::{BackingStore, StoreError, bounded};

pub struct DatasetCatalog<S> {
    prefix: TablePrefix,
    store: Arc<S>,
    store_timeout: Duration,
    snapshot: RwLock<Arc<Vec<Dataset>>>,
    update_lock: Mutex<()>,
    membership: AsyncRwLock<()>,
}

impl<S: BackingStore> DatasetCatalog<S> {
    pub fn new(prefix: TablePrefix, store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            prefix,
            store,
            store_timeout,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            update_lock: Mutex::new(()),
            membership: AsyncRwLock::new(()),
        }
    }

    pub fn prefix(&self) -> &TablePrefix {
        &self.prefix
    }

    /// Current snapshot; never touches the store.
    pub fn snapshot(&self) -> Arc<Vec<Dataset>> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// The dataset list, optionally re-read from the store first.
    pub async fn get_ds_list(&self, refresh_from_db: bool) -> Result<Vec<Dataset>, StoreError> {
        if refresh_from_db {
            Ok(self.refresh().await?.as_ref().clone())
        } else {
            Ok(self.snapshot().as_ref().clone())
        }
    }

    /// Rebuild the snapshot from the store's table listing.
    pub async fn refresh(&self) -> Result<Arc<Vec<Dataset>>, StoreError> {
        let _updating = self.update_lock.lock().await;

        let tables = bounded("list_tables", self.store_timeout, self.store.list_tables()).await?;
        let datasets = Arc::new(self.datasets_from_tables(&tables));
        debug!(
            prefix = %self.prefix,
            tables = tables.len(),
            datasets = datasets.len(),
            "dataset catalog refreshed"
        );

        self.replace(Arc::clone(&datasets));
        Ok(datasets)
    }

    fn datasets_from_tables(&self, tables: &[String]) -> Vec<Dataset> {
        // (has job table, has status table) per index; BTreeMap keeps index order.
        let mut halves: BTreeMap<DatasetIndex, (bool, bool)> = BTreeMap::new();
        for table in tables {
            match self.prefix.classify(table) {
                Some((TableKind::Jobs, index)) => halves.entry(index).or_default().0 = true,
                Some((TableKind::JobStatus, index)) => halves.entry(index).or_default().1 = true,
                None => {}
            }
        }

        let mut datasets = Vec::with_capacity(halves.len());
        for (index, (jobs, status)) in halves {
            if jobs && status {
                datasets.push(Dataset::new(&self.prefix, index));
            } else {
                warn!(prefix = %self.prefix, %index, has_jobs = jobs, has_status = status, "skipping half-materialised dataset");
            }
        }
        datasets
    }

    /// Last dataset in the snapshot.
    pub fn tail(&self) -> Option<Dataset> {
        self.snapshot().last().cloned()
    }

    /// Tail dataset, refreshing once if the snapshot is empty.
    pub async fn tail_or_refresh(&self) -> Result<Option<Dataset>, StoreError> {
        if let Some(tail) = self.tail() {
            return Ok(Some(tail));
        }
        Ok(self.refresh().await?.last().cloned())
    }

    pub fn find(&self, index: &DatasetIndex) -> Option<Dataset> {
        let snapshot = self.snapshot();
        snapshot
            .binary_search_by(|dataset| dataset.index.cmp(index))
            .ok()
            .map(|position| snapshot[position].clone())
    }

    /// Dataset immediately after `index` in the snapshot.
    pub fn neighbour_after(&self, index: &DatasetIndex) -> Option<Dataset> {
        let snapshot = self.snapshot();
        let position = snapshot.partition_point(|dataset| dataset.index <= *index);
        snapshot.get(position).cloned()
    }

    /// Shared membership guard: the dataset set does not change while held.
    pub async fn pin_membership(&self) -> RwLockReadGuard<'_, ()> {
        self.membership.read().await
    }

    /// Exclusive membership guard for creating or dropping datasets.
    pub async fn lock_membership(&self) -> RwLockWriteGuard<'_, ()> {
        self.membership.write().await
    }

    /// Add a newly created dataset, keeping order.
    pub(crate) async fn insert(&self, dataset: Dataset) {
        let _updating = self.update_lock.lock().await;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.as_ref().clone();
        match next.binary_search_by(|existing| existing.index.cmp(&dataset.index)) {
            Ok(_) => return,
            Err(position) => next.insert(position, dataset),
        }
        *guard = Arc::new(next);
    }

    pub(crate) async fn remove(&self, index: &DatasetIndex) {
        let _updating = self.update_lock.lock().await;
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let next: Vec<Dataset> = guard.iter().filter(|dataset| dataset.index != *index).cloned().collect();
        *guard = Arc::new(next);
    }

    fn replace(&self, datasets: Arc<Vec<Dataset>>) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = datasets;
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, datasets: Vec<Dataset>) {
        self.replace(Arc::new(datasets));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;
    use crate::store::gated::GatedStore;
    use proptest::prelude::*;

    fn prefix() -> TablePrefix {
        TablePrefix::parse("tt").unwrap()
    }

    fn idx(s: &str) -> DatasetIndex {
        DatasetIndex::parse(s).unwrap()
    }

    fn catalog(store: &Arc<InMemoryBackingStore>) -> DatasetCatalog<InMemoryBackingStore> {
        DatasetCatalog::new(prefix(), Arc::clone(store), Duration::from_secs(5))
    }

    async fn create(store: &InMemoryBackingStore, indexes: &[&str]) {
        for index in indexes {
            store.create_dataset(&Dataset::new(&prefix(), idx(index))).await.unwrap();
        }
    }

    #[tokio::test]
    async fn cached_read_never_queries_store() {
        let store = Arc::new(InMemoryBackingStore::new());
        let catalog = catalog(&store);
        let seeded = vec![
            Dataset::new(&prefix(), idx("1")),
            Dataset::new(&prefix(), idx("2")),
        ];
        catalog.seed(seeded.clone());

        store.deny_queries(true);
        assert_eq!(catalog.get_ds_list(false).await.unwrap(), seeded);
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn refresh_sorts_and_reflects_store() {
        let store = Arc::new(InMemoryBackingStore::new());
        create(&store, &["2", "10", "1_1", "0_1", "1", "0_1_1"]).await;
        store.create_raw_table("unrelated_events");
        store.create_raw_table("other_jobs_1");

        let catalog = catalog(&store);
        let listed: Vec<String> = catalog
            .get_ds_list(true)
            .await
            .unwrap()
            .iter()
            .map(|ds| ds.index.to_string())
            .collect();
        assert_eq!(listed, ["0_1", "0_1_1", "1", "1_1", "2", "10"]);
        assert_eq!(catalog.snapshot().len(), 6);
    }

    #[tokio::test]
    async fn refresh_skips_half_materialised_datasets() {
        let store = Arc::new(InMemoryBackingStore::new());
        create(&store, &["1"]).await;
        store.create_raw_table("tt_jobs_2");
        store.create_raw_table("tt_job_status_3");

        let catalog = catalog(&store);
        let listed = catalog.get_ds_list(true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].index, idx("1"));
    }

    #[tokio::test]
    async fn refresh_drops_vanished_datasets() {
        let store = Arc::new(InMemoryBackingStore::new());
        create(&store, &["1", "2"]).await;
        let catalog = catalog(&store);
        assert_eq!(catalog.get_ds_list(true).await.unwrap().len(), 2);

        store.drop_dataset(&Dataset::new(&prefix(), idx("1"))).await.unwrap();
        let listed = catalog.get_ds_list(true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].index, idx("2"));
    }

    #[tokio::test]
    async fn navigation_helpers() {
        let store = Arc::new(InMemoryBackingStore::new());
        let catalog = catalog(&store);
        assert!(catalog.tail().is_none());

        catalog.seed(["0_1", "1", "1_1", "2"].iter().map(|s| Dataset::new(&prefix(), idx(s))).collect());
        assert_eq!(catalog.tail().unwrap().index, idx("2"));
        assert_eq!(catalog.neighbour_after(&idx("1")).unwrap().index, idx("1_1"));
        assert_eq!(catalog.neighbour_after(&idx("0_1")).unwrap().index, idx("1"));
        assert!(catalog.neighbour_after(&idx("2")).is_none());
        assert!(catalog.find(&idx("1_1")).is_some());
        assert!(catalog.find(&idx("3")).is_none());

        catalog.insert(Dataset::new(&prefix(), idx("1_2"))).await;
        assert_eq!(catalog.neighbour_after(&idx("1_1")).unwrap().index, idx("1_2"));
        catalog.remove(&idx("1_1")).await;
        assert_eq!(catalog.neighbour_after(&idx("1")).unwrap().index, idx("1_2"));
    }

    #[tokio::test]
    async fn tail_or_refresh_loads_empty_snapshot() {
        let store = Arc::new(InMemoryBackingStore::new());
        create(&store, &["1", "2"]).await;
        let catalog = catalog(&store);
        assert_eq!(catalog.tail_or_refresh().await.unwrap().unwrap().index, idx("2"));
        let queries = store.query_count();
        catalog.tail_or_refresh().await.unwrap();
        assert_eq!(store.query_count(), queries);
    }

    #[tokio::test]
    async fn allocator_vectors_list_in_order() {
        let store = Arc::new(InMemoryBackingStore::new());
        let indexes = [
            "1", "2", "3", "9", "10", "1_1", "1_2", "2_1", "2_2", "9_1", "0_1", "0_2", "0_1_1", "0_1_2", "0_2_1",
            "0_2_2",
        ];
        create(&store, &indexes).await;

        let catalog = catalog(&store);
        let listed: Vec<String> = catalog
            .get_ds_list(true)
            .await
            .unwrap()
            .iter()
            .map(|ds| ds.index.to_string())
            .collect();
        assert_eq!(
            listed,
            [
                "0_1", "0_1_1", "0_1_2", "0_2", "0_2_1", "0_2_2", "1", "1_1", "1_2", "2", "2_1", "2_2", "3", "9", "9_1",
                "10",
            ]
        );

        for index in indexes {
            let dataset = Dataset::new(&prefix(), idx(index));
            assert_eq!(prefix().classify(&dataset.job_table), Some((TableKind::Jobs, idx(index))));
            assert_eq!(
                prefix().classify(&dataset.job_status_table),
                Some((TableKind::JobStatus, idx(index)))
            );
        }
    }

    #[tokio::test]
    async fn insert_waits_for_in_flight_refresh() {
        let store = Arc::new(GatedStore::new());
        store.inner.create_dataset(&Dataset::new(&prefix(), idx("1"))).await.unwrap();
        let catalog = Arc::new(DatasetCatalog::new(prefix(), Arc::clone(&store), Duration::from_secs(5)));

        let (parked, release) = store.arm("list_tables");
        let refreshing = tokio::spawn({
            let catalog = Arc::clone(&catalog);
            async move { catalog.refresh().await }
        });
        parked.await.unwrap();

        // The parked refresh listed only "1".
        let created = Dataset::new(&prefix(), idx("2"));
        store.inner.create_dataset(&created).await.unwrap();
        let inserting = tokio::spawn({
            let catalog = Arc::clone(&catalog);
            async move { catalog.insert(created).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!inserting.is_finished());

        release.send(()).unwrap();
        refreshing.await.unwrap().unwrap();
        inserting.await.unwrap();

        let listed: Vec<String> = catalog.snapshot().iter().map(|ds| ds.index.to_string()).collect();
        assert_eq!(listed, ["1", "2"]);
    }

    #[tokio::test]
    async fn membership_lock_waits_for_pinned_writers() {
        let store = Arc::new(InMemoryBackingStore::new());
        let catalog = catalog(&store);

        let pinned = catalog.pin_membership().await;
        let second = catalog.pin_membership().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), catalog.lock_membership())
                .await
                .is_err()
        );

        drop(pinned);
        drop(second);
        let locked = tokio::time::timeout(Duration::from_millis(50), catalog.lock_membership()).await;
        assert!(locked.is_ok());
    }

    fn arb_index() -> impl Strategy<Value = DatasetIndex> {
        prop::collection::vec(0u64..50, 1..=4).prop_map(|mut segments| {
            if segments == [0] {
                segments.push(1);
            }
            DatasetIndex::from_segments(segments).unwrap()
        })
    }

    proptest! {
        #[test]
        fn table_names_round_trip_through_refresh(indexes in prop::collection::btree_set(arb_index(), 0..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let listed = runtime.block_on(async {
                let store = Arc::new(InMemoryBackingStore::new());
                for index in &indexes {
                    store.create_dataset(&Dataset::new(&prefix(), index.clone())).await.unwrap();
                }
                catalog(&store).get_ds_list(true).await.unwrap()
            });
            let got: Vec<DatasetIndex> = listed.into_iter().map(|ds| ds.index).collect();
            let expected: Vec<DatasetIndex> = indexes.into_iter().collect();
            prop_assert_eq!(got, expected);
        }
    }
}
