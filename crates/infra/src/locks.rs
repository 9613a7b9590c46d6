//! Per-key async locks.
//!
//! The map of locks sits behind a coarse mutex that is held only while a key's
//! entry is looked up or inserted; it is released before the per-key lock is
//! awaited, so waiting on one key never blocks other keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = locks.get(key) {
            return Arc::clone(existing);
        }
        let created = Arc::new(AsyncMutex::new(()));
        locks.insert(key.clone(), Arc::clone(&created));
        created
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Lock several keys in ascending order.
    ///
    /// Duplicate keys are locked once.
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = K>) -> Vec<OwnedMutexGuard<()>>
    where
        K: Ord,
    {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Forget `key`. A holder of its lock keeps it until released.
    pub fn remove(&self, key: &K) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let guard = locks.lock(&1).await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock(&1).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(&1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&2)).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entries_are_reused() {
        let locks = KeyedLocks::<&'static str>::new();
        drop(locks.lock(&"a").await);
        drop(locks.lock(&"a").await);
        assert_eq!(locks.len(), 1);
        locks.remove(&"a");
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn lock_all_dedups_keys() {
        let locks = KeyedLocks::<u32>::new();
        let guards = locks.lock_all([3, 1, 3, 2]).await;
        assert_eq!(guards.len(), 3);
    }
}
