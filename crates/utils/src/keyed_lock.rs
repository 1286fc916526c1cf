//! Per-key async lock whose entries disappear once nobody holds or waits on them

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Guard returned by [`KeyedAsyncLock::lock`].
///
/// Dropping it releases the key. If no other task is waiting on the same key,
/// the map entry is removed as well.
pub struct KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K> KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    /// Key this guard holds.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedLockGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only `self.mutex` is left: no holder and no waiter.
        if Arc::strong_count(&self.mutex) == 1 {
            self.locks
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

/// Serializes async work per key while letting distinct keys run in parallel.
///
/// ```rust,ignore
/// let locks = KeyedAsyncLock::<(String, String)>::new();
/// let _guard = locks.lock(&("recipe".into(), "model".into())).await;
/// // only one task at a time gets here for this recipe/model pair
/// ```
pub struct KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    locks: LockMap<K>,
}

impl<K> KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Waits until `key` is free and takes it.
    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).lock_owned().await;
        KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Takes `key` only if it is free right now.
    pub fn try_lock(&self, key: &K) -> Option<KeyedLockGuard<K>> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).try_lock_owned().ok()?;
        Some(KeyedLockGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(Mutex::new(()));
                    occupied.insert(Arc::downgrade(&mutex));
                    mutex
                }
            },
            Entry::Vacant(vacant) => {
                let mutex = Arc::new(Mutex::new(()));
                vacant.insert(Arc::downgrade(&mutex));
                mutex
            }
        }
    }
}

impl<K> Default for KeyedAsyncLock<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tokio::time::sleep;

    use super::*;

    fn pair(recipe: &str, model: &str) -> (String, String) {
        (recipe.to_string(), model.to_string())
    }

    #[tokio::test]
    async fn same_pair_is_serialized() {
        let locks = Arc::new(KeyedAsyncLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&pair("chatbot", "granite")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn distinct_pairs_do_not_block_each_other() {
        let locks = KeyedAsyncLock::new();
        let _first = locks.lock(&pair("chatbot", "granite")).await;
        let second = locks.try_lock(&pair("chatbot", "mistral"));
        assert!(second.is_some());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let locks = KeyedAsyncLock::new();
        let guard = locks.lock(&pair("summarizer", "granite")).await;
        assert!(locks.try_lock(&pair("summarizer", "granite")).is_none());
        drop(guard);
        assert!(locks.try_lock(&pair("summarizer", "granite")).is_some());
    }

    #[tokio::test]
    async fn entry_removed_after_last_guard() {
        let locks = KeyedAsyncLock::new();
        {
            let guard = locks.lock(&7u32).await;
            assert_eq!(guard.key(), &7);
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
