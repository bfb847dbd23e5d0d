//! LRU cache of in-flight and completed block fetches.
//!
//! At most one fetch is in flight per key within a cache. Evicted entries
//! that have not finished get a cancellation request; completed entries are
//! simply dropped.
use super::pool::{block_on, TaskPool};
use crate::{Error, Result};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};
use tokio::task::AbortHandle;

/// Handle to one block fetch. The result is shared, so any number of readers
/// can consume it.
pub(crate) struct BlockFuture {
    shared: Shared<BoxFuture<'static, Result<Bytes>>>,
    abort: AbortHandle,
    done: Arc<AtomicBool>,
}

impl BlockFuture {
    fn spawn(pool: &TaskPool, name: String, fetch: impl FnOnce() -> Result<Bytes> + Send + 'static) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = pool.spawn_blocking(move || {
            let result = fetch();
            flag.store(true, Ordering::Release);
            result
        });
        let abort = handle.abort_handle();
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(Error::unknown(name, anyhow::anyhow!(join_err))),
            }
        }
        .boxed()
        .shared();

        BlockFuture {
            shared,
            abort,
            done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn result(&self) -> Result<Bytes> {
        block_on(self.shared.clone())
    }
}

/// Ordered map of block futures with LRU eviction.
pub(crate) struct FutureCache<K: Eq + Hash + Clone> {
    entries: LruCache<K, BlockFuture>,
}

impl<K: Eq + Hash + Clone> FutureCache<K> {
    pub fn new() -> Self {
        FutureCache {
            entries: LruCache::unbounded(),
        }
    }

    /// Enqueue a fetch unless one is already present for the key; either way
    /// the key becomes most-recently-used.
    pub fn submit(
        &mut self,
        pool: &TaskPool,
        key: K,
        name: &str,
        fetch: impl FnOnce() -> Result<Bytes> + Send + 'static,
    ) {
        if self.entries.get(&key).is_some() {
            return;
        }
        self.entries
            .put(key, BlockFuture::spawn(pool, name.to_string(), fetch));
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Promote the key and block until its fetch completes.
    pub fn result(&mut self, key: &K) -> Option<Result<Bytes>> {
        self.entries.get(key).map(BlockFuture::result)
    }

    pub fn finished(&self) -> bool {
        self.entries.iter().all(|(_, future)| future.is_done())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Evict least-recently-used entries until at most `capacity` remain.
    pub fn cleanup(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            if let Some((_, future)) = self.entries.pop_lru() {
                if !future.is_done() {
                    future.cancel();
                }
            }
        }
    }

    /// Drop every entry, cancelling the ones still in flight.
    pub fn clear(&mut self) {
        self.cleanup(0);
    }

    fn remove_matching(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(future) = self.entries.pop(&key) {
                if !future.is_done() {
                    future.cancel();
                }
            }
        }
    }
}

/// Key of one block of one object in the process-wide cache.
pub(crate) type SharedBlockKey = (String, u64);

/// Process-wide block cache shared by [`ShareCacheReader`]s, refcounting the
/// objects that hold blocks in it.
///
/// [`ShareCacheReader`]: super::ShareCacheReader
pub(crate) struct SharedFutureCache {
    inner: Mutex<SharedInner>,
}

struct SharedInner {
    entries: FutureCache<SharedBlockKey>,
    references: HashMap<String, usize>,
}

impl SharedFutureCache {
    /// Look up (or create) the process-wide cache with the given name.
    pub fn named(cache_key: &str) -> Arc<SharedFutureCache> {
        static CACHES: OnceLock<scc::HashMap<String, Arc<SharedFutureCache>>> = OnceLock::new();
        let caches = CACHES.get_or_init(scc::HashMap::new);
        caches
            .entry(cache_key.to_string())
            .or_insert_with(|| {
                Arc::new(SharedFutureCache {
                    inner: Mutex::new(SharedInner {
                        entries: FutureCache::new(),
                        references: HashMap::new(),
                    }),
                })
            })
            .get()
            .clone()
    }

    pub fn register(&self, object: &str) {
        let mut inner = self.inner.lock();
        *inner.references.entry(object.to_string()).or_insert(0) += 1;
    }

    /// Drop one reference to the object; when the last holder unregisters,
    /// cancel any of its fetches that have not completed.
    pub fn unregister(&self, object: &str) {
        let mut inner = self.inner.lock();
        let gone = match inner.references.get_mut(object) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if gone {
            inner.references.remove(object);
            inner.entries.remove_matching(|(name, _)| name == object);
        }
    }

    pub fn submit(
        &self,
        pool: &TaskPool,
        key: SharedBlockKey,
        fetch: impl FnOnce() -> Result<Bytes> + Send + 'static,
    ) {
        let name = key.0.clone();
        self.inner.lock().entries.submit(pool, key, &name, fetch);
    }

    pub fn contains(&self, key: &SharedBlockKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn result(&self, key: &SharedBlockKey) -> Option<Result<Bytes>> {
        // take the future out of the lock before blocking on it
        let shared = {
            let mut inner = self.inner.lock();
            inner.entries.entries.get(key).map(|f| f.shared.clone())
        };
        shared.map(|fut| block_on(fut))
    }

    pub fn cleanup(&self, capacity: usize) {
        self.inner.lock().entries.cleanup(capacity);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn ready(data: &'static [u8]) -> impl FnOnce() -> Result<Bytes> + Send + 'static {
        move || Ok(Bytes::from_static(data))
    }

    #[test]
    fn submit_is_idempotent_per_key() {
        let pool = TaskPool::global();
        let mut cache = FutureCache::new();

        cache.submit(&pool, 0u64, "obj", ready(b"first"));
        cache.submit(&pool, 0u64, "obj", ready(b"second"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.result(&0).unwrap().unwrap().as_ref(), b"first");
    }

    #[test]
    fn cleanup_evicts_least_recently_used() {
        let pool = TaskPool::global();
        let mut cache = FutureCache::new();

        for index in 0u64..4 {
            cache.submit(&pool, index, "obj", ready(b"x"));
        }
        // touch block 0 so block 1 becomes the eviction candidate
        cache.result(&0).unwrap().unwrap();
        cache.cleanup(2);

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&0));
        assert!(cache.contains(&3));
        assert!(!cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn finished_reflects_outstanding_work() {
        let pool = TaskPool::global();
        let mut cache = FutureCache::new();

        cache.submit(&pool, 0u64, "obj", || {
            std::thread::sleep(Duration::from_millis(50));
            Ok(Bytes::from_static(b"slow"))
        });
        cache.result(&0).unwrap().unwrap();
        assert!(cache.finished());
    }

    #[test]
    fn errors_are_shared_with_every_consumer() {
        let pool = TaskPool::global();
        let mut cache = FutureCache::new();

        cache.submit(&pool, 7u64, "obj", || Err(Error::not_found("s3://b/k")));
        assert!(matches!(
            cache.result(&7).unwrap(),
            Err(Error::NotFound { .. })
        ));
        // a second consumer sees the same error
        assert!(matches!(
            cache.result(&7).unwrap(),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn unregister_cancels_only_the_orphaned_object() {
        let pool = TaskPool::global();
        let cache = SharedFutureCache::named("test-unregister");

        cache.register("a");
        cache.register("b");
        cache.submit(&pool, ("a".to_string(), 0), ready(b"aa"));
        cache.submit(&pool, ("b".to_string(), 0), ready(b"bb"));

        cache.unregister("a");
        assert!(!cache.contains(&("a".to_string(), 0)));
        assert_eq!(
            cache
                .result(&("b".to_string(), 0))
                .unwrap()
                .unwrap()
                .as_ref(),
            b"bb"
        );
    }
}
