//! ProxySession cache for Streamable-HTTP backends.
//!
//! In-process map `(backend_id, principal_id) → session-id`, never
//! persisted. Initialization is single-flight per key: concurrent first
//! calls acquire a per-key async mutex, the winner runs the initialize
//! round-trip, losers find the stored session when the lock frees. Keys hold
//! ids only — no Backend or Principal references are retained.

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;

pub type SessionKey = (Uuid, Uuid);

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct SessionEntry {
    session_id: String,
    last_used: Instant,
}

pub struct SessionCache {
    entries: DashMap<SessionKey, SessionEntry>,
    /// Per-key initialization locks; the outer mutex only guards map
    /// bookkeeping and is never held across awaits on the init future.
    inflight: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
    capacity: usize,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Return the cached session for `key`, or run `init` to create one.
    /// At most one `init` runs per key at a time; concurrent callers await
    /// the winner and reuse its session.
    pub async fn get_or_init<F, Fut>(&self, key: SessionKey, init: F) -> Result<String, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        if let Some(session) = self.touch(&key) {
            return Ok(session);
        }

        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };

        let _guard = key_lock.lock().await;

        // The winner filled the cache while we waited on the lock.
        if let Some(session) = self.touch(&key) {
            self.release(&key, &key_lock).await;
            return Ok(session);
        }

        let result = init().await;
        if let Ok(session_id) = &result {
            self.insert(key, session_id.clone());
        }
        self.release(&key, &key_lock).await;
        result
    }

    /// Store (or replace) a session, evicting the least-recently-used entry
    /// past capacity.
    pub fn insert(&self, key: SessionKey, session_id: String) {
        self.entries.insert(
            key,
            SessionEntry {
                session_id,
                last_used: Instant::now(),
            },
        );
        if self.entries.len() > self.capacity {
            self.evict_lru();
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<String> {
        self.touch(key)
    }

    /// Drop one session — called on init failure or a session-expired signal
    /// from the backend; the next call re-initializes.
    pub fn evict(&self, key: &SessionKey) {
        self.entries.remove(key);
    }

    /// Drop every session bound to a backend — used when the backend's
    /// transport or URL changes, or it is deleted.
    pub fn evict_backend(&self, backend_id: Uuid) {
        self.entries.retain(|(b, _), _| *b != backend_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&self, key: &SessionKey) -> Option<String> {
        self.entries.get_mut(key).map(|mut entry| {
            entry.last_used = Instant::now();
            entry.session_id.clone()
        })
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_used)
            .map(|e| *e.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Drop the per-key lock entry once no other task holds a clone.
    async fn release(&self, key: &SessionKey, lock: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        // Two strong refs: the map's and ours. Anything more means another
        // waiter is still queued on this key.
        if Arc::strong_count(lock) <= 2 {
            inflight.remove(key);
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key() -> SessionKey {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_init_runs_once_for_single_caller() {
        let cache = SessionCache::new();
        let k = key();
        let session = cache
            .get_or_init(k, || async { Ok("S1".to_string()) })
            .await
            .unwrap();
        assert_eq!(session, "S1");
        assert_eq!(cache.get(&k), Some("S1".to_string()));
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrency() {
        let cache = Arc::new(SessionCache::new());
        let k = key();
        let init_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let count = init_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_init(k, || async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        // Hold the slot long enough for every loser to queue.
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("S1".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "S1");
        }
        assert_eq!(init_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_init_not_cached() {
        let cache = SessionCache::new();
        let k = key();
        let result = cache
            .get_or_init(k, || async { Err(AppError::UpstreamTimeout) })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.get(&k), None);

        // Next caller re-initializes.
        let session = cache
            .get_or_init(k, || async { Ok("S2".to_string()) })
            .await
            .unwrap();
        assert_eq!(session, "S2");
    }

    #[tokio::test]
    async fn test_evict_forces_reinit() {
        let cache = SessionCache::new();
        let k = key();
        cache.insert(k, "S1".into());
        cache.evict(&k);
        assert_eq!(cache.get(&k), None);
    }

    #[tokio::test]
    async fn test_evict_backend_clears_all_principals() {
        let cache = SessionCache::new();
        let backend = Uuid::new_v4();
        let other_backend = Uuid::new_v4();
        cache.insert((backend, Uuid::new_v4()), "a".into());
        cache.insert((backend, Uuid::new_v4()), "b".into());
        cache.insert((other_backend, Uuid::new_v4()), "c".into());

        cache.evict_backend(backend);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_past_capacity() {
        let cache = SessionCache::with_capacity(2);
        let k1 = key();
        let k2 = key();
        let k3 = key();
        cache.insert(k1, "1".into());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        cache.insert(k2, "2".into());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        // Touch k1 so k2 is the LRU victim.
        cache.get(&k1);
        cache.insert(k3, "3".into());

        assert!(cache.len() <= 2);
        assert_eq!(cache.get(&k2), None);
        assert_eq!(cache.get(&k1), Some("1".to_string()));
    }
}
