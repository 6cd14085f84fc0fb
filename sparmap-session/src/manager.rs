//! Process-wide session registry.
//!
//! Caches are keyed by backend URL and shared across sessions; sessions
//! live in an LRU map under a global memory ceiling. When a new build
//! would exceed the ceiling (or fails with an out-of-memory error), the
//! least-recently-touched idle session is evicted and the build retried.
//! Actively-building sessions are never evicted.

use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use sparmap_cache::GeomCache;

use crate::error::{Result, SessionError};
use crate::requestor::Requestor;

/// Session registry for one backend.
pub struct SessionManager {
    backend_url: String,
    cache_path: Option<PathBuf>,
    max_memory: u64,
    caches: Mutex<FxHashMap<String, Arc<GeomCache>>>,
    sessions: Mutex<LruCache<String, Arc<Requestor>>>,
}

impl SessionManager {
    pub fn new(backend_url: impl Into<String>, cache_path: Option<PathBuf>, max_memory: u64) -> Self {
        Self {
            backend_url: backend_url.into(),
            cache_path,
            max_memory,
            caches: Mutex::new(FxHashMap::default()),
            sessions: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Deterministic session id for a `(backend, query)` pair, so that
    /// resubmitting a query reuses its session.
    pub fn session_id(backend: &str, query: &str) -> String {
        let mut h = FxHasher::default();
        h.write(backend.as_bytes());
        h.write(query.as_bytes());
        format!("{:016x}", h.finish())
    }

    /// The shared cache for this manager's backend, building it (or
    /// loading it from disk) on first use.
    pub fn get_or_build_cache(&self) -> Result<Arc<GeomCache>> {
        let mut caches = self.caches.lock();
        if let Some(c) = caches.get(&self.backend_url) {
            return Ok(c.clone());
        }

        let cache = match self.cache_path.as_ref().filter(|p| p.exists()) {
            Some(path) => GeomCache::from_disk(&self.backend_url, self.max_memory, path)?,
            None => {
                let mut cache = GeomCache::new(&self.backend_url, self.max_memory)?;
                cache.build()?;
                cache
            }
        };

        let cache = Arc::new(cache);
        caches.insert(self.backend_url.clone(), cache.clone());
        Ok(cache)
    }

    /// Locate or build the session for `query`, returning its id and
    /// requestor ready for use.
    pub fn get_or_create_session(&self, query: &str) -> Result<(String, Arc<Requestor>)> {
        let sid = Self::session_id(&self.backend_url, query);

        let existing = self.sessions.lock().get(&sid).cloned();
        let requestor = match existing {
            Some(r) => r,
            None => {
                let cache = self.get_or_build_cache()?;
                let r = Arc::new(Requestor::new(cache, query, self.max_memory));
                self.sessions.lock().put(sid.clone(), r.clone());
                r
            }
        };

        loop {
            match requestor.request() {
                Ok(()) => break,
                Err(e) if e.is_out_of_memory() => {
                    tracing::warn!(session = %sid, "session build out of memory, evicting");
                    if !self.evict_one(&sid) {
                        self.sessions.lock().pop(&sid);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.sessions.lock().pop(&sid);
                    return Err(e);
                }
            }
        }

        self.enforce_ceiling(&sid);
        Ok((sid, requestor))
    }

    /// Touch and return a session.
    pub fn get_session(&self, sid: &str) -> Result<Arc<Requestor>> {
        self.sessions
            .lock()
            .get(sid)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(sid.to_string()))
    }

    /// Drop one session; `true` when it existed.
    pub fn clear_session(&self, sid: &str) -> bool {
        self.sessions.lock().pop(sid).is_some()
    }

    /// Drop every idle session.
    pub fn clear_all(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let keep: Vec<(String, Arc<Requestor>)> = sessions
            .iter()
            .filter(|(_, r)| r.is_building())
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let dropped = sessions.len() - keep.len();
        sessions.clear();
        for (k, r) in keep {
            sessions.put(k, r);
        }
        dropped
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Persist the backend's cache to the configured path.
    pub fn persist_cache(&self) -> Result<Option<PathBuf>> {
        let Some(path) = self.cache_path.clone() else {
            return Ok(None);
        };
        let cache = {
            let caches = self.caches.lock();
            caches.get(&self.backend_url).cloned()
        };
        match cache {
            Some(cache) => {
                cache.serialize_to_disk(&path)?;
                tracing::info!(path = %path.display(), "persisted geometry cache");
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    /// Bytes attributed to caches and built sessions.
    pub fn memory_usage(&self) -> u64 {
        let caches: u64 = self.caches.lock().values().map(|c| c.memory_usage()).sum();
        let sessions: u64 = self
            .sessions
            .lock()
            .iter()
            .map(|(_, r)| r.memory_usage())
            .sum();
        caches + sessions
    }

    /// Evict the least-recently-used idle session other than `keep`.
    fn evict_one(&self, keep: &str) -> bool {
        let mut sessions = self.sessions.lock();
        // iteration order is most-recent first; scan from the cold end
        let victim = sessions
            .iter()
            .rev()
            .find(|(k, r)| k.as_str() != keep && !r.is_building())
            .map(|(k, _)| k.clone());
        match victim {
            Some(k) => {
                tracing::info!(session = %k, "evicting session");
                sessions.pop(&k);
                true
            }
            None => false,
        }
    }

    /// Evict cold sessions until usage fits the ceiling.
    fn enforce_ceiling(&self, keep: &str) {
        if self.max_memory == 0 {
            return;
        }
        while self.memory_usage() > self.max_memory {
            if !self.evict_one(keep) {
                break;
            }
        }
    }

}
