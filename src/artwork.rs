//! Disk-backed artwork cache (posters, channel icons).
//!
//! [`KeyedLoadCoordinator`] downloads each file at most once at a time. Callers
//! asking for a file already being fetched wait on that download; the last
//! caller to give up aborts it. Downloaded files are tracked in a
//! [`BoundedCache`] whose eviction deletes the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::errors::ApiError;
use crate::lock;
use crate::lru_cache::BoundedCache;
use crate::transport::HttpTransport;

/// Cache key of an artwork URL: its last path segment without query or fragment.
pub fn artwork_key(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

type Outcome = Result<PathBuf, ApiError>;

struct PendingFetch {
    /// Distinguishes this fetch from later ones for the same key
    generation: u64,
    task: AbortHandle,
    waiters: Vec<(u64, oneshot::Sender<Outcome>)>,
}

struct LoaderState {
    files: BoundedCache<String, PathBuf>,
    pending: HashMap<String, PendingFetch>,
    next_waiter: u64,
    next_generation: u64,
}

struct Inner<T> {
    transport: Arc<T>,
    dir: PathBuf,
    state: Mutex<LoaderState>,
}

pub struct KeyedLoadCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for KeyedLoadCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn delete_evicted(key: String, path: PathBuf) {
    debug!(%key, "evicting artwork");
    let remove = move || {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to delete evicted artwork");
        }
    };
    // called with the loader lock held
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(remove);
        }
        Err(_) => remove(),
    }
}

impl<T: HttpTransport> KeyedLoadCoordinator<T> {
    /// Open the cache in `dir`, creating it if needed and registering files
    /// left from a previous run. Leftover partial downloads are deleted.
    pub fn open(transport: Arc<T>, dir: impl Into<PathBuf>, capacity: usize) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut files = BoundedCache::with_evict_hook(capacity, delete_evicted);
        let mut registered = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "part") {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.put(name.to_string(), path.clone());
                registered += 1;
            }
        }
        info!(dir = %dir.display(), registered, capacity, "artwork cache opened");

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                dir,
                state: Mutex::new(LoaderState {
                    files,
                    pending: HashMap::new(),
                    next_waiter: 0,
                    next_generation: 0,
                }),
            }),
        })
    }

    /// Local path of a cached file, promoting it.
    pub fn cached(&self, key: &str) -> Option<PathBuf> {
        lock(&self.inner.state).files.get(&key.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of downloads currently running.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Local path of the artwork at `url`, downloading it if needed.
    ///
    /// Dropping the returned future withdraws this caller; the download keeps
    /// going as long as someone else still waits for it.
    pub async fn get(&self, url: &str) -> Result<PathBuf, ApiError> {
        let key = artwork_key(url)
            .ok_or_else(|| ApiError::InvalidRequest(format!("no file name in {}", url)))?;

        let (id, rx) = {
            let mut state = lock(&self.inner.state);
            if let Some(path) = state.files.get(&key) {
                return Ok(path.clone());
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();

            if let Some(pending) = state.pending.get_mut(&key) {
                debug!(%key, "joining running download");
                pending.waiters.push((id, tx));
            } else {
                debug!(%key, url, "starting download");
                let generation = state.next_generation;
                state.next_generation += 1;
                let task = self.spawn_download(url.to_string(), key.clone(), generation);
                state.pending.insert(
                    key.clone(),
                    PendingFetch {
                        generation,
                        task,
                        waiters: vec![(id, tx)],
                    },
                );
            }
            (id, rx)
        };

        // once resolved the waiter is already gone and withdrawing is a no-op
        let _guard = WaiterGuard {
            inner: &*self.inner,
            key,
            id,
        };
        rx.await.map_err(|_| ApiError::Cancelled)?
    }

    fn spawn_download(&self, url: String, key: String, generation: u64) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let dest = inner.dir.join(&key);
            let result = inner.transport.download(&url, &dest).await;
            inner.complete(&key, generation, result.map(|_| dest).map_err(ApiError::from));
        });
        handle.abort_handle()
    }
}

impl<T> Inner<T> {
    /// Resolve the fetch `generation` of `key`. A completion from an aborted
    /// or superseded fetch is dropped.
    fn complete(&self, key: &str, generation: u64, outcome: Outcome) {
        let waiters = {
            let mut state = lock(&self.state);
            if !state
                .pending
                .get(key)
                .is_some_and(|p| p.generation == generation)
            {
                debug!(key, generation, "ignoring stale download completion");
                return;
            }
            if let Ok(path) = &outcome {
                state.files.put(key.to_string(), path.clone());
            }
            state
                .pending
                .remove(key)
                .map(|p| p.waiters)
                .unwrap_or_default()
        };

        match &outcome {
            Ok(_) => debug!(key, waiters = waiters.len(), "download finished"),
            Err(e) => warn!(key, waiters = waiters.len(), error = %e, "download failed"),
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn withdraw(&self, key: &str, id: u64) {
        let mut state = lock(&self.state);
        let Some(pending) = state.pending.get_mut(key) else {
            return;
        };
        let before = pending.waiters.len();
        pending.waiters.retain(|(waiter, _)| *waiter != id);
        if pending.waiters.len() < before && pending.waiters.is_empty() {
            if let Some(pending) = state.pending.remove(key) {
                debug!(key, "last waiter gone, aborting download");
                pending.task.abort();
            }
        }
    }
}

/// Withdraws a waiter whose `get` future is dropped before resolving.
struct WaiterGuard<'a, T> {
    inner: &'a Inner<T>,
    key: String,
    id: u64,
}

impl<T> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.withdraw(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn register(loader: &KeyedLoadCoordinator<MockTransport>, key: &str, generation: u64) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async {}).abort_handle();
        lock(&loader.inner.state).pending.insert(
            key.to_string(),
            PendingFetch {
                generation,
                task,
                waiters: vec![(0, tx)],
            },
        );
        rx
    }

    #[tokio::test]
    async fn test_stale_completion_leaves_newer_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = KeyedLoadCoordinator::open(Arc::new(MockTransport::new()), dir.path(), 2).unwrap();
        let path = dir.path().join("k.jpg");
        let mut rx = register(&loader, "k.jpg", 7);

        loader.inner.complete("k.jpg", 6, Ok(path.clone()));
        assert_eq!(loader.in_flight(), 1);
        assert!(loader.cached("k.jpg").is_none());
        assert!(rx.try_recv().is_err());

        loader.inner.complete("k.jpg", 7, Ok(path.clone()));
        assert_eq!(rx.try_recv().unwrap().unwrap(), path);
        assert_eq!(loader.in_flight(), 0);
        assert_eq!(loader.cached("k.jpg"), Some(path));
    }

    #[tokio::test]
    async fn test_withdrawing_unknown_waiter_keeps_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let loader = KeyedLoadCoordinator::open(Arc::new(MockTransport::new()), dir.path(), 2).unwrap();
        let _rx = register(&loader, "k.jpg", 0);

        loader.inner.withdraw("k.jpg", 99);
        assert_eq!(loader.in_flight(), 1);
        loader.inner.withdraw("k.jpg", 0);
        assert_eq!(loader.in_flight(), 0);
    }

    #[test]
    fn test_artwork_key() {
        assert_eq!(artwork_key("http://h/posters/a1.jpg").as_deref(), Some("a1.jpg"));
        assert_eq!(artwork_key("http://h/p/a1.jpg?size=2#x").as_deref(), Some("a1.jpg"));
        assert_eq!(artwork_key("http://h/p/"), None);
        assert_eq!(artwork_key("http://h/p/.."), None);
    }
}
