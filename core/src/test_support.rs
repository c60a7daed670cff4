use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::docstore::DocumentStore;
use crate::models::{DayCollection, DayKey, IdentityKey, decode_document, encode_document};
use crate::remote::{RemoteDocument, RemoteError, RemoteStore};

/// Remote store double over an in-memory [`DocumentStore`], with switches
/// for failing calls and holding writes open.
pub struct MemoryRemoteStore {
    docs: Mutex<DocumentStore>,
    offline: AtomicBool,
    failing_paths: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub calls: AtomicUsize,
    pub write_attempts: AtomicUsize,
    pub writes: AtomicUsize,
    pub range_queries: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            docs: Mutex::new(DocumentStore::open_in_memory().unwrap()),
            offline: AtomicBool::new(false),
            failing_paths: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            range_queries: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_path(&self, path: &str) {
        self.failing_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string());
    }

    pub fn heal_path(&self, path: &str) {
        self.failing_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Park every write until [`Self::open_gate`] releases it.
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(sem.clone());
        sem
    }

    pub fn open_gate(&self) {
        if let Some(sem) = self.gate.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sem.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    pub fn seed(&self, key: &IdentityKey, collection: &DayCollection) {
        let body = encode_document(collection, chrono::Utc::now()).unwrap();
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(&key.day_path(collection.day), &body)
            .unwrap();
    }

    pub fn seed_raw(&self, path: &str, body: &[u8]) {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(path, body)
            .unwrap();
    }

    pub fn stored(&self, key: &IdentityKey, day: DayKey) -> Option<DayCollection> {
        let body = self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.day_path(day))
            .unwrap()?;
        Some(decode_document(day, &body).unwrap())
    }

    fn check(&self, path: &str) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("offline".to_string()));
        }
        if self
            .failing_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
        {
            return Err(RemoteError::Rejected {
                status: 503,
                message: format!("{path} unavailable"),
            });
        }
        Ok(())
    }

    fn internal(e: &anyhow::Error) -> RemoteError {
        RemoteError::Rejected {
            status: 400,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn exists(&self, namespace: &str) -> Result<bool, RemoteError> {
        self.check(namespace)?;
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .namespace_exists(namespace)
            .map_err(|e| Self::internal(&e))
    }

    async fn get_document(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        self.check(path)?;
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map_err(|e| Self::internal(&e))
    }

    async fn set_document(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sem) = gate {
            let _permit = sem.acquire().await;
        }

        let result = self.check(path).and_then(|()| {
            self.docs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(path, &body)
                .map_err(|e| Self::internal(&e))
        });
        if result.is_ok() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn range_query(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        self.range_queries.fetch_add(1, Ordering::SeqCst);
        self.check(collection)?;
        let docs = self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(collection, start, end)
            .map_err(|e| Self::internal(&e))?;
        Ok(docs
            .into_iter()
            .map(|(id, body)| RemoteDocument { id, body })
            .collect())
    }
}
