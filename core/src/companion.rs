use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::local_store::LocalStore;
use crate::models::{DayCollection, DayKey, IdentityKey, decode_document};
use crate::remote::RemoteStore;

#[derive(Default)]
struct CompanionState {
    target: Option<IdentityKey>,
    cache: HashMap<(IdentityKey, DayKey), DayCollection>,
    order: VecDeque<(IdentityKey, DayKey)>,
}

impl CompanionState {
    fn insert(&mut self, key: IdentityKey, day: DayKey, collection: DayCollection, capacity: usize) {
        if self.target.as_ref() != Some(&key) {
            // Target changed while the remote read was in flight.
            return;
        }
        let slot = (key, day);
        if self.cache.insert(slot.clone(), collection).is_none() {
            self.order.push_back(slot);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
    }
}

/// Read-only view of another account's days, used to follow someone
/// else's log. With no target set every read goes to the local store.
pub struct CompanionAccessor {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    capacity: usize,
    state: Mutex<CompanionState>,
}

impl CompanionAccessor {
    #[must_use]
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, capacity: usize) -> Self {
        Self {
            store,
            remote,
            capacity: capacity.max(1),
            state: Mutex::new(CompanionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CompanionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Follow `key`, or go back to the local store with `None`. Pointing at
    /// this device's own key also means local. The cache is dropped either way.
    pub fn set_target(&self, key: Option<&str>) -> Result<Option<IdentityKey>> {
        let parsed = key.map(IdentityKey::parse).transpose()?;
        let target = match parsed {
            Some(key) if self.store.stored_identity_key()?.as_ref() == Some(&key) => {
                debug!("companion target is own key, reading locally");
                None
            }
            other => other,
        };
        let mut state = self.state();
        state.target = target.clone();
        state.cache.clear();
        state.order.clear();
        debug!(key = ?target.as_ref().map(IdentityKey::formatted), "companion target set");
        Ok(target)
    }

    #[must_use]
    pub fn target(&self) -> Option<IdentityKey> {
        self.state().target.clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state().target.is_some()
    }

    /// Fails with [`SyncError::ReadOnlyMode`] while a companion target is set.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_active() {
            return Err(SyncError::ReadOnlyMode);
        }
        Ok(())
    }

    pub async fn load(&self, day: DayKey) -> Result<DayCollection> {
        let key = {
            let state = self.state();
            let Some(key) = state.target.clone() else {
                drop(state);
                return Ok(self.store.load(day)?);
            };
            if let Some(hit) = state.cache.get(&(key.clone(), day)) {
                return Ok(hit.clone());
            }
            key
        };

        let collection = match self.remote.get_document(&key.day_path(day)).await? {
            Some(body) => decode_or_empty(day, &body),
            None => DayCollection::empty(day),
        };
        self.state()
            .insert(key, day, collection.clone(), self.capacity);
        Ok(collection)
    }

    /// Non-empty days in `[start, end]`. In companion mode this is one
    /// remote range read, and every day in the range lands in the cache.
    pub async fn load_range(&self, start: DayKey, end: DayKey) -> Result<Vec<DayCollection>> {
        let Some(key) = self.target() else {
            return Ok(self.store.load_range(start, end)?);
        };

        let docs = self
            .remote
            .range_query(&key.collection(), &start.to_string(), &end.to_string())
            .await?;
        let mut found = BTreeMap::new();
        for doc in docs {
            match doc.id.parse::<DayKey>() {
                Ok(day) => {
                    found.insert(day, decode_or_empty(day, &doc.body));
                }
                Err(e) => warn!(id = %doc.id, error = %e, "ignoring remote document with bad id"),
            }
        }

        let mut state = self.state();
        for day in start.through(end) {
            let collection = found
                .get(&day)
                .cloned()
                .unwrap_or_else(|| DayCollection::empty(day));
            state.insert(key.clone(), day, collection, self.capacity);
        }
        Ok(found.into_values().filter(|c| !c.is_empty()).collect())
    }
}

fn decode_or_empty(day: DayKey, body: &[u8]) -> DayCollection {
    decode_document(day, body).unwrap_or_else(|e| {
        warn!(%day, error = %e, "corrupt companion day, showing it empty");
        DayCollection::empty(day)
    })
}
