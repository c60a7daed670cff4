use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::db::Database;
use crate::models::{DayCollection, DayKey, IdentityKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Saved(DayKey),
    /// Every day was replaced during account recovery.
    Rebased { days: usize },
}

/// Authoritative local replica: one [`DayCollection`] per day plus the
/// sync and identity metadata. Cheap to clone; clones share the database.
/// Day writes are crate-private: they go through
/// [`crate::service::GlicoService`] or recovery, which keep the sync queue
/// in step.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            db: Arc::new(Mutex::new(db)),
            events,
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_db<R>(&self, f: impl FnOnce(&Database) -> Result<R>) -> Result<R> {
        f(&*self.db())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn load(&self, day: DayKey) -> Result<DayCollection> {
        self.db().load_day(day)
    }

    pub fn load_all(&self) -> Result<Vec<DayCollection>> {
        self.db().load_all_days()
    }

    pub fn load_range(&self, start: DayKey, end: DayKey) -> Result<Vec<DayCollection>> {
        self.db().load_day_range(start, end)
    }

    pub fn list_day_keys(&self) -> Result<Vec<DayKey>> {
        self.db().list_day_keys()
    }

    /// Load, modify and save one day while holding the database lock.
    pub(crate) fn update<R>(&self, day: DayKey, f: impl FnOnce(&mut DayCollection) -> R) -> Result<R> {
        let out = {
            let db = self.db();
            let mut collection = db.load_day(day)?;
            let out = f(&mut collection);
            db.save_day(&collection)?;
            out
        };
        let _ = self.events.send(StoreEvent::Saved(day));
        Ok(out)
    }

    pub(crate) fn rebase(&self, merged: &[DayCollection], identity: &IdentityKey) -> Result<()> {
        self.db().rebase(merged, identity)?;
        let _ = self.events.send(StoreEvent::Rebased { days: merged.len() });
        Ok(())
    }

    // --- Identity ---

    pub fn identity_key(&self) -> Result<IdentityKey> {
        self.db().get_or_create_identity_key()
    }

    pub fn stored_identity_key(&self) -> Result<Option<IdentityKey>> {
        self.db().get_identity_key()
    }

    // --- Sync metadata ---

    pub fn is_sync_enabled(&self) -> Result<bool> {
        self.db().is_sync_enabled()
    }

    pub(crate) fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        self.db().set_sync_enabled(enabled)
    }

    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.db().get_last_sync()
    }

    pub(crate) fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.db().set_last_sync(at)
    }

    // --- User settings ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.db().set_setting(key, value)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.db().get_setting(key)
    }
}
