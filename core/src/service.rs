use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::companion::CompanionAccessor;
use crate::error::{Result, SyncError};
use crate::local_store::{LocalStore, StoreEvent};
use crate::models::{
    BasalEntry, DayCollection, DayKey, DoseEntry, EntryKind, GlucoseEntry, IdentityKey,
    MealCategory,
};
use crate::recovery::{RecoveryOrchestrator, RecoveryReport};
use crate::remote::RemoteStore;
use crate::sync::{DrainOutcome, SyncEngine, SyncEvent, SyncOptions, SyncStatus};

/// Entry point for callers: every mutation lands in the local store first
/// and is then queued for upload when sync is enabled.
pub struct GlicoService {
    store: LocalStore,
    engine: SyncEngine,
    companion: CompanionAccessor,
    recovery: RecoveryOrchestrator,
}

impl GlicoService {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteStore>, options: SyncOptions) -> Result<Self> {
        let capacity = options.companion_cache_capacity;
        let engine = SyncEngine::new(store.clone(), remote.clone(), options)?;
        Ok(Self {
            companion: CompanionAccessor::new(store.clone(), remote, capacity),
            recovery: RecoveryOrchestrator::new(store.clone(), engine.clone()),
            store,
            engine,
        })
    }

    pub fn open(db_path: &Path, remote: Arc<dyn RemoteStore>, options: SyncOptions) -> Result<Self> {
        Self::new(LocalStore::open(db_path)?, remote, options)
    }

    #[must_use]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryOrchestrator {
        &self.recovery
    }

    fn mutate<R>(&self, day: DayKey, f: impl FnOnce(&mut DayCollection) -> R) -> Result<R> {
        self.companion.ensure_writable()?;
        let out = self.store.update(day, f)?;
        self.engine.enqueue(day);
        Ok(out)
    }

    // --- Mutations ---

    /// Insulin amounts must be positive and finite. A NaN would serialize as
    /// `null` and make the whole stored day unreadable.
    fn check_units(units: f64) -> Result<()> {
        if units.is_finite() && units > 0.0 {
            Ok(())
        } else {
            Err(SyncError::InvalidEntry(format!(
                "insulin units must be a positive number, got {units}"
            )))
        }
    }

    pub fn add_glucose_entry(&self, day: DayKey, value: i64, at: DateTime<Utc>) -> Result<GlucoseEntry> {
        let entry = GlucoseEntry::new(value, at);
        self.mutate(day, |c| c.upsert_glucose(entry.clone()))?;
        Ok(entry)
    }

    pub fn add_dose_entry(
        &self,
        day: DayKey,
        units: f64,
        meal_category: MealCategory,
        at: DateTime<Utc>,
    ) -> Result<DoseEntry> {
        Self::check_units(units)?;
        let entry = DoseEntry::new(units, meal_category, at);
        self.mutate(day, |c| c.upsert_dose(entry.clone()))?;
        Ok(entry)
    }

    /// Set the day's basal dose, replacing any existing one.
    pub fn set_basal_entry(&self, day: DayKey, units: f64, at: DateTime<Utc>) -> Result<BasalEntry> {
        Self::check_units(units)?;
        let entry = BasalEntry::new(units, at);
        self.mutate(day, |c| c.set_basal(entry.clone()))?;
        Ok(entry)
    }

    pub fn can_add_basal(&self, day: DayKey) -> Result<bool> {
        Ok(self.store.load(day)?.can_add_basal())
    }

    /// Move an entry to a new instant. `None` when no entry has that id.
    pub fn update_entry_time(
        &self,
        day: DayKey,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EntryKind>> {
        self.mutate(day, |c| c.move_entry(id, at))
    }

    pub fn remove_entry(&self, day: DayKey, id: &str) -> Result<Option<EntryKind>> {
        self.mutate(day, |c| c.remove_entry(id))
    }

    /// Blank notes clear the field.
    pub fn update_notes(&self, day: DayKey, notes: Option<String>) -> Result<()> {
        self.mutate(day, |c| c.set_notes(notes))
    }

    // --- Reads ---

    /// One day, from the companion's account when a target is set.
    pub async fn load_day(&self, day: DayKey) -> Result<DayCollection> {
        self.companion.load(day).await
    }

    pub async fn load_range(&self, start: DayKey, end: DayKey) -> Result<Vec<DayCollection>> {
        self.companion.load_range(start, end).await
    }

    pub fn identity_key(&self) -> Result<IdentityKey> {
        Ok(self.store.identity_key()?)
    }

    // --- Companion ---

    pub fn set_companion_target(&self, key: Option<&str>) -> Result<Option<IdentityKey>> {
        self.companion.set_target(key)
    }

    #[must_use]
    pub fn companion_target(&self) -> Option<IdentityKey> {
        self.companion.target()
    }

    // --- Sync ---

    pub async fn enable_sync(&self) -> Result<DrainOutcome> {
        self.engine.enable().await
    }

    pub fn disable_sync(&self) -> Result<()> {
        self.engine.disable()
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.status()
    }

    /// Wait for queued days to go out. Skipped while sync is disabled.
    pub async fn flush(&self) -> Option<DrainOutcome> {
        if !self.engine.is_enabled() {
            return None;
        }
        Some(self.engine.flush().await)
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn subscribe_store(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    // --- Recovery ---

    pub async fn recover(&self, candidate: &str) -> Result<RecoveryReport> {
        let report = self.recovery.recover(candidate).await?;
        // The device's own key changed; re-resolve any companion target against it.
        if let Some(target) = self.companion.target() {
            self.companion.set_target(Some(target.as_str()))?;
        }
        Ok(report)
    }
}
