//! Account recovery: adopt another identity key and fold that account's
//! remote history into the local replica.
//!
//! Nothing local changes until the merged result is ready. Clearing the old
//! days, saving the merged ones and storing the new key commit as a single
//! SQLite transaction, so a failure at any point leaves the store as it was.

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::local_store::LocalStore;
use crate::merge::{merge_replicas, validate_merged};
use crate::models::{DayCollection, DayKey, IdentityKey, decode_document};
use crate::sync::{DrainOutcome, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Idle,
    Validating,
    FetchingRemote,
    FetchingLocal,
    Merging,
    Clearing,
    Saving,
    Rekeying,
    Resyncing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub identity_key: String,
    pub remote_days: usize,
    pub local_days: usize,
    pub merged_days: usize,
    /// Remote documents that could not be decoded and were left out.
    pub skipped_remote: usize,
    pub resync: DrainOutcome,
}

pub struct RecoveryOrchestrator {
    store: LocalStore,
    engine: SyncEngine,
    phase: watch::Sender<RecoveryPhase>,
    running: Mutex<()>,
    #[cfg(test)]
    trail: std::sync::Mutex<Vec<RecoveryPhase>>,
}

impl RecoveryOrchestrator {
    #[must_use]
    pub fn new(store: LocalStore, engine: SyncEngine) -> Self {
        let (phase, _) = watch::channel(RecoveryPhase::Idle);
        Self {
            store,
            engine,
            phase,
            running: Mutex::new(()),
            #[cfg(test)]
            trail: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryPhase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.borrow()
    }

    fn enter(&self, phase: RecoveryPhase) {
        debug!(?phase, "recovery phase");
        #[cfg(test)]
        self.trail
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(phase);
        self.phase.send_replace(phase);
    }

    /// Switch this device to `candidate` and merge that account's history
    /// with the local one. Only one recovery runs at a time.
    pub async fn recover(&self, candidate: &str) -> Result<RecoveryReport> {
        let _running = self.running.lock().await;
        let result = self.run(candidate).await;
        match &result {
            Ok(report) => {
                info!(
                    key = %report.identity_key,
                    merged = report.merged_days,
                    "recovery complete"
                );
                self.enter(RecoveryPhase::Done);
            }
            Err(e) => {
                warn!(error = %e, "recovery failed");
                self.enter(RecoveryPhase::Failed);
            }
        }
        result
    }

    async fn run(&self, candidate: &str) -> Result<RecoveryReport> {
        self.enter(RecoveryPhase::Validating);
        let key = IdentityKey::parse(candidate)?;
        if self.store.stored_identity_key()?.as_ref() == Some(&key) {
            return Err(SyncError::InvalidKey(format!(
                "{} is already this device's key",
                key.formatted()
            )));
        }
        let remote = self.engine.remote();
        if !remote.exists(&key.namespace()).await? {
            return Err(SyncError::InvalidKey(format!(
                "no account found for {}",
                key.formatted()
            )));
        }

        self.enter(RecoveryPhase::FetchingRemote);
        let today = DayKey::today();
        let start = today.years_before(self.engine.options().recovery_lookback_years);
        let end = today.days_after(1);
        let docs = remote
            .range_query(&key.collection(), &start.to_string(), &end.to_string())
            .await?;
        let mut remote_days = Vec::with_capacity(docs.len());
        let mut skipped_remote = 0;
        for doc in docs {
            let day = match doc.id.parse::<DayKey>() {
                Ok(day) => day,
                Err(e) => {
                    warn!(id = %doc.id, error = %e, "skipping remote document with bad id");
                    skipped_remote += 1;
                    continue;
                }
            };
            match decode_document(day, &doc.body) {
                Ok(collection) => remote_days.push(collection),
                Err(e) => {
                    warn!(%day, error = %e, "skipping corrupt remote day");
                    skipped_remote += 1;
                }
            }
        }
        let remote_count = remote_days.len();

        self.enter(RecoveryPhase::FetchingLocal);
        let local = self.store.load_all()?;
        let local_count = local.len();

        self.enter(RecoveryPhase::Merging);
        let merged = merge_replicas(remote_days, local);
        validate_merged(&merged)?;
        let merged: Vec<DayCollection> = merged
            .into_values()
            .filter(|c| !c.is_empty())
            .collect();

        {
            // No drain may read the old identity halfway through the swap.
            let _flight = self.engine.hold().await;
            // Clearing, saving and rekeying commit together in `rebase`.
            self.enter(RecoveryPhase::Clearing);
            self.enter(RecoveryPhase::Saving);
            self.store.rebase(&merged, &key)?;
            self.enter(RecoveryPhase::Rekeying);
        }

        self.enter(RecoveryPhase::Resyncing);
        let resync = self.engine.enable().await?;

        Ok(RecoveryReport {
            identity_key: key.formatted(),
            remote_days: remote_count,
            local_days: local_count,
            merged_days: merged.len(),
            skipped_remote,
            resync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GlucoseEntry;
    use crate::sync::SyncOptions;
    use crate::test_support::MemoryRemoteStore;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    const OTHER: &str = "K7M2Q9XA";

    fn at(day: DayKey, hour: u32) -> DateTime<Utc> {
        day.date().and_hms_opt(hour, 0, 0).unwrap().and_utc()
    }

    fn glucose(id: &str, value: i64, ts: DateTime<Utc>) -> GlucoseEntry {
        GlucoseEntry {
            id: id.to_string(),
            value,
            timestamp: ts,
        }
    }

    struct Fixture {
        store: LocalStore,
        remote: Arc<MemoryRemoteStore>,
        engine: SyncEngine,
        recovery: RecoveryOrchestrator,
        other: IdentityKey,
    }

    fn fixture() -> Fixture {
        let store = LocalStore::open_in_memory().unwrap();
        store.identity_key().unwrap();
        let remote = MemoryRemoteStore::new();
        let engine = SyncEngine::new(store.clone(), remote.clone(), SyncOptions::default()).unwrap();
        let recovery = RecoveryOrchestrator::new(store.clone(), engine.clone());
        Fixture {
            store,
            remote,
            engine,
            recovery,
            other: IdentityKey::parse(OTHER).unwrap(),
        }
    }

    fn seed_other(f: &Fixture, day: DayKey, entries: Vec<GlucoseEntry>) {
        let mut collection = DayCollection::empty(day);
        for e in entries {
            collection.upsert_glucose(e);
        }
        f.remote.seed(&f.other, &collection);
    }

    fn snapshot(store: &LocalStore) -> (Vec<DayCollection>, Option<IdentityKey>, bool) {
        (
            store.load_all().unwrap(),
            store.stored_identity_key().unwrap(),
            store.is_sync_enabled().unwrap(),
        )
    }

    #[tokio::test]
    async fn own_key_is_rejected_without_touching_remote() {
        let f = fixture();
        let own = f.store.identity_key().unwrap();
        let typed = own.formatted().to_lowercase();

        let err = f.recovery.recover(&typed).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)));
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.remote.range_queries.load(Ordering::SeqCst), 0);
        assert_eq!(f.recovery.phase(), RecoveryPhase::Failed);
    }

    #[tokio::test]
    async fn malformed_key_is_rejected() {
        let f = fixture();
        let err = f.recovery.recover("ABC").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)));
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected_before_fetching() {
        let f = fixture();
        let err = f.recovery.recover(OTHER).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)));
        assert_eq!(f.remote.range_queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovery_merges_and_adopts_key() {
        let f = fixture();
        let shared = DayKey::today().days_before(3);
        let remote_only = DayKey::today().days_before(10);
        let local_only = DayKey::today().days_before(1);

        f.store
            .update(shared, |c| c.upsert_glucose(glucose("g1", 110, at(shared, 9))))
            .unwrap();
        f.store
            .update(local_only, |c| c.set_notes(Some("new sensor".into())))
            .unwrap();
        f.store.set_setting("theme", "dark").unwrap();
        seed_other(
            &f,
            shared,
            vec![glucose("r1", 105, at(shared, 9)), glucose("g2", 180, at(shared, 12))],
        );
        seed_other(&f, remote_only, vec![glucose("r2", 95, at(remote_only, 7))]);

        let mut phases = f.recovery.subscribe();
        let report = f.recovery.recover(&OTHER.to_lowercase()).await.unwrap();

        assert_eq!(report.identity_key, "K7M2-Q9XA");
        assert_eq!(report.remote_days, 2);
        assert_eq!(report.local_days, 2);
        assert_eq!(report.merged_days, 3);
        assert_eq!(report.resync, DrainOutcome::Completed { pushed: 3, pruned: 0 });
        assert_eq!(*phases.borrow_and_update(), RecoveryPhase::Done);
        assert_eq!(
            *f.recovery.trail.lock().unwrap(),
            [
                RecoveryPhase::Validating,
                RecoveryPhase::FetchingRemote,
                RecoveryPhase::FetchingLocal,
                RecoveryPhase::Merging,
                RecoveryPhase::Clearing,
                RecoveryPhase::Saving,
                RecoveryPhase::Rekeying,
                RecoveryPhase::Resyncing,
                RecoveryPhase::Done,
            ]
        );

        let merged = f.store.load(shared).unwrap();
        let ids: Vec<&str> = merged.glucose_entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["g1", "g2"]);
        assert_eq!(f.store.stored_identity_key().unwrap(), Some(f.other.clone()));
        assert!(f.store.is_sync_enabled().unwrap());
        assert!(f.engine.is_enabled());
        assert_eq!(f.store.get_setting("theme").unwrap().as_deref(), Some("dark"));

        assert_eq!(f.remote.stored(&f.other, shared).unwrap(), merged);
        assert!(f.remote.stored(&f.other, local_only).is_some());
        f.engine.disable().unwrap();
    }

    #[tokio::test]
    async fn fetch_failure_leaves_local_store_untouched() {
        let f = fixture();
        let day = DayKey::today().days_before(2);
        f.store
            .update(day, |c| c.upsert_glucose(glucose("g1", 110, at(day, 9))))
            .unwrap();
        seed_other(&f, day, vec![glucose("r1", 95, at(day, 7))]);
        let before = snapshot(&f.store);

        f.remote.fail_path(&f.other.collection());
        let err = f.recovery.recover(OTHER).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(snapshot(&f.store), before);
        assert_eq!(f.recovery.phase(), RecoveryPhase::Failed);
    }

    #[tokio::test]
    async fn failed_save_rolls_back() {
        let f = fixture();
        let kept = DayKey::today().days_before(2);
        let poisoned = DayKey::today().days_before(5);
        f.store
            .update(kept, |c| c.upsert_glucose(glucose("g1", 110, at(kept, 9))))
            .unwrap();
        seed_other(&f, poisoned, vec![glucose("r1", 95, at(poisoned, 7))]);
        let before = snapshot(&f.store);

        let trigger = format!(
            "CREATE TRIGGER reject_day BEFORE INSERT ON day_collections
             WHEN NEW.day = '{poisoned}'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;"
        );
        f.store.with_db(|db| db.execute_batch(&trigger)).unwrap();

        let err = f.recovery.recover(OTHER).await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(snapshot(&f.store), before);
    }

    #[tokio::test]
    async fn corrupt_and_out_of_range_remote_days_are_skipped() {
        let f = fixture();
        let good = DayKey::today().days_before(4);
        let ancient = DayKey::today().years_before(3);
        seed_other(&f, good, vec![glucose("r1", 95, at(good, 7))]);
        seed_other(&f, ancient, vec![glucose("r0", 90, at(ancient, 7))]);
        f.remote
            .seed_raw(&f.other.day_path(DayKey::today().days_before(6)), b"not json");

        let report = f.recovery.recover(OTHER).await.unwrap();
        assert_eq!(report.remote_days, 1);
        assert_eq!(report.skipped_remote, 1);
        assert!(f.store.load(ancient).unwrap().is_empty());
        assert!(!f.store.load(good).unwrap().is_empty());
        f.engine.disable().unwrap();
    }

    #[tokio::test]
    async fn resync_failure_still_completes_recovery() {
        let f = fixture();
        let day = DayKey::today().days_before(2);
        f.store
            .update(day, |c| c.upsert_glucose(glucose("g1", 110, at(day, 9))))
            .unwrap();
        let older = DayKey::today().days_before(8);
        seed_other(&f, older, vec![glucose("r1", 95, at(older, 7))]);
        f.remote.fail_path(&f.other.day_path(day));

        let report = f.recovery.recover(OTHER).await.unwrap();
        assert!(matches!(
            report.resync,
            DrainOutcome::Stopped { retryable: true, .. }
        ));
        assert_eq!(f.recovery.phase(), RecoveryPhase::Done);
        assert_eq!(f.store.stored_identity_key().unwrap(), Some(f.other.clone()));
        assert!(f.engine.status().unwrap().pending.contains(&day));
        f.engine.disable().unwrap();
    }
}
