use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex as FlightLock, MutexGuard as FlightGuard, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::local_store::LocalStore;
use crate::models::{DayKey, IdentityKey, encode_document};
use crate::remote::RemoteStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How often the background timer retries a non-empty queue.
    pub retry_interval: Duration,
    /// How far back recovery reads the candidate's remote replica.
    pub recovery_lookback_years: u32,
    /// Days kept by the companion cache before the oldest are evicted.
    pub companion_cache_capacity: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            recovery_lookback_years: 2,
            companion_cache_capacity: 366,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Syncing,
    Pending,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub pending: Vec<DayKey>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub identity_key: Option<String>,
    pub syncing: bool,
    pub state: SyncState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Pushed(DayKey),
    Pruned(DayKey),
    Failed { day: Option<DayKey>, error: String },
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Another drain held the flight lock.
    Skipped,
    Completed {
        pushed: usize,
        pruned: usize,
    },
    /// Stopped at the first failure; `failed_day` and everything after it
    /// are still queued.
    Stopped {
        pushed: usize,
        pruned: usize,
        failed_day: Option<DayKey>,
        error: String,
        retryable: bool,
    },
}

/// Durable, ordered set of days with unsynced local changes.
pub(crate) struct SyncQueue {
    store: LocalStore,
}

impl SyncQueue {
    pub(crate) fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub(crate) fn pending(&self) -> anyhow::Result<Vec<DayKey>> {
        self.store.with_db(|db| db.load_pending_queue())
    }

    pub(crate) fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.pending()?.is_empty())
    }

    /// Returns false when the day was already queued.
    pub(crate) fn push(&self, day: DayKey) -> anyhow::Result<bool> {
        self.store.with_db(|db| {
            let mut days = db.load_pending_queue()?;
            if days.contains(&day) {
                return Ok(false);
            }
            days.push(day);
            db.save_pending_queue(&days)?;
            Ok(true)
        })
    }

    pub(crate) fn remove(&self, day: DayKey) -> anyhow::Result<bool> {
        self.store.with_db(|db| {
            let mut days = db.load_pending_queue()?;
            let before = days.len();
            days.retain(|d| *d != day);
            if days.len() == before {
                return Ok(false);
            }
            db.save_pending_queue(&days)?;
            Ok(true)
        })
    }
}

/// Day currently being pushed, and whether it was written to meanwhile.
#[derive(Default)]
struct InFlight {
    day: Option<DayKey>,
    redirtied: bool,
}

#[derive(Debug, Clone, Copy)]
enum PushStep {
    Pushed,
    Pruned,
}

#[derive(Default)]
struct Tally {
    pushed: usize,
    pruned: usize,
}

struct Inner {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    queue: SyncQueue,
    options: SyncOptions,
    enabled: AtomicBool,
    flight: FlightLock<()>,
    in_flight: Mutex<InFlight>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self
            .retry_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Pushes locally changed days to the remote replica.
///
/// At most one drain runs at a time and remote writes are strictly
/// sequential. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        options: SyncOptions,
    ) -> Result<Self> {
        let enabled = store.is_sync_enabled()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                queue: SyncQueue::new(store.clone()),
                store,
                remote,
                options,
                enabled: AtomicBool::new(enabled),
                flight: FlightLock::new(()),
                in_flight: Mutex::new(InFlight::default()),
                retry_task: Mutex::new(None),
                events,
            }),
        })
    }

    #[must_use]
    pub fn options(&self) -> &SyncOptions {
        &self.inner.options
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// True while a drain or force-sync holds the flight lock.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.flight.try_lock().is_err()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Queue `day` for upload and kick off a drain in the background.
    /// Does nothing while sync is disabled. Never fails: storage problems
    /// are logged and the next write or timer tick tries again.
    pub fn enqueue(&self, day: DayKey) {
        if !self.is_enabled() {
            debug!(%day, "sync disabled, not queueing");
            return;
        }
        {
            // Held across the push so a finishing push_day cannot drop the day
            // between seeing it clean and removing it.
            let mut flight = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if flight.day == Some(day) {
                flight.redirtied = true;
            }
            if let Err(e) = self.inner.queue.push(day) {
                warn!(%day, error = %e, "failed to persist sync queue");
                return;
            }
        }
        self.spawn_drain();
    }

    fn spawn_drain(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = self.clone();
            handle.spawn(async move {
                engine.drain().await;
            });
        }
    }

    /// Push every queued day in order. Returns [`DrainOutcome::Skipped`]
    /// immediately if another drain is running.
    pub async fn drain(&self) -> DrainOutcome {
        let Ok(_flight) = self.inner.flight.try_lock() else {
            debug!("drain already in flight");
            return DrainOutcome::Skipped;
        };
        self.drain_locked().await
    }

    /// Like [`Self::drain`], but waits for a running drain to finish first.
    pub async fn flush(&self) -> DrainOutcome {
        let _flight = self.inner.flight.lock().await;
        self.drain_locked().await
    }

    /// Hold off every drain and force-sync until the guard is dropped.
    pub(crate) async fn hold(&self) -> FlightGuard<'_, ()> {
        self.inner.flight.lock().await
    }

    async fn drain_locked(&self) -> DrainOutcome {
        let mut tally = Tally::default();
        let identity = match self.inner.store.identity_key() {
            Ok(key) => key,
            Err(e) => return self.stopped(tally, None, e.into()),
        };
        loop {
            let pending = match self.inner.queue.pending() {
                Ok(days) => days,
                Err(e) => return self.stopped(tally, None, e.into()),
            };
            if pending.is_empty() {
                break;
            }
            let mut redirtied = false;
            for day in pending {
                match self.push_day(&identity, day).await {
                    Ok((step, again)) => {
                        tally.count(step);
                        redirtied |= again;
                    }
                    Err(e) => return self.stopped(tally, Some(day), e),
                }
            }
            // Days written to mid-push are still queued; go round again.
            if !redirtied {
                break;
            }
        }
        debug!(pushed = tally.pushed, pruned = tally.pruned, "drain complete");
        DrainOutcome::Completed {
            pushed: tally.pushed,
            pruned: tally.pruned,
        }
    }

    /// Push every non-empty local day regardless of queue membership. Waits
    /// for any running drain. On failure the failed day and all remaining
    /// days are queued for the retry timer.
    pub async fn force_sync_all(&self) -> DrainOutcome {
        let _flight = self.inner.flight.lock().await;
        let mut tally = Tally::default();
        let identity = match self.inner.store.identity_key() {
            Ok(key) => key,
            Err(e) => return self.stopped(tally, None, e.into()),
        };
        let days: Vec<DayKey> = match self.inner.store.load_all() {
            Ok(all) => all.into_iter().map(|c| c.day).collect(),
            Err(e) => return self.stopped(tally, None, e.into()),
        };
        info!(days = days.len(), "pushing all local days");
        for (i, day) in days.iter().enumerate() {
            match self.push_day(&identity, *day).await {
                Ok((step, _)) => tally.count(step),
                Err(e) => {
                    for rest in &days[i..] {
                        if let Err(qe) = self.inner.queue.push(*rest) {
                            warn!(day = %rest, error = %qe, "failed to queue day for retry");
                        }
                    }
                    return self.stopped(tally, Some(*day), e);
                }
            }
        }
        DrainOutcome::Completed {
            pushed: tally.pushed,
            pruned: tally.pruned,
        }
    }

    /// Re-read `day` and write it out. The day leaves the queue unless it
    /// was written to while the push was in flight.
    async fn push_day(&self, identity: &IdentityKey, day: DayKey) -> Result<(PushStep, bool)> {
        self.start_in_flight(day);
        let result = self.write_day(identity, day).await;
        let redirtied = self.finish_in_flight(day, result.is_ok())?;
        let step = result?;

        match step {
            PushStep::Pushed => {
                self.inner.store.set_last_sync(Utc::now())?;
                debug!(%day, "pushed");
                self.emit(SyncEvent::Pushed(day));
            }
            PushStep::Pruned => {
                debug!(%day, "pruned empty day from queue");
                self.emit(SyncEvent::Pruned(day));
            }
        }
        Ok((step, redirtied))
    }

    async fn write_day(&self, identity: &IdentityKey, day: DayKey) -> Result<PushStep> {
        let collection = self.inner.store.load(day)?;
        if collection.is_empty() {
            return Ok(PushStep::Pruned);
        }
        let body = encode_document(&collection, Utc::now())
            .map_err(|e| SyncError::Storage(anyhow::Error::new(e).context("encoding day")))?;
        self.inner
            .remote
            .set_document(&identity.day_path(day), body)
            .await?;
        Ok(PushStep::Pushed)
    }

    fn start_in_flight(&self, day: DayKey) {
        *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = InFlight {
            day: Some(day),
            redirtied: false,
        };
    }

    /// Clear the in-flight marker and, after a successful write, drop `day`
    /// from the queue unless it was written to meanwhile. Both happen under
    /// the marker's lock, which `enqueue` also holds while queueing.
    fn finish_in_flight(&self, day: DayKey, written: bool) -> anyhow::Result<bool> {
        let mut flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let redirtied = flight.redirtied;
        *flight = InFlight::default();
        if written && !redirtied {
            self.inner.queue.remove(day)?;
        }
        Ok(redirtied)
    }

    fn stopped(&self, tally: Tally, failed_day: Option<DayKey>, error: SyncError) -> DrainOutcome {
        let retryable = error.is_retryable();
        let message = error.to_string();
        match failed_day {
            Some(day) => warn!(%day, error = %message, retryable, "sync stopped"),
            None => warn!(error = %message, retryable, "sync stopped"),
        }
        self.emit(SyncEvent::Failed {
            day: failed_day,
            error: message.clone(),
        });
        DrainOutcome::Stopped {
            pushed: tally.pushed,
            pruned: tally.pruned,
            failed_day,
            error: message,
            retryable,
        }
    }

    /// Start the periodic retry timer if it is not already running.
    pub fn start_background_retry(&self) {
        let mut slot = self
            .inner
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, background retry not started");
            return;
        };
        let period = self.inner.options.retry_interval;
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = SyncEngine { inner };
                if engine.is_syncing() {
                    continue;
                }
                match engine.inner.queue.is_empty() {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(error = %e, "retry timer could not read queue");
                        continue;
                    }
                }
                debug!("retry timer draining queue");
                // A separate task, so stopping the timer never cuts a drain short.
                tokio::spawn(async move {
                    engine.drain().await;
                });
            }
        }));
        debug!(?period, "background retry started");
    }

    pub fn stop_background_retry(&self) {
        let task = self
            .inner
            .retry_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("background retry stopped");
        }
    }

    /// Arm sync: persist the flag, start the retry timer and push every
    /// local day.
    pub async fn enable(&self) -> Result<DrainOutcome> {
        self.inner.store.set_sync_enabled(true)?;
        self.inner.enabled.store(true, Ordering::SeqCst);
        self.start_background_retry();
        info!("sync enabled");
        self.emit(SyncEvent::Enabled);
        Ok(self.force_sync_all().await)
    }

    /// Stop scheduling drains. A drain already running finishes on its own.
    pub fn disable(&self) -> Result<()> {
        self.inner.store.set_sync_enabled(false)?;
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.stop_background_retry();
        info!("sync disabled");
        self.emit(SyncEvent::Disabled);
        Ok(())
    }

    /// Pick up where a previous process left off: when sync is enabled,
    /// start the timer and drain whatever is queued.
    pub fn resume(&self) {
        if self.is_enabled() {
            self.start_background_retry();
            self.spawn_drain();
        }
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let enabled = self.is_enabled();
        let pending = self.inner.queue.pending()?;
        let syncing = self.is_syncing();
        let state = if !enabled {
            SyncState::Disabled
        } else if syncing {
            SyncState::Syncing
        } else if pending.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Pending
        };
        Ok(SyncStatus {
            enabled,
            pending,
            last_sync_at: self.inner.store.last_sync()?,
            identity_key: self
                .inner
                .store
                .stored_identity_key()?
                .map(|k| k.formatted()),
            syncing,
            state,
        })
    }
}

impl Tally {
    fn count(&mut self, step: PushStep) {
        match step {
            PushStep::Pushed => self.pushed += 1,
            PushStep::Pruned => self.pruned += 1,
        }
    }
}
