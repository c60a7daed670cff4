//! Deterministic reconciliation of two replicas of the same days.
//!
//! Readings and doses are unioned by instant, with the local copy winning
//! an exact collision. Basal and notes need a single winner per day; notes
//! carry no timestamp of their own, so the side with the most recent entry
//! of any kind is taken as the fresher note.

use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::models::{BasalEntry, DayCollection, DayKey};

fn union_by_instant<T: Clone>(remote: &[T], local: &[T], instant: impl Fn(&T) -> i64) -> Vec<T> {
    let mut by_instant = BTreeMap::new();
    for entry in remote.iter().chain(local) {
        by_instant.insert(instant(entry), entry.clone());
    }
    by_instant.into_values().collect()
}

fn pick_basal(remote: Option<&BasalEntry>, local: Option<&BasalEntry>) -> Option<BasalEntry> {
    match (remote, local) {
        (Some(r), Some(l)) if r.timestamp > l.timestamp => Some(r.clone()),
        (_, Some(l)) => Some(l.clone()),
        (Some(r), None) => Some(r.clone()),
        (None, None) => None,
    }
}

fn pick_notes(remote: &DayCollection, local: &DayCollection) -> Option<String> {
    let chosen = match (remote.latest_activity(), local.latest_activity()) {
        (Some(r), Some(l)) if r > l => &remote.notes,
        (Some(_), Some(_)) | (None, Some(_)) => &local.notes,
        (Some(_), None) => &remote.notes,
        (None, None) => {
            if remote.notes.as_deref().is_some_and(|n| !n.trim().is_empty()) {
                &remote.notes
            } else {
                &local.notes
            }
        }
    };
    chosen.clone().filter(|n| !n.trim().is_empty())
}

/// Merge two versions of the same day. Pure and total.
#[must_use]
pub fn merge_day(remote: &DayCollection, local: &DayCollection) -> DayCollection {
    DayCollection {
        day: local.day,
        glucose_entries: union_by_instant(&remote.glucose_entries, &local.glucose_entries, |e| {
            e.timestamp.timestamp_millis()
        }),
        dose_entries: union_by_instant(&remote.dose_entries, &local.dose_entries, |e| {
            e.timestamp.timestamp_millis()
        }),
        basal_entry: pick_basal(remote.basal_entry.as_ref(), local.basal_entry.as_ref()),
        notes: pick_notes(remote, local),
    }
}

/// Merge two full replicas. Days present on one side only pass through.
#[must_use]
pub fn merge_replicas(
    remote: Vec<DayCollection>,
    local: Vec<DayCollection>,
) -> BTreeMap<DayKey, DayCollection> {
    let mut merged: BTreeMap<DayKey, DayCollection> =
        remote.into_iter().map(|c| (c.day, c)).collect();
    for collection in local {
        let day = collection.day;
        let combined = match merged.get(&day) {
            Some(existing) => merge_day(existing, &collection),
            None => collection,
        };
        merged.insert(day, combined);
    }
    merged
}

/// Reject a merge result that would break storage invariants.
pub fn validate_merged(merged: &BTreeMap<DayKey, DayCollection>) -> Result<()> {
    for (day, collection) in merged {
        if collection.day != *day {
            return Err(SyncError::CorruptRecord {
                day: day.to_string(),
                reason: format!("collection is labelled {}", collection.day),
            });
        }
        if !collection.has_unique_instants() {
            return Err(SyncError::CorruptRecord {
                day: day.to_string(),
                reason: "two entries share one instant".to_string(),
            });
        }
    }
    Ok(())
}
