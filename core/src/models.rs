use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::SyncError;

/// Calendar day a [`DayCollection`] belongs to. Doubles as the storage key
/// and remote document id, so its string form (`YYYY-MM-DD`) sorts the same
/// way the dates do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayKey(NaiveDate);

impl DayKey {
    #[must_use]
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    #[must_use]
    pub fn today() -> Self {
        Self(Local::now().date_naive())
    }

    #[must_use]
    pub fn date(self) -> NaiveDate {
        self.0
    }

    #[must_use]
    pub fn days_before(self, days: u64) -> Self {
        Self(self.0 - chrono::Days::new(days))
    }

    #[must_use]
    pub fn days_after(self, days: u64) -> Self {
        Self(self.0 + chrono::Days::new(days))
    }

    /// Same calendar day `years` earlier, clamped to Feb 28 for leap days.
    #[must_use]
    pub fn years_before(self, years: u32) -> Self {
        Self(
            self.0
                .checked_sub_months(chrono::Months::new(years * 12))
                .unwrap_or(NaiveDate::MIN),
        )
    }

    /// Every day from `self` through `end`, inclusive.
    pub fn through(self, end: DayKey) -> impl Iterator<Item = DayKey> {
        self.0
            .iter_days()
            .take_while(move |d| *d <= end.0)
            .map(DayKey)
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DayKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|_| anyhow::anyhow!("Invalid day '{s}'. Use YYYY-MM-DD"))?;
        Ok(Self(date))
    }
}

impl From<NaiveDate> for DayKey {
    fn from(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Instants are written as RFC 3339 with millisecond precision. Older
/// documents carry Unix milliseconds, which are accepted on read.
mod instant {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawInstant {
        Millis(i64),
        Fractional(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let parsed = match RawInstant::deserialize(deserializer)? {
            RawInstant::Millis(ms) => DateTime::from_timestamp_millis(ms),
            RawInstant::Fractional(ms) => DateTime::from_timestamp_millis(ms.round() as i64),
            RawInstant::Text(s) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&Utc)),
        };
        parsed.ok_or_else(|| serde::de::Error::custom("invalid timestamp"))
    }
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

/// Entries compare and collide at millisecond resolution.
fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealCategory {
    Breakfast,
    Lunch,
    AfternoonSnack,
    Snack,
    Dinner,
    #[default]
    Correction,
}

impl MealCategory {
    pub const ALL: [MealCategory; 6] = [
        MealCategory::Breakfast,
        MealCategory::Lunch,
        MealCategory::AfternoonSnack,
        MealCategory::Snack,
        MealCategory::Dinner,
        MealCategory::Correction,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::AfternoonSnack => "afternoon_snack",
            Self::Snack => "snack",
            Self::Dinner => "dinner",
            Self::Correction => "correction",
        }
    }
}

impl fmt::Display for MealCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid meal category '{s}'. Must be one of: {}",
                    names.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub value: i64,
    #[serde(with = "instant")]
    pub timestamp: DateTime<Utc>,
}

impl GlucoseEntry {
    #[must_use]
    pub fn new(value: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_entry_id(),
            value,
            timestamp: truncate(timestamp),
        }
    }
}

/// Bolus insulin dose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    #[serde(alias = "value")]
    pub units: f64,
    #[serde(rename = "mealType", alias = "mealCategory", default)]
    pub meal_category: MealCategory,
    #[serde(with = "instant")]
    pub timestamp: DateTime<Utc>,
}

impl DoseEntry {
    #[must_use]
    pub fn new(units: f64, meal_category: MealCategory, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_entry_id(),
            units,
            meal_category,
            timestamp: truncate(timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasalEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    #[serde(alias = "value")]
    pub units: f64,
    #[serde(with = "instant")]
    pub timestamp: DateTime<Utc>,
}

impl BasalEntry {
    #[must_use]
    pub fn new(units: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: new_entry_id(),
            units,
            timestamp: truncate(timestamp),
        }
    }
}

/// Which container an entry id was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Glucose,
    Dose,
    Basal,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Glucose => "glucose",
            Self::Dose => "dose",
            Self::Basal => "basal",
        })
    }
}

fn blank_as_none<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let notes = Option::<String>::deserialize(deserializer)?;
    Ok(notes.filter(|n| !n.trim().is_empty()))
}

/// Everything recorded for one day. This is the unit of storage and sync:
/// the whole collection is replaced on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCollection {
    #[serde(rename = "date")]
    pub day: DayKey,
    #[serde(alias = "glucose", default)]
    pub glucose_entries: Vec<GlucoseEntry>,
    #[serde(rename = "bolusEntries", alias = "bolus", alias = "doseEntries", default)]
    pub dose_entries: Vec<DoseEntry>,
    #[serde(default)]
    pub basal_entry: Option<BasalEntry>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub notes: Option<String>,
}

impl DayCollection {
    #[must_use]
    pub fn empty(day: DayKey) -> Self {
        Self {
            day,
            glucose_entries: Vec::new(),
            dose_entries: Vec::new(),
            basal_entry: None,
            notes: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.glucose_entries.is_empty()
            && self.dose_entries.is_empty()
            && self.basal_entry.is_none()
            && self.notes.as_deref().is_none_or(|n| n.trim().is_empty())
    }

    /// Most recent timestamp over every entry in the collection.
    #[must_use]
    pub fn latest_activity(&self) -> Option<DateTime<Utc>> {
        let glucose = self.glucose_entries.iter().map(|e| e.timestamp);
        let doses = self.dose_entries.iter().map(|e| e.timestamp);
        let basal = self.basal_entry.iter().map(|e| e.timestamp);
        glucose.chain(doses).chain(basal).max()
    }

    /// Insert a reading, replacing any existing reading at the same instant.
    pub fn upsert_glucose(&mut self, entry: GlucoseEntry) {
        let ms = entry.timestamp.timestamp_millis();
        self.glucose_entries
            .retain(|e| e.timestamp.timestamp_millis() != ms);
        self.glucose_entries.push(entry);
        self.glucose_entries.sort_by_key(|e| e.timestamp);
    }

    pub fn upsert_dose(&mut self, entry: DoseEntry) {
        let ms = entry.timestamp.timestamp_millis();
        self.dose_entries
            .retain(|e| e.timestamp.timestamp_millis() != ms);
        self.dose_entries.push(entry);
        self.dose_entries.sort_by_key(|e| e.timestamp);
    }

    /// Returns the basal entry that was replaced, if any.
    pub fn set_basal(&mut self, entry: BasalEntry) -> Option<BasalEntry> {
        self.basal_entry.replace(entry)
    }

    #[must_use]
    pub fn can_add_basal(&self) -> bool {
        self.basal_entry.is_none()
    }

    pub fn set_notes(&mut self, notes: Option<String>) {
        self.notes = notes.filter(|n| !n.trim().is_empty());
    }

    pub fn remove_entry(&mut self, id: &str) -> Option<EntryKind> {
        if let Some(pos) = self.glucose_entries.iter().position(|e| e.id == id) {
            self.glucose_entries.remove(pos);
            return Some(EntryKind::Glucose);
        }
        if let Some(pos) = self.dose_entries.iter().position(|e| e.id == id) {
            self.dose_entries.remove(pos);
            return Some(EntryKind::Dose);
        }
        if self.basal_entry.as_ref().is_some_and(|b| b.id == id) {
            self.basal_entry = None;
            return Some(EntryKind::Basal);
        }
        None
    }

    /// Move an entry to a new instant. A reading or dose already sitting at
    /// that instant is replaced by the moved one.
    pub fn move_entry(&mut self, id: &str, timestamp: DateTime<Utc>) -> Option<EntryKind> {
        let timestamp = truncate(timestamp);
        if let Some(pos) = self.glucose_entries.iter().position(|e| e.id == id) {
            let mut entry = self.glucose_entries.remove(pos);
            entry.timestamp = timestamp;
            self.upsert_glucose(entry);
            return Some(EntryKind::Glucose);
        }
        if let Some(pos) = self.dose_entries.iter().position(|e| e.id == id) {
            let mut entry = self.dose_entries.remove(pos);
            entry.timestamp = timestamp;
            self.upsert_dose(entry);
            return Some(EntryKind::Dose);
        }
        if let Some(basal) = self.basal_entry.as_mut().filter(|b| b.id == id) {
            basal.timestamp = timestamp;
            return Some(EntryKind::Basal);
        }
        None
    }

    /// Sort entries and collapse duplicate instants, keeping the last one seen.
    pub fn normalize(&mut self) {
        fn dedup_by_instant<T>(entries: &mut Vec<T>, ts: impl Fn(&T) -> i64) {
            entries.reverse();
            let mut seen = std::collections::HashSet::new();
            entries.retain(|e| seen.insert(ts(e)));
            entries.sort_by_key(|e| ts(e));
        }
        dedup_by_instant(&mut self.glucose_entries, |e| e.timestamp.timestamp_millis());
        dedup_by_instant(&mut self.dose_entries, |e| e.timestamp.timestamp_millis());
        if self.notes.as_deref().is_some_and(|n| n.trim().is_empty()) {
            self.notes = None;
        }
    }

    #[must_use]
    pub fn has_unique_instants(&self) -> bool {
        let mut glucose: Vec<i64> = self
            .glucose_entries
            .iter()
            .map(|e| e.timestamp.timestamp_millis())
            .collect();
        let mut doses: Vec<i64> = self
            .dose_entries
            .iter()
            .map(|e| e.timestamp.timestamp_millis())
            .collect();
        let (g, d) = (glucose.len(), doses.len());
        glucose.sort_unstable();
        glucose.dedup();
        doses.sort_unstable();
        doses.dedup();
        glucose.len() == g && doses.len() == d
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireDocument<'a> {
    date: DayKey,
    glucose_entries: &'a [GlucoseEntry],
    bolus_entries: &'a [DoseEntry],
    basal_entry: Option<&'a BasalEntry>,
    notes: &'a str,
    last_updated: String,
}

/// Serialize a collection as the remote document body.
pub fn encode_document(
    collection: &DayCollection,
    updated_at: DateTime<Utc>,
) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&WireDocument {
        date: collection.day,
        glucose_entries: &collection.glucose_entries,
        bolus_entries: &collection.dose_entries,
        basal_entry: collection.basal_entry.as_ref(),
        notes: collection.notes.as_deref().unwrap_or_default(),
        last_updated: updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// Parse a remote document body. The document id is authoritative for the
/// day, whatever the body's own `date` field says.
pub fn decode_document(day: DayKey, bytes: &[u8]) -> serde_json::Result<DayCollection> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("date".to_string(), serde_json::Value::String(day.to_string()));
    }
    let mut collection: DayCollection = serde_json::from_value(value)?;
    collection.normalize();
    Ok(collection)
}

pub const IDENTITY_KEY_LEN: usize = 8;
const KEY_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DAILY_LOGS: &str = "daily_logs";

/// Eight uppercase alphanumerics addressing one user's remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Accepts display forms like `a1b2-c3d4`: separators are stripped and
    /// letters upper-cased before validation.
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let cleaned: String = input
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.len() != IDENTITY_KEY_LEN {
            return Err(SyncError::InvalidKey(format!(
                "'{input}' must contain exactly {IDENTITY_KEY_LEN} letters or digits"
            )));
        }
        Ok(Self(cleaned))
    }

    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let key = (0..IDENTITY_KEY_LEN)
            .map(|_| char::from(KEY_ALPHABET[rng.random_range(0..KEY_ALPHABET.len())]))
            .collect();
        Self(key)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `ABCD-EFGH`
    #[must_use]
    pub fn formatted(&self) -> String {
        let (head, tail) = self.0.split_at(IDENTITY_KEY_LEN / 2);
        format!("{head}-{tail}")
    }

    #[must_use]
    pub fn namespace(&self) -> String {
        format!("users/{}", self.0)
    }

    #[must_use]
    pub fn collection(&self) -> String {
        format!("users/{}/{DAILY_LOGS}", self.0)
    }

    #[must_use]
    pub fn day_path(&self, day: DayKey) -> String {
        format!("users/{}/{DAILY_LOGS}/{day}", self.0)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdentityKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityKey> for String {
    fn from(key: IdentityKey) -> Self {
        key.0
    }
}

impl FromStr for IdentityKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, h, m, 0).unwrap()
    }

    #[test]
    fn test_day_key_display_and_parse() {
        let d = day("2024-01-05");
        assert_eq!(d.to_string(), "2024-01-05");
        assert!("2024-13-01".parse::<DayKey>().is_err());
        assert!("05/01/2024".parse::<DayKey>().is_err());
    }

    #[test]
    fn test_day_key_string_order_matches_date_order() {
        let a = day("2023-12-31");
        let b = day("2024-01-05");
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_years_before_clamps_leap_day() {
        assert_eq!(day("2024-02-29").years_before(2).to_string(), "2022-02-28");
        assert_eq!(day("2026-10-16").years_before(2).to_string(), "2024-10-16");
    }

    #[test]
    fn test_through_is_inclusive() {
        let days: Vec<String> = day("2024-01-30")
            .through(day("2024-02-02"))
            .map(|d| d.to_string())
            .collect();
        assert_eq!(days, ["2024-01-30", "2024-01-31", "2024-02-01", "2024-02-02"]);
    }

    #[test]
    fn test_empty_collection() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        assert!(c.is_empty());
        c.notes = Some("   ".to_string());
        assert!(c.is_empty());
        c.set_notes(Some("felt dizzy".to_string()));
        assert!(!c.is_empty());
    }

    #[test]
    fn test_upsert_glucose_replaces_same_instant() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        c.upsert_glucose(GlucoseEntry::new(140, at(12, 0)));
        c.upsert_glucose(GlucoseEntry::new(110, at(9, 0)));
        c.upsert_glucose(GlucoseEntry::new(115, at(9, 0)));
        let values: Vec<i64> = c.glucose_entries.iter().map(|e| e.value).collect();
        assert_eq!(values, [115, 140]);
    }

    #[test]
    fn test_set_basal_replaces() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        assert!(c.can_add_basal());
        assert!(c.set_basal(BasalEntry::new(18.0, at(22, 0))).is_none());
        assert!(!c.can_add_basal());
        let old = c.set_basal(BasalEntry::new(20.0, at(22, 30))).unwrap();
        assert!((old.units - 18.0).abs() < f64::EPSILON);
        assert!((c.basal_entry.unwrap().units - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_move_entry_resorts_and_collides() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        let early = GlucoseEntry::new(100, at(7, 0));
        let late = GlucoseEntry::new(200, at(20, 0));
        let early_id = early.id.clone();
        c.upsert_glucose(early);
        c.upsert_glucose(late);

        assert_eq!(c.move_entry(&early_id, at(21, 0)), Some(EntryKind::Glucose));
        assert_eq!(c.glucose_entries.last().unwrap().id, early_id);

        assert_eq!(c.move_entry(&early_id, at(20, 0)), Some(EntryKind::Glucose));
        assert_eq!(c.glucose_entries.len(), 1);
        assert_eq!(c.glucose_entries[0].value, 100);

        assert_eq!(c.move_entry("missing", at(1, 0)), None);
    }

    #[test]
    fn test_remove_entry_by_kind() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        let dose = DoseEntry::new(4.5, MealCategory::Lunch, at(12, 30));
        let basal = BasalEntry::new(18.0, at(22, 0));
        let (dose_id, basal_id) = (dose.id.clone(), basal.id.clone());
        c.upsert_dose(dose);
        c.set_basal(basal);
        assert_eq!(c.remove_entry(&dose_id), Some(EntryKind::Dose));
        assert_eq!(c.remove_entry(&basal_id), Some(EntryKind::Basal));
        assert_eq!(c.remove_entry(&basal_id), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_latest_activity_covers_all_entries() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        assert!(c.latest_activity().is_none());
        c.upsert_glucose(GlucoseEntry::new(100, at(8, 0)));
        c.set_basal(BasalEntry::new(18.0, at(22, 0)));
        c.upsert_dose(DoseEntry::new(3.0, MealCategory::Dinner, at(19, 0)));
        assert_eq!(c.latest_activity(), Some(at(22, 0)));
    }

    #[test]
    fn test_timestamps_truncate_to_millis() {
        let ts = Utc.timestamp_nanos(1_704_445_200_123_456_789);
        let e = GlucoseEntry::new(99, ts);
        assert_eq!(e.timestamp.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_encode_document_wire_shape() {
        let mut c = DayCollection::empty(day("2024-01-05"));
        c.upsert_dose(DoseEntry::new(2.0, MealCategory::AfternoonSnack, at(16, 0)));
        let bytes = encode_document(&c, at(23, 0)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["date"], "2024-01-05");
        assert_eq!(json["bolusEntries"][0]["mealType"], "afternoon_snack");
        assert_eq!(json["bolusEntries"][0]["timestamp"], "2024-01-05T16:00:00.000Z");
        assert!(json["basalEntry"].is_null());
        assert_eq!(json["notes"], "");
        assert_eq!(json["lastUpdated"], "2024-01-05T23:00:00.000Z");
        assert!(json["glucoseEntries"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_decode_document_accepts_legacy_fields() {
        let body = br#"{
            "date": "1999-01-01",
            "glucose": [{"id": "g1", "value": 110, "timestamp": 1704445200000}],
            "bolus": [{"id": "b1", "value": 3.5, "timestamp": "2024-01-05T12:00:00Z"}],
            "basalEntry": null,
            "notes": "",
            "lastUpdated": "2024-01-05T23:00:00.000Z"
        }"#;
        let c = decode_document(day("2024-01-05"), body).unwrap();
        assert_eq!(c.day, day("2024-01-05"));
        assert_eq!(c.glucose_entries[0].timestamp, at(9, 0));
        assert!((c.dose_entries[0].units - 3.5).abs() < f64::EPSILON);
        assert_eq!(c.dose_entries[0].meal_category, MealCategory::Correction);
        assert!(c.notes.is_none());
    }

    #[test]
    fn test_decode_document_collapses_duplicate_instants() {
        let body = br#"{
            "glucoseEntries": [
                {"id": "a", "value": 100, "timestamp": "2024-01-05T09:00:00Z"},
                {"id": "b", "value": 105, "timestamp": "2024-01-05T09:00:00.000Z"}
            ]
        }"#;
        let c = decode_document(day("2024-01-05"), body).unwrap();
        assert_eq!(c.glucose_entries.len(), 1);
        assert_eq!(c.glucose_entries[0].id, "b");
        assert!(c.has_unique_instants());
    }

    #[test]
    fn test_decode_document_rejects_garbage() {
        assert!(decode_document(day("2024-01-05"), b"not json").is_err());
        assert!(
            decode_document(day("2024-01-05"), br#"{"glucoseEntries": [{"value": 1}]}"#).is_err()
        );
    }

    #[test]
    fn test_meal_category_parse() {
        assert_eq!(
            "Afternoon-Snack".parse::<MealCategory>().unwrap(),
            MealCategory::AfternoonSnack
        );
        assert!("brunch".parse::<MealCategory>().is_err());
    }

    #[test]
    fn test_identity_key_parse_cleans_input() {
        let key = IdentityKey::parse(" a1b2-c3d4 ").unwrap();
        assert_eq!(key.as_str(), "A1B2C3D4");
        assert_eq!(key.formatted(), "A1B2-C3D4");
        assert_eq!(key.day_path(day("2024-01-05")), "users/A1B2C3D4/daily_logs/2024-01-05");
        assert_eq!(key.namespace(), "users/A1B2C3D4");
    }

    #[test]
    fn test_identity_key_rejects_wrong_length() {
        assert!(matches!(
            IdentityKey::parse("ABC-123"),
            Err(SyncError::InvalidKey(_))
        ));
        assert!(IdentityKey::parse("ABCDEFGHI").is_err());
        assert!(IdentityKey::parse("").is_err());
    }

    #[test]
    fn test_identity_key_generate_is_valid() {
        for _ in 0..50 {
            let key = IdentityKey::generate();
            assert_eq!(key.as_str().len(), IDENTITY_KEY_LEN);
            assert!(IdentityKey::parse(key.as_str()).is_ok());
            assert!(
                key.as_str()
                    .chars()
                    .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
            );
        }
    }
}
