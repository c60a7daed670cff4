use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use rusqlite::{Connection, params};
use tracing::warn;

use crate::models::{DayCollection, DayKey, IdentityKey};

const PENDING_QUEUE_KEY: &str = "pending-sync-queue";
const LAST_SYNC_KEY: &str = "last-sync-timestamp";
const IDENTITY_KEY: &str = "identity-key";
const SYNC_ENABLED_KEY: &str = "sync-enabled";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS day_collections (
                    day TEXT PRIMARY KEY NOT NULL,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Day collections ---

    /// Empty collections are stored as absence, so `load_all_days` never
    /// sees them.
    fn put_day(conn: &Connection, collection: &DayCollection) -> Result<()> {
        let day = collection.day.to_string();
        if collection.is_empty() {
            conn.execute("DELETE FROM day_collections WHERE day = ?1", params![day])?;
            return Ok(());
        }
        let payload = serde_json::to_string(collection)
            .with_context(|| format!("Failed to serialize day {day}"))?;
        conn.execute(
            "INSERT INTO day_collections (day, payload, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(day) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![day, payload, Local::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// A payload that no longer parses is logged and read as an empty day.
    fn decode_payload(day: DayKey, payload: &str) -> DayCollection {
        match serde_json::from_str::<DayCollection>(payload) {
            Ok(mut collection) => {
                collection.day = day;
                collection.normalize();
                collection
            }
            Err(e) => {
                warn!(%day, error = %e, "corrupt day record, treating as empty");
                DayCollection::empty(day)
            }
        }
    }

    fn days_from_rows(rows: Vec<(String, String)>) -> Vec<DayCollection> {
        rows.into_iter()
            .filter_map(|(day, payload)| match day.parse::<DayKey>() {
                Ok(key) => Some(Self::decode_payload(key, &payload)),
                Err(e) => {
                    warn!(%day, error = %e, "skipping day record with invalid key");
                    None
                }
            })
            .filter(|c| !c.is_empty())
            .collect()
    }

    pub fn save_day(&self, collection: &DayCollection) -> Result<()> {
        Self::put_day(&self.conn, collection)
    }

    pub fn load_day(&self, day: DayKey) -> Result<DayCollection> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM day_collections WHERE day = ?1")?;
        let mut rows = stmt.query(params![day.to_string()])?;
        if let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            Ok(Self::decode_payload(day, &payload))
        } else {
            Ok(DayCollection::empty(day))
        }
    }

    /// Every stored non-empty day, oldest first.
    pub fn load_all_days(&self) -> Result<Vec<DayCollection>> {
        let mut stmt = self
            .conn
            .prepare("SELECT day, payload FROM day_collections ORDER BY day")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(Self::days_from_rows(rows))
    }

    pub fn load_day_range(&self, start: DayKey, end: DayKey) -> Result<Vec<DayCollection>> {
        let mut stmt = self.conn.prepare(
            "SELECT day, payload FROM day_collections
             WHERE day >= ?1 AND day <= ?2
             ORDER BY day",
        )?;
        let rows = stmt
            .query_map(params![start.to_string(), end.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(Self::days_from_rows(rows))
    }

    pub fn list_day_keys(&self) -> Result<Vec<DayKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT day FROM day_collections ORDER BY day")?;
        let days = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(days.iter().filter_map(|d| d.parse().ok()).collect())
    }

    // --- Sync state ---

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM sync_state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    fn set_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Pending days in insertion order. An unreadable queue is rebuilt from
    /// every stored day, since pushing a clean day again is harmless.
    pub fn load_pending_queue(&self) -> Result<Vec<DayKey>> {
        let Some(raw) = self.get_state(PENDING_QUEUE_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<DayKey>>(&raw) {
            Ok(days) => Ok(days),
            Err(e) => {
                warn!(error = %e, "corrupt pending queue, rebuilding from stored days");
                let days = self.list_day_keys()?;
                self.save_pending_queue(&days)?;
                Ok(days)
            }
        }
    }

    pub fn save_pending_queue(&self, days: &[DayKey]) -> Result<()> {
        let raw = serde_json::to_string(days)?;
        Self::set_state(&self.conn, PENDING_QUEUE_KEY, &raw)
    }

    pub fn get_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_state(LAST_SYNC_KEY)?.and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| warn!(error = %e, "ignoring unreadable last sync timestamp"))
                .ok()
        }))
    }

    pub fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        Self::set_state(&self.conn, LAST_SYNC_KEY, &at.to_rfc3339())
    }

    pub fn is_sync_enabled(&self) -> Result<bool> {
        Ok(self.get_state(SYNC_ENABLED_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> Result<()> {
        Self::set_state(
            &self.conn,
            SYNC_ENABLED_KEY,
            if enabled { "true" } else { "false" },
        )
    }

    pub fn get_identity_key(&self) -> Result<Option<IdentityKey>> {
        Ok(self
            .get_state(IDENTITY_KEY)?
            .and_then(|raw| match IdentityKey::parse(&raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable identity key");
                    None
                }
            }))
    }

    pub fn set_identity_key(&self, key: &IdentityKey) -> Result<()> {
        Self::set_state(&self.conn, IDENTITY_KEY, key.as_str())
    }

    pub fn get_or_create_identity_key(&self) -> Result<IdentityKey> {
        if let Some(key) = self.get_identity_key()? {
            return Ok(key);
        }
        let key = IdentityKey::generate();
        self.set_identity_key(&key)?;
        Ok(key)
    }

    /// Replace every day and all sync metadata with `merged`, adopting
    /// `identity`. Runs in one transaction: on any error nothing changes.
    /// User settings are left alone.
    pub fn rebase(&self, merged: &[DayCollection], identity: &IdentityKey) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin rebase")?;
        tx.execute("DELETE FROM day_collections", [])?;
        tx.execute("DELETE FROM sync_state", [])?;
        for collection in merged {
            Self::put_day(&tx, collection)
                .with_context(|| format!("Failed to save merged day {}", collection.day))?;
        }
        Self::set_state(&tx, IDENTITY_KEY, identity.as_str())?;
        tx.commit().context("Failed to commit rebase")?;
        Ok(())
    }

    // --- User Settings ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO user_settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM user_settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BasalEntry, GlucoseEntry};
    use chrono::TimeZone;

    fn day(s: &str) -> DayKey {
        s.parse().unwrap()
    }

    fn sample_day(d: &str, value: i64) -> DayCollection {
        let key = day(d);
        let mut c = DayCollection::empty(key);
        let ts = key.date().and_hms_opt(9, 0, 0).unwrap().and_utc();
        c.upsert_glucose(GlucoseEntry::new(value, ts));
        c
    }

    #[test]
    fn test_load_unknown_day_is_empty() {
        let db = Database::open_in_memory().unwrap();
        let c = db.load_day(day("2024-01-05")).unwrap();
        assert!(c.is_empty());
        assert_eq!(c.day, day("2024-01-05"));
    }

    #[test]
    fn test_save_and_load_day() {
        let db = Database::open_in_memory().unwrap();
        let c = sample_day("2024-01-05", 110);
        db.save_day(&c).unwrap();
        assert_eq!(db.load_day(c.day).unwrap(), c);
    }

    #[test]
    fn test_save_is_last_writer_wins() {
        let db = Database::open_in_memory().unwrap();
        db.save_day(&sample_day("2024-01-05", 110)).unwrap();
        db.save_day(&sample_day("2024-01-05", 150)).unwrap();
        let c = db.load_day(day("2024-01-05")).unwrap();
        assert_eq!(c.glucose_entries.len(), 1);
        assert_eq!(c.glucose_entries[0].value, 150);
    }

    #[test]
    fn test_saving_empty_day_removes_it() {
        let db = Database::open_in_memory().unwrap();
        db.save_day(&sample_day("2024-01-05", 110)).unwrap();
        db.save_day(&DayCollection::empty(day("2024-01-05"))).unwrap();
        assert!(db.list_day_keys().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_payload_reads_as_empty() {
        let db = Database::open_in_memory().unwrap();
        db.save_day(&sample_day("2024-01-06", 120)).unwrap();
        db.execute_batch(
            "INSERT INTO day_collections (day, payload, updated_at)
             VALUES ('2024-01-05', '{not json', '2024-01-05T00:00:00Z')",
        )
        .unwrap();

        assert!(db.load_day(day("2024-01-05")).unwrap().is_empty());
        let all = db.load_all_days().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].day, day("2024-01-06"));
    }

    #[test]
    fn test_load_all_and_range_are_ordered() {
        let db = Database::open_in_memory().unwrap();
        for d in ["2023-03-01", "2024-01-05", "2021-07-19"] {
            db.save_day(&sample_day(d, 100)).unwrap();
        }
        let all: Vec<String> = db
            .load_all_days()
            .unwrap()
            .iter()
            .map(|c| c.day.to_string())
            .collect();
        assert_eq!(all, ["2021-07-19", "2023-03-01", "2024-01-05"]);

        let range = db
            .load_day_range(day("2023-03-01"), day("2024-01-05"))
            .unwrap();
        assert_eq!(range.len(), 2);
    }

    #[test]
    fn test_pending_queue_persistence() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_pending_queue().unwrap().is_empty());
        let days = vec![day("2024-01-05"), day("2024-01-03")];
        db.save_pending_queue(&days).unwrap();
        assert_eq!(db.load_pending_queue().unwrap(), days);
    }

    #[test]
    fn test_corrupt_pending_queue_rebuilds_from_days() {
        let db = Database::open_in_memory().unwrap();
        db.save_day(&sample_day("2024-01-05", 100)).unwrap();
        db.execute_batch(
            "INSERT INTO sync_state (key, value) VALUES ('pending-sync-queue', '[garbage')",
        )
        .unwrap();
        assert_eq!(db.load_pending_queue().unwrap(), vec![day("2024-01-05")]);
    }

    #[test]
    fn test_identity_key_persistence() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_identity_key().unwrap().is_none());
        let k1 = db.get_or_create_identity_key().unwrap();
        let k2 = db.get_or_create_identity_key().unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_sync_flags() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_sync_enabled().unwrap());
        db.set_sync_enabled(true).unwrap();
        assert!(db.is_sync_enabled().unwrap());

        assert!(db.get_last_sync().unwrap().is_none());
        let at = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();
        db.set_last_sync(at).unwrap();
        assert_eq!(db.get_last_sync().unwrap(), Some(at));
    }

    #[test]
    fn test_rebase_replaces_days_and_metadata_but_keeps_settings() {
        let db = Database::open_in_memory().unwrap();
        db.save_day(&sample_day("2020-01-01", 90)).unwrap();
        db.save_pending_queue(&[day("2020-01-01")]).unwrap();
        db.set_sync_enabled(true).unwrap();
        db.set_setting("theme", "dark").unwrap();

        let new_key = IdentityKey::parse("NEWK3Y00").unwrap();
        let mut with_basal = sample_day("2024-01-05", 110);
        with_basal.set_basal(BasalEntry::new(
            18.0,
            Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap(),
        ));
        db.rebase(&[with_basal.clone()], &new_key).unwrap();

        assert_eq!(db.list_day_keys().unwrap(), vec![day("2024-01-05")]);
        assert_eq!(db.load_day(day("2024-01-05")).unwrap(), with_basal);
        assert!(db.load_pending_queue().unwrap().is_empty());
        assert!(!db.is_sync_enabled().unwrap());
        assert_eq!(db.get_identity_key().unwrap(), Some(new_key));
        assert_eq!(db.get_setting("theme").unwrap().as_deref(), Some("dark"));
    }

    #[test]
    fn test_failed_rebase_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let old_key = db.get_or_create_identity_key().unwrap();
        let original = sample_day("2020-01-01", 90);
        db.save_day(&original).unwrap();
        db.execute_batch(
            "CREATE TRIGGER reject_day BEFORE INSERT ON day_collections
             WHEN NEW.day = '2024-01-06'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

        let merged = vec![sample_day("2024-01-05", 110), sample_day("2024-01-06", 120)];
        let new_key = IdentityKey::parse("NEWK3Y00").unwrap();
        assert!(db.rebase(&merged, &new_key).is_err());

        assert_eq!(db.load_all_days().unwrap(), vec![original]);
        assert_eq!(db.get_identity_key().unwrap(), Some(old_key));
    }

    #[test]
    fn test_user_settings_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_setting("key").unwrap().is_none());
        db.set_setting("key", "value1").unwrap();
        db.set_setting("key", "value2").unwrap();
        assert_eq!(db.get_setting("key").unwrap().as_deref(), Some("value2"));
    }
}
