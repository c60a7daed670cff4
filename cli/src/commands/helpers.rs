use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Months, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;

use glico_core::models::DayKey;
use glico_core::sync::DrainOutcome;

pub(crate) fn parse_date(date_str: Option<&str>) -> Result<DayKey> {
    let today = DayKey::today();
    match date_str {
        None | Some("today") => Ok(today),
        Some("yesterday") => Ok(today.days_before(1)),
        Some("tomorrow") => Ok(today.days_after(1)),
        Some(s) => s.parse().with_context(|| {
            format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
        }),
    }
}

/// Resolve the instant of an entry on `day`. With no `--time`, today's
/// entries use the current time and other days use noon.
pub(crate) fn parse_time(day: DayKey, time: Option<&str>) -> Result<DateTime<Utc>> {
    let clock = match time {
        Some(s) => NaiveTime::parse_from_str(s, "%H:%M")
            .with_context(|| format!("Invalid time '{s}'. Use HH:MM (24-hour)"))?,
        None if day == DayKey::today() => {
            let now = Local::now().time();
            NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second()).unwrap_or(now)
        }
        None => NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default(),
    };
    let local = Local
        .from_local_datetime(&day.date().and_time(clock))
        .earliest()
        .with_context(|| format!("{} {} does not exist in the local time zone", day, clock.format("%H:%M")))?;
    Ok(local.with_timezone(&Utc))
}

/// First and last day of `YYYY-MM`, or of the current month.
pub(crate) fn parse_month(month: Option<&str>) -> Result<(DayKey, DayKey)> {
    let first = match month {
        None => {
            let today = Local::now().date_naive();
            NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        }
        Some(s) => NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").ok(),
    }
    .with_context(|| format!("Invalid month '{}'. Use YYYY-MM", month.unwrap_or_default()))?;
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|d| d.pred_opt())
        .context("Month out of range")?;
    Ok((DayKey::new(first), DayKey::new(last)))
}

pub(crate) fn local_clock(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M").to_string()
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Tell the user when a local change did not make it to the server yet.
pub(crate) fn report_flush(outcome: Option<&DrainOutcome>) {
    if let Some(DrainOutcome::Stopped { error, retryable, .. }) = outcome {
        if *retryable {
            eprintln!("Saved locally; sync will retry later ({error})");
        } else {
            eprintln!("Saved locally, but sync failed: {error}");
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
