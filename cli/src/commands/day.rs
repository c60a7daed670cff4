use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use glico_core::models::DayCollection;
use glico_core::service::GlicoService;

use super::helpers::{local_clock, parse_date, parse_month, print_json, truncate};

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Meal")]
    meal: String,
    #[tabled(rename = "ID")]
    id: String,
}

fn entry_rows(day: &DayCollection) -> Vec<EntryRow> {
    let mut rows: Vec<(i64, EntryRow)> = Vec::new();
    for g in &day.glucose_entries {
        rows.push((
            g.timestamp.timestamp_millis(),
            EntryRow {
                time: local_clock(&g.timestamp),
                kind: "glucose",
                value: format!("{} mg/dL", g.value),
                meal: String::new(),
                id: g.id.clone(),
            },
        ));
    }
    for d in &day.dose_entries {
        rows.push((
            d.timestamp.timestamp_millis(),
            EntryRow {
                time: local_clock(&d.timestamp),
                kind: "dose",
                value: format!("{:.1} U", d.units),
                meal: d.meal_category.to_string(),
                id: d.id.clone(),
            },
        ));
    }
    if let Some(b) = &day.basal_entry {
        rows.push((
            b.timestamp.timestamp_millis(),
            EntryRow {
                time: local_clock(&b.timestamp),
                kind: "basal",
                value: format!("{:.1} U", b.units),
                meal: String::new(),
                id: b.id.clone(),
            },
        ));
    }
    rows.sort_by_key(|(ts, _)| *ts);
    rows.into_iter().map(|(_, row)| row).collect()
}

fn print_day(day: &DayCollection) {
    println!("{}", day.day.date().format("%A, %B %-d, %Y"));
    if day.is_empty() {
        println!("  Nothing logged.");
        return;
    }
    let rows = entry_rows(day);
    if !rows.is_empty() {
        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    if let Some(ref notes) = day.notes {
        println!("Notes: {notes}");
    }
}

#[derive(Tabled)]
struct MonthRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Readings")]
    readings: usize,
    #[tabled(rename = "Avg mg/dL")]
    average: String,
    #[tabled(rename = "Bolus U")]
    bolus: String,
    #[tabled(rename = "Basal U")]
    basal: String,
    #[tabled(rename = "Notes")]
    notes: String,
}

#[allow(clippy::cast_precision_loss)]
fn month_row(day: &DayCollection) -> MonthRow {
    let readings = day.glucose_entries.len();
    let average = if readings == 0 {
        "-".to_string()
    } else {
        let sum: i64 = day.glucose_entries.iter().map(|g| g.value).sum();
        format!("{:.0}", sum as f64 / readings as f64)
    };
    let bolus: f64 = day.dose_entries.iter().map(|d| d.units).sum();
    MonthRow {
        date: day.day.to_string(),
        readings,
        average,
        bolus: if day.dose_entries.is_empty() {
            "-".to_string()
        } else {
            format!("{bolus:.1}")
        },
        basal: day
            .basal_entry
            .as_ref()
            .map_or("-".into(), |b| format!("{:.1}", b.units)),
        notes: day
            .notes
            .as_deref()
            .map(|n| truncate(n, 30))
            .unwrap_or_default(),
    }
}

pub(crate) async fn cmd_show(svc: &GlicoService, date: Option<&str>, json: bool) -> Result<()> {
    let day = svc.load_day(parse_date(date)?).await?;
    if json {
        print_json(&day)
    } else {
        print_day(&day);
        Ok(())
    }
}

pub(crate) async fn cmd_month(svc: &GlicoService, month: Option<&str>, json: bool) -> Result<()> {
    let (start, end) = parse_month(month)?;
    let days = svc.load_range(start, end).await?;

    if json {
        return print_json(&days);
    }
    if days.is_empty() {
        eprintln!("Nothing logged between {start} and {end}.");
        return Ok(());
    }
    let rows: Vec<MonthRow> = days.iter().map(month_row).collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..5)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

/// Read someone else's day (or month) without touching local data.
pub(crate) async fn cmd_companion_show(
    svc: &GlicoService,
    key: &str,
    date: Option<&str>,
    month: Option<&str>,
    json: bool,
) -> Result<()> {
    match svc.set_companion_target(Some(key))? {
        Some(target) if !json => println!("Following {}", target.formatted()),
        Some(_) => {}
        None => eprintln!("That is this device's own key; showing local data."),
    }
    if month.is_some() {
        cmd_month(svc, month, json).await
    } else {
        cmd_show(svc, date, json).await
    }
}
