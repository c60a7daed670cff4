use anyhow::{Result, bail};

use glico_core::models::MealCategory;
use glico_core::service::GlicoService;

use super::helpers::{local_clock, parse_date, parse_time, print_json, report_flush};

pub(crate) async fn cmd_glucose_add(
    svc: &GlicoService,
    value: i64,
    date: Option<&str>,
    time: Option<&str>,
    json: bool,
) -> Result<()> {
    if !(1..=1500).contains(&value) {
        bail!("Glucose value must be between 1 and 1500 mg/dL");
    }
    let day = parse_date(date)?;
    let at = parse_time(day, time)?;
    let entry = svc.add_glucose_entry(day, value, at)?;
    report_flush(svc.flush().await.as_ref());

    if json {
        print_json(&entry)?;
    } else {
        println!(
            "Logged {} mg/dL at {} on {day} (id {})",
            entry.value,
            local_clock(&entry.timestamp),
            entry.id
        );
    }
    Ok(())
}

pub(crate) async fn cmd_dose_add(
    svc: &GlicoService,
    units: f64,
    meal: &str,
    date: Option<&str>,
    time: Option<&str>,
    json: bool,
) -> Result<()> {
    if !(units.is_finite() && units > 0.0) {
        bail!("Dose must be greater than 0 units");
    }
    let category: MealCategory = meal.parse()?;
    let day = parse_date(date)?;
    let at = parse_time(day, time)?;
    let entry = svc.add_dose_entry(day, units, category, at)?;
    report_flush(svc.flush().await.as_ref());

    if json {
        print_json(&entry)?;
    } else {
        println!(
            "Logged {:.1} U ({}) at {} on {day} (id {})",
            entry.units,
            entry.meal_category,
            local_clock(&entry.timestamp),
            entry.id
        );
    }
    Ok(())
}

pub(crate) async fn cmd_basal_set(
    svc: &GlicoService,
    units: f64,
    date: Option<&str>,
    time: Option<&str>,
    json: bool,
) -> Result<()> {
    if !(units.is_finite() && units > 0.0) {
        bail!("Basal dose must be greater than 0 units");
    }
    let day = parse_date(date)?;
    let replacing = !svc.can_add_basal(day)?;
    let at = parse_time(day, time)?;
    let entry = svc.set_basal_entry(day, units, at)?;
    report_flush(svc.flush().await.as_ref());

    if json {
        print_json(&entry)?;
    } else {
        let verb = if replacing { "Replaced" } else { "Set" };
        println!(
            "{verb} basal for {day}: {:.1} U at {}",
            entry.units,
            local_clock(&entry.timestamp)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_notes_set(
    svc: &GlicoService,
    text: Option<String>,
    date: Option<&str>,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;
    svc.update_notes(day, text)?;
    report_flush(svc.flush().await.as_ref());

    let saved = svc.store().load(day)?.notes;
    if json {
        print_json(&serde_json::json!({ "date": day, "notes": saved }))?;
    } else if let Some(notes) = saved {
        println!("Notes for {day}: {notes}");
    } else {
        println!("Cleared notes for {day}");
    }
    Ok(())
}
