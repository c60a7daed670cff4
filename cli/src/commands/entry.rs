use anyhow::{Result, bail};

use glico_core::service::GlicoService;

use super::helpers::{local_clock, parse_date, parse_time, print_json, report_flush};

pub(crate) async fn cmd_entry_move(
    svc: &GlicoService,
    id: &str,
    time: &str,
    date: Option<&str>,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;
    let at = parse_time(day, Some(time))?;
    let Some(kind) = svc.update_entry_time(day, id, at)? else {
        bail!("No entry '{id}' on {day}");
    };
    report_flush(svc.flush().await.as_ref());

    if json {
        print_json(&serde_json::json!({ "id": id, "kind": kind, "timestamp": at }))?;
    } else {
        println!("Moved {kind} entry {id} to {}", local_clock(&at));
    }
    Ok(())
}

pub(crate) async fn cmd_entry_remove(
    svc: &GlicoService,
    id: &str,
    date: Option<&str>,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;
    let Some(kind) = svc.remove_entry(day, id)? else {
        bail!("No entry '{id}' on {day}");
    };
    report_flush(svc.flush().await.as_ref());

    if json {
        print_json(&serde_json::json!({ "id": id, "kind": kind, "removed": true }))?;
    } else {
        println!("Removed {kind} entry {id} from {day}");
    }
    Ok(())
}
