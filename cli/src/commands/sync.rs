use anyhow::{Result, bail};
use chrono::Local;

use glico_core::service::GlicoService;
use glico_core::sync::{DrainOutcome, SyncState};

use super::helpers::print_json;

fn describe(outcome: &DrainOutcome) -> String {
    match outcome {
        DrainOutcome::Skipped => "Another sync is already running".to_string(),
        DrainOutcome::Completed { pushed, pruned } => {
            let mut msg = format!("Pushed {pushed} day(s)");
            if *pruned > 0 {
                msg.push_str(&format!(", dropped {pruned} empty day(s) from the queue"));
            }
            msg
        }
        DrainOutcome::Stopped {
            pushed,
            failed_day,
            error,
            retryable,
            ..
        } => {
            let at = failed_day.map(|d| format!(" at {d}")).unwrap_or_default();
            let next = if *retryable {
                "remaining days stay queued"
            } else {
                "fix the problem and run `glico sync push`"
            };
            format!("Pushed {pushed} day(s), then stopped{at}: {error} ({next})")
        }
    }
}

pub(crate) async fn cmd_sync_enable(svc: &GlicoService, json: bool) -> Result<()> {
    let outcome = svc.enable_sync().await?;
    if json {
        return print_json(&outcome);
    }
    let key = svc.identity_key()?;
    println!("Sync enabled for key {}", key.formatted());
    println!("{}", describe(&outcome));
    Ok(())
}

pub(crate) fn cmd_sync_disable(svc: &GlicoService, json: bool) -> Result<()> {
    svc.disable_sync()?;
    if json {
        print_json(&serde_json::json!({ "enabled": false }))
    } else {
        println!("Sync disabled. Local changes are kept but no longer queued.");
        Ok(())
    }
}

pub(crate) fn cmd_sync_status(svc: &GlicoService, json: bool) -> Result<()> {
    let status = svc.sync_status()?;
    if json {
        return print_json(&status);
    }
    let state = match status.state {
        SyncState::Synced => "synced",
        SyncState::Syncing => "syncing",
        SyncState::Pending => "pending",
        SyncState::Disabled => "disabled",
    };
    println!("State:      {state}");
    println!(
        "Key:        {}",
        status.identity_key.as_deref().unwrap_or("(not created yet)")
    );
    println!(
        "Last sync:  {}",
        status.last_sync_at.map_or("never".to_string(), |t| t
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
            .to_string())
    );
    if status.pending.is_empty() {
        println!("Pending:    none");
    } else {
        let days: Vec<String> = status.pending.iter().map(ToString::to_string).collect();
        println!("Pending:    {} ({})", days.len(), days.join(", "));
    }
    Ok(())
}

/// Push every local day, not just the queued ones.
pub(crate) async fn cmd_sync_push(svc: &GlicoService, json: bool) -> Result<()> {
    if !svc.engine().is_enabled() {
        bail!("Sync is disabled. Run `glico sync enable` first");
    }
    let outcome = svc.engine().force_sync_all().await;
    if json {
        print_json(&outcome)
    } else {
        println!("{}", describe(&outcome));
        Ok(())
    }
}

pub(crate) async fn cmd_recover(svc: &GlicoService, key: &str, json: bool) -> Result<()> {
    let report = svc.recover(key).await?;
    if json {
        return print_json(&report);
    }
    println!("Recovered account {}", report.identity_key);
    println!(
        "  {} remote day(s) + {} local day(s) -> {} merged",
        report.remote_days, report.local_days, report.merged_days
    );
    if report.skipped_remote > 0 {
        eprintln!(
            "  Skipped {} unreadable remote day(s)",
            report.skipped_remote
        );
    }
    println!("  {}", describe(&report.resync));
    Ok(())
}
