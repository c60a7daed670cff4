mod commands;
mod config;
mod http_remote;
mod server;

use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_basal_set, cmd_companion_show, cmd_dose_add, cmd_entry_move, cmd_entry_remove,
    cmd_glucose_add, cmd_key_show, cmd_month, cmd_notes_set, cmd_recover, cmd_show,
    cmd_sync_disable, cmd_sync_enable, cmd_sync_push, cmd_sync_status,
};
use crate::config::Config;
use crate::http_remote::HttpRemoteStore;
use glico_core::docstore::DocumentStore;
use glico_core::service::GlicoService;
use glico_core::sync::SyncOptions;

#[derive(Parser)]
#[command(
    name = "glico",
    version,
    about = "An offline-first glucose and insulin log",
    long_about = "An offline-first glucose and insulin log.\n\n\
        Everything is written locally first. With sync enabled, changed days are \
        pushed to a glico server, and your identity key lets you recover the \
        whole log on another device."
)]
struct Cli {
    /// Sync server URL
    #[arg(
        long,
        global = true,
        env = "GLICO_REMOTE_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    remote: String,
    /// API key for the sync server
    #[arg(long, global = true, env = "GLICO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log glucose readings
    Glucose {
        #[command(subcommand)]
        command: GlucoseCommands,
    },
    /// Log bolus doses
    Dose {
        #[command(subcommand)]
        command: DoseCommands,
    },
    /// Set the day's basal dose
    Basal {
        #[command(subcommand)]
        command: BasalCommands,
    },
    /// Set or clear the day's notes
    Notes {
        #[command(subcommand)]
        command: NotesCommands,
    },
    /// Move or remove a logged entry
    Entry {
        #[command(subcommand)]
        command: EntryCommands,
    },
    /// Show one day
    Show {
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarise a month, one row per logged day
    Month {
        /// Month (YYYY-MM, default: current month)
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage sync with the server
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Restore an account onto this device and merge it with the local log
    Recover {
        /// Identity key of the account to recover (e.g. ABCD-EFGH)
        key: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read another account's log (read-only)
    Companion {
        #[command(subcommand)]
        command: CompanionCommands,
    },
    /// Show this device's identity key
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Run the sync server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum GlucoseCommands {
    /// Log a glucose reading
    Add {
        /// Reading in mg/dL
        value: i64,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Local time (HH:MM; default: now, or noon on other days)
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum DoseCommands {
    /// Log a bolus dose
    Add {
        /// Insulin units
        units: f64,
        /// Meal: breakfast, lunch, afternoon_snack, snack, dinner, correction
        #[arg(short, long, default_value = "correction")]
        meal: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Local time (HH:MM; default: now, or noon on other days)
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BasalCommands {
    /// Set the basal dose, replacing any existing one for the day
    Set {
        /// Insulin units
        units: f64,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Local time (HH:MM; default: now, or noon on other days)
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum NotesCommands {
    /// Set the notes (omit the text to clear them)
    Set {
        text: Option<String>,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EntryCommands {
    /// Move an entry to a new time on the same day
    Move {
        /// Entry ID (shown by `glico show`)
        id: String,
        /// New local time (HH:MM)
        time: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove an entry
    Remove {
        /// Entry ID (shown by `glico show`)
        id: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Turn sync on and push every local day
    Enable {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn sync off (local data is kept)
    Disable {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync state and pending days
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push every local day now
    Push {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CompanionCommands {
    /// Show a day (or a month) from another account
    Show {
        /// Identity key to follow
        key: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        date: Option<String>,
        /// Show a month summary instead (YYYY-MM)
        #[arg(long, conflicts_with = "date")]
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Print the identity key
    Show {
        /// Also print it as a QR code
        #[arg(long)]
        qr: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("GLICO_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let Cli {
        remote,
        api_key,
        command,
    } = cli;

    match command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            let docs = DocumentStore::open(&config.documents_path)?;
            server::start_server(docs, port, &bind, api_key, new_api_key).await
        }
        command => {
            let remote = HttpRemoteStore::new(&remote, api_key)?;
            let svc =
                GlicoService::open(&config.db_path, Arc::new(remote), SyncOptions::default())?;
            run_client(&svc, command).await
        }
    }
}

async fn run_client(svc: &GlicoService, command: Commands) -> Result<()> {
    match command {
        Commands::Glucose {
            command:
                GlucoseCommands::Add {
                    value,
                    date,
                    time,
                    json,
                },
        } => cmd_glucose_add(svc, value, date.as_deref(), time.as_deref(), json).await,
        Commands::Dose {
            command:
                DoseCommands::Add {
                    units,
                    meal,
                    date,
                    time,
                    json,
                },
        } => cmd_dose_add(svc, units, &meal, date.as_deref(), time.as_deref(), json).await,
        Commands::Basal {
            command:
                BasalCommands::Set {
                    units,
                    date,
                    time,
                    json,
                },
        } => cmd_basal_set(svc, units, date.as_deref(), time.as_deref(), json).await,
        Commands::Notes {
            command: NotesCommands::Set { text, date, json },
        } => cmd_notes_set(svc, text, date.as_deref(), json).await,
        Commands::Entry { command } => match command {
            EntryCommands::Move {
                id,
                time,
                date,
                json,
            } => cmd_entry_move(svc, &id, &time, date.as_deref(), json).await,
            EntryCommands::Remove { id, date, json } => {
                cmd_entry_remove(svc, &id, date.as_deref(), json).await
            }
        },
        Commands::Show { date, json } => cmd_show(svc, date.as_deref(), json).await,
        Commands::Month { month, json } => cmd_month(svc, month.as_deref(), json).await,
        Commands::Sync { command } => match command {
            SyncCommands::Enable { json } => cmd_sync_enable(svc, json).await,
            SyncCommands::Disable { json } => cmd_sync_disable(svc, json),
            SyncCommands::Status { json } => cmd_sync_status(svc, json),
            SyncCommands::Push { json } => cmd_sync_push(svc, json).await,
        },
        Commands::Recover { key, json } => cmd_recover(svc, &key, json).await,
        Commands::Companion {
            command:
                CompanionCommands::Show {
                    key,
                    date,
                    month,
                    json,
                },
        } => cmd_companion_show(svc, &key, date.as_deref(), month.as_deref(), json).await,
        Commands::Key {
            command: KeyCommands::Show { qr, json },
        } => cmd_key_show(svc, qr, json),
        Commands::Serve { .. } => anyhow::bail!("`serve` does not use the local log"),
    }
}
