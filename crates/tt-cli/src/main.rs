mod client;
mod view;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tt_core::config;
use tt_core::ipc::{ThreadRef, ThreadsView, WireMsg};
use tt_core::{ScanFrequency, SettingsPatch, ThreadStatus};
use tt_storage::{load_settings, load_threads, SqliteStore};

#[derive(Parser)]
#[command(name = "tt")]
#[command(about = "thread-tracker viewer", long_about = None)]
struct Cli {
    /// Hub socket (falls back to TT_SOCKET).
    #[arg(long, global = true, default_value = "")]
    socket: String,
    /// Thread database (falls back to TT_DB).
    #[arg(long, global = true, default_value = "")]
    db: String,
    #[arg(long, global = true, default_value = "")]
    client_id: String,
    /// Seconds to wait for the hub to answer a command.
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tracked threads
    Threads {
        #[arg(long)]
        status: Option<ThreadStatus>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },
    /// Mark a thread resolved
    Resolve { id: String },
    /// Reactivate a resolved thread
    Reopen { id: String },
    /// Ask every connected observer for a fresh snapshot
    Scan,
}

#[derive(Subcommand)]
enum SettingsCommands {
    Show {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Set {
        #[arg(long)]
        notifications: Option<String>,
        #[arg(long)]
        threshold_days: Option<u32>,
        #[arg(long)]
        scan_frequency: Option<ScanFrequency>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout.max(1));

    match cli.command {
        Commands::Threads { status, json } => {
            let current = read_view(&cli.socket, &cli.client_id, &cli.db, timeout).await?;
            let now = chrono::Utc::now();
            let rows = view::thread_rows(current.threads, &current.settings, now, status);
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", view::render_table(&rows));
            }
        }
        Commands::Settings { action } => match action {
            SettingsCommands::Show { json } => {
                let settings = read_view(&cli.socket, &cli.client_id, &cli.db, timeout)
                    .await?
                    .settings;
                if json {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                } else {
                    print!("{}", view::render_settings(&settings));
                }
            }
            SettingsCommands::Set {
                notifications,
                threshold_days,
                scan_frequency,
            } => {
                let notifications_enabled = match notifications.as_deref() {
                    Some(value) => match config::parse_bool(value) {
                        Some(enabled) => Some(enabled),
                        None => bail!("--notifications expects on/off, got '{value}'"),
                    },
                    None => None,
                };
                let patch = SettingsPatch {
                    notifications_enabled,
                    stalled_threshold_days: threshold_days,
                    scan_frequency,
                };
                if patch.is_empty() {
                    bail!("nothing to change; pass --notifications, --threshold-days or --scan-frequency");
                }
                command(&cli.socket, &cli.client_id, WireMsg::UpdateSettings(patch), timeout).await?;
            }
        },
        Commands::Resolve { id } => {
            command(&cli.socket, &cli.client_id, WireMsg::ResolveThread(ThreadRef { id }), timeout)
                .await?;
        }
        Commands::Reopen { id } => {
            command(&cli.socket, &cli.client_id, WireMsg::ReopenThread(ThreadRef { id }), timeout)
                .await?;
        }
        Commands::Scan => {
            command(&cli.socket, &cli.client_id, WireMsg::ScanThreads, timeout).await?;
        }
    }

    Ok(())
}

/// Reads through the hub so a store outage is served from its last-known
/// copy; reads the database directly when no hub is listening.
async fn read_view(
    socket: &str,
    client_id: &str,
    db: &str,
    timeout: Duration,
) -> Result<ThreadsView> {
    let socket_path = config::resolve_socket_path(socket);
    let client_id = config::resolve_client_id(client_id, "viewer");
    match client::fetch_view(&socket_path, &client_id, timeout).await {
        Ok(current) => {
            if current.stale {
                eprintln!("warning: thread store unavailable; showing last-known state");
            }
            Ok(current)
        }
        Err(err) => {
            eprintln!("warning: {err:#}; reading the database directly");
            let store = open_store(db)?;
            Ok(ThreadsView {
                settings: load_settings(&store).await.context("Failed to read settings")?,
                threads: load_threads(&store).await.context("Failed to read threads")?,
                stale: false,
            })
        }
    }
}

fn open_store(flag: &str) -> Result<SqliteStore> {
    let path = config::resolve_db_path(flag);
    if !path.exists() {
        bail!("No thread database at {}; is tt-hub running?", path.display());
    }
    SqliteStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

async fn command(socket: &str, client_id: &str, msg: WireMsg, timeout: Duration) -> Result<()> {
    let socket_path = config::resolve_socket_path(socket);
    let client_id = config::resolve_client_id(client_id, "viewer");
    let kind = msg.kind();
    let ack = client::send_command(&socket_path, &client_id, msg, timeout).await?;
    let message = ack.message.unwrap_or_default();
    if !ack.success {
        bail!("{kind} failed: {message}");
    }
    if message.is_empty() {
        println!("{kind}: ok");
    } else {
        println!("{kind}: {message}");
    }
    Ok(())
}
