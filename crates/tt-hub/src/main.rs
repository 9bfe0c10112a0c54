use clap::{Parser, ValueEnum};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use tt_core::config;
use tt_hub::{
    AlertSurface, Coordinator, DesktopAlertSurface, HubConfig, MemoryAlertSurface, Notifier,
};
use tt_storage::{SqliteStore, Store};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AlertMode {
    /// Keep alerts in memory and log them.
    Log,
    /// Show alerts through `notify-send`.
    Desktop,
}

#[derive(Parser, Debug)]
#[command(name = "tt-hub", about = "thread-tracker coordinator hub")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, value_enum, default_value_t = AlertMode::Log)]
    alerts: AlertMode,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    socket_path: PathBuf,
    db_path: PathBuf,
    log_dir: String,
    log_stdout: bool,
    debug: bool,
    alerts: AlertMode,
    write_timeout: Duration,
    queue_capacity: usize,
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        socket_path: config::resolve_socket_path(&args.socket),
        db_path: config::resolve_db_path(&args.db),
        log_dir: config::resolve_log_dir(&args.log_dir),
        log_stdout: config::resolve_log_stdout(true),
        debug: args.debug,
        alerts: args.alerts,
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity.max(1),
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let store: Arc<dyn Store> = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "store_open_failed", path = %config.db_path.display(), error = %err);
            return;
        }
    };
    let surface: Arc<dyn AlertSurface> = match config.alerts {
        AlertMode::Log => Arc::new(MemoryAlertSurface::new()),
        AlertMode::Desktop => Arc::new(DesktopAlertSurface::default()),
    };
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        Notifier::new(store, surface),
    ));
    // An unreachable store at startup is not fatal; merges ack failure until
    // it comes back.
    if let Err(err) = coordinator.initialize().await {
        error!(event = "coordinator_init_failed", error = %err);
    }

    info!(
        event = "hub_config",
        socket = %config.socket_path.display(),
        db = %config.db_path.display(),
        alerts = ?config.alerts
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    let hub_config = HubConfig {
        socket_path: config.socket_path.clone(),
        write_timeout: config.write_timeout,
        queue_capacity: config.queue_capacity,
    };
    if let Err(err) = tt_hub::run(hub_config, coordinator, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else {
        config::resolve_log_level()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(stdout, file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: Option<io::Stdout>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(stdout: bool, file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: stdout.then(io::stdout),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("tt-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
