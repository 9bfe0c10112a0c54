#[cfg(unix)]
use clap::Parser;
#[cfg(unix)]
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
#[cfg(unix)]
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
#[cfg(unix)]
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
#[cfg(unix)]
use tracing::{info, warn};
#[cfg(unix)]
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
#[cfg(unix)]
use tt_core::config;
#[cfg(unix)]
use tt_observer::{
    sample_threads, JsonFileSource, Observer, ObserverConfig, ObserverHandle, StaticSource,
    ThreadSource,
};

#[cfg(unix)]
#[derive(Parser, Debug)]
#[command(name = "tt-observer", about = "thread-tracker observer")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    client_id: String,
    /// JSON array of thread records, re-read on every scan and watched for
    /// changes. Without it the observer reports a built-in demo mailbox.
    #[arg(long)]
    threads_file: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    debounce_ms: u64,
    #[arg(long, default_value_t = 3000)]
    ack_timeout_ms: u64,
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    /// Read host events from stdin: `rescan`, or any other line as a
    /// context-change reason.
    #[arg(long, default_value_t = false)]
    stdin_events: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[cfg(not(unix))]
fn main() {
    eprintln!("tt-observer requires unix domain sockets");
}

#[cfg(unix)]
#[tokio::main]
async fn main() {
    let args = Args::parse();
    let client_id = config::resolve_client_id(&args.client_id, "observer");
    let _log_guard = init_logging(&args, &client_id);

    let mut observer_config =
        ObserverConfig::new(client_id.clone(), config::resolve_socket_path(&args.socket));
    observer_config.debounce = Duration::from_millis(args.debounce_ms);
    observer_config.ack_timeout = Duration::from_millis(args.ack_timeout_ms.max(1));
    observer_config.max_attempts = args.max_attempts.max(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "observer_shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "observer_start",
        client_id = %client_id,
        socket = %observer_config.socket_path.display()
    );

    match args.threads_file.clone() {
        Some(path) => {
            let source = Arc::new(JsonFileSource::new(path.clone()));
            let (observer, handle) = Observer::new(observer_config, source);
            let _watcher = watch_threads_file(&path, handle.clone());
            run_with_events(observer, handle, args.stdin_events, shutdown_rx).await;
        }
        None => {
            let source = Arc::new(StaticSource::new(sample_threads(chrono::Utc::now())));
            let (observer, handle) = Observer::new(observer_config, source);
            run_with_events(observer, handle, args.stdin_events, shutdown_rx).await;
        }
    }
}

#[cfg(unix)]
async fn run_with_events<S: ThreadSource + 'static>(
    observer: Observer<S>,
    handle: ObserverHandle,
    stdin_events: bool,
    shutdown: watch::Receiver<bool>,
) {
    if stdin_events {
        tokio::spawn(stdin_event_loop(handle));
    }
    observer.run(shutdown).await;
}

#[cfg(unix)]
async fn stdin_event_loop(handle: ObserverHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("rescan") {
            handle.request_rescan();
        } else {
            handle.context_changed(line);
        }
    }
}

#[cfg(unix)]
fn watch_threads_file(path: &Path, handle: ObserverHandle) -> Option<RecommendedWatcher> {
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() {
                handle.context_changed("threads file changed");
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "threads_file_watch_failed", error = %err);
            return None;
        }
    };
    let target = match path.parent() {
        Some(parent) if parent.exists() => parent,
        _ => path,
    };
    if let Err(err) = watcher.watch(target, RecursiveMode::NonRecursive) {
        warn!(event = "threads_file_watch_failed", path = %target.display(), error = %err);
        return None;
    }
    Some(watcher)
}

#[cfg(unix)]
fn init_logging(args: &Args, client_id: &str) -> Option<LogGuard> {
    let level = if args.debug {
        "debug".to_string()
    } else {
        config::resolve_log_level()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let log_dir = config::resolve_log_dir(&args.log_dir);
    let writer = match open_log_file(&log_dir, client_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout = config::resolve_log_stdout(true);
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

#[cfg(unix)]
struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

#[cfg(unix)]
struct MultiWriter {
    stdout: Option<io::Stdout>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

#[cfg(unix)]
impl MultiWriter {
    fn new(stdout: bool, file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: stdout.then(io::stdout),
            file,
        }
    }
}

#[cfg(unix)]
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

#[cfg(unix)]
fn open_log_file(log_dir: &str, client_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let name = format!("tt-observer-{}.log", config::sanitize_component(client_id));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(name))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
