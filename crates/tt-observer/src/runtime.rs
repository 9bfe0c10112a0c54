use crate::debounce::Debouncer;
use crate::source::{SourceError, ThreadSource};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixStream,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tt_core::ipc::{
    decode_frame, encode_frame, new_request_id, unrecognized_type, AckPayload, ClientRole,
    FrameError, HelloPayload, WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use tt_core::ThreadRecord;

const EVENT_QUEUE_CAPACITY: usize = 64;
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub client_id: String,
    pub socket_path: PathBuf,
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    pub debounce: Duration,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
}

impl ObserverConfig {
    pub fn new(client_id: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client_id: client_id.into(),
            socket_path: socket_path.into(),
            ack_timeout: Duration::from_secs(3),
            max_attempts: 3,
            debounce: Duration::from_millis(500),
            queue_capacity: 32,
            write_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("source scan failed: {0}")]
    Source(#[from] SourceError),
    #[error("snapshot frame rejected: {0}")]
    Frame(#[from] FrameError),
    #[error("not connected to hub")]
    Disconnected,
    #[error("no ack after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    ContextChanged(String),
    Rescan,
}

/// Host-facing side of an observer. Cheap to clone and callable from any
/// thread, including non-async callbacks.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    tx: mpsc::Sender<ObserverEvent>,
}

impl ObserverHandle {
    /// Signals that the visible set of threads may have changed. Bursts are
    /// collapsed by the debounce window.
    pub fn context_changed(&self, reason: impl Into<String>) -> bool {
        self.push(ObserverEvent::ContextChanged(reason.into()))
    }

    /// Asks for an immediate snapshot, bypassing the debounce window.
    pub fn request_rescan(&self) -> bool {
        self.push(ObserverEvent::Rescan)
    }

    fn push(&self, event: ObserverEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(event = "observer_event_dropped", kind = ?event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<AckPayload>>>>;

/// Sends snapshots and waits for their acks. Each request id resolves at most
/// once; a timed-out attempt is resent with the same id so the hub can answer
/// a duplicate from its ack cache.
#[derive(Clone)]
pub struct Emitter {
    client_id: String,
    out: mpsc::Sender<WireEnvelope>,
    pending: PendingAcks,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl Emitter {
    pub fn new(
        client_id: impl Into<String>,
        out: mpsc::Sender<WireEnvelope>,
        ack_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            out,
            pending: Arc::new(Mutex::new(HashMap::new())),
            ack_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Routes an incoming ack to its waiting emission. Returns false for
    /// unknown or already-resolved request ids.
    pub async fn resolve(&self, request_id: &str, ack: AckPayload) -> bool {
        match self.pending.lock().await.remove(request_id) {
            Some(waiter) => waiter.send(ack).is_ok(),
            None => false,
        }
    }

    pub async fn emit(&self, threads: &[ThreadRecord]) -> Result<AckPayload, EmitError> {
        let entries = threads
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()
            .map_err(|err| FrameError::Encode(err.to_string()))?;
        let request_id = new_request_id();
        let envelope = WireEnvelope::new(
            self.client_id.clone(),
            Some(request_id.clone()),
            WireMsg::ThreadsUpdated(entries),
        );
        encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES)?;

        for attempt in 1..=self.max_attempts {
            let (waiter, ack) = oneshot::channel();
            self.pending.lock().await.insert(request_id.clone(), waiter);
            if self.out.send(envelope.clone()).await.is_err() {
                self.pending.lock().await.remove(&request_id);
                return Err(EmitError::Disconnected);
            }
            match tokio::time::timeout(self.ack_timeout, ack).await {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(_)) => return Err(EmitError::Disconnected),
                Err(_) => {
                    warn!(
                        event = "snapshot_ack_timeout",
                        request_id = %request_id,
                        attempt = attempt,
                        max_attempts = self.max_attempts
                    );
                }
            }
        }
        self.pending.lock().await.remove(&request_id);
        Err(EmitError::Timeout {
            attempts: self.max_attempts,
        })
    }

    async fn abandon_all(&self) {
        self.pending.lock().await.clear();
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

enum Inbound {
    Rescan,
}

/// Connection-owning half of an observer.
pub struct Observer<S: ThreadSource + 'static> {
    config: ObserverConfig,
    source: Arc<S>,
    events: mpsc::Receiver<ObserverEvent>,
}

impl<S: ThreadSource + 'static> Observer<S> {
    pub fn new(config: ObserverConfig, source: Arc<S>) -> (Self, ObserverHandle) {
        let (tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        (
            Self {
                config,
                source,
                events,
            },
            ObserverHandle { tx },
        )
    }

    /// Keeps a hub connection alive until shutdown, reconnecting with
    /// exponential backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect().await {
                Ok(stream) => {
                    backoff = Duration::from_secs(1);
                    info!(
                        event = "observer_connected",
                        client_id = %self.config.client_id,
                        socket = %self.config.socket_path.display()
                    );
                    if let SessionEnd::Shutdown = self.session(stream, &mut shutdown).await {
                        return;
                    }
                    warn!(event = "observer_disconnected", client_id = %self.config.client_id);
                }
                Err(err) => {
                    warn!(
                        event = "observer_connect_error",
                        socket = %self.config.socket_path.display(),
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64
                    );
                }
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
    }

    async fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.config.socket_path).await
    }

    async fn session(
        &mut self,
        stream: UnixStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (reader_half, writer_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let writer_task = tokio::spawn(writer_loop(
            self.config.client_id.clone(),
            writer_half,
            out_rx,
            self.config.write_timeout,
        ));

        let hello = WireEnvelope::new(
            self.config.client_id.clone(),
            None,
            WireMsg::Hello(HelloPayload {
                client_id: self.config.client_id.clone(),
                role: ClientRole::Observer,
                capabilities: vec!["threads_updated".to_string(), "scan_threads".to_string()],
            }),
        );
        if out_tx.send(hello).await.is_err() {
            writer_task.abort();
            return SessionEnd::Disconnected;
        }

        let emitter = Emitter::new(
            self.config.client_id.clone(),
            out_tx.clone(),
            self.config.ack_timeout,
            self.config.max_attempts,
        );
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(EVENT_QUEUE_CAPACITY);
        let reader_task = tokio::spawn(reader_loop(
            self.config.client_id.clone(),
            BufReader::new(reader_half),
            emitter.clone(),
            out_tx.clone(),
            inbound_tx,
        ));

        let mut debouncer = Debouncer::new(self.config.debounce);
        let mut inflight: Option<JoinHandle<()>> = None;
        // Every (re)connect starts with a full snapshot.
        let mut queued = true;
        let mut events_open = true;

        let end = loop {
            if queued && inflight.is_none() {
                queued = false;
                inflight = Some(spawn_emission(emitter.clone(), self.source.clone()));
            }
            let deadline = debouncer.deadline();

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(Inbound::Rescan) => {
                            debouncer.cancel();
                            queued = true;
                        }
                        None => break SessionEnd::Disconnected,
                    }
                }
                event = self.events.recv(), if events_open => {
                    match event {
                        Some(ObserverEvent::ContextChanged(reason)) => {
                            debouncer.trigger(reason, tokio::time::Instant::now());
                        }
                        Some(ObserverEvent::Rescan) => {
                            debug!(event = "observer_rescan_requested");
                            debouncer.cancel();
                            queued = true;
                        }
                        None => events_open = false,
                    }
                }
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    if let Some((reason, collapsed)) = debouncer.poll(tokio::time::Instant::now()) {
                        debug!(event = "observer_context_changed", reason = %reason, collapsed = collapsed);
                        queued = true;
                    }
                }
                _ = join_inflight(&mut inflight), if inflight.is_some() => {
                    inflight = None;
                }
            }
        };

        if let Some(handle) = inflight.take() {
            handle.abort();
        }
        emitter.abandon_all().await;
        reader_task.abort();
        drop(emitter);
        drop(out_tx);
        let _ = writer_task.await;
        end
    }
}

fn spawn_emission<S: ThreadSource + 'static>(emitter: Emitter, source: Arc<S>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match scan_and_emit(&emitter, source.as_ref()).await {
            Ok((count, ack)) if ack.success => {
                info!(event = "snapshot_acked", threads = count);
            }
            Ok((count, ack)) => {
                warn!(
                    event = "snapshot_rejected",
                    threads = count,
                    message = ack.message.as_deref().unwrap_or_default()
                );
            }
            Err(err) => {
                warn!(event = "snapshot_emit_failed", error = %err);
            }
        }
    })
}

async fn scan_and_emit<S: ThreadSource>(
    emitter: &Emitter,
    source: &S,
) -> Result<(usize, AckPayload), EmitError> {
    let threads = source.scan().await?;
    let ack = emitter.emit(&threads).await?;
    Ok((threads.len(), ack))
}

async fn join_inflight(inflight: &mut Option<JoinHandle<()>>) {
    match inflight.as_mut() {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn reader_loop(
    client_id: String,
    mut reader: BufReader<OwnedReadHalf>,
    emitter: Emitter,
    out: mpsc::Sender<WireEnvelope>,
    inbound: mpsc::Sender<Inbound>,
) {
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(event = "observer_read_error", error = %err);
                return;
            }
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        let envelope = match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => envelope,
            Err(err) => {
                match unrecognized_type(&line) {
                    Some(kind) => debug!(event = "observer_ignored_message", kind = %kind),
                    None => warn!(event = "observer_decode_error", error = %err),
                }
                continue;
            }
        };
        match envelope.msg {
            WireMsg::Ack(ack) => {
                let Some(request_id) = envelope.request_id else {
                    continue;
                };
                if !emitter.resolve(&request_id, ack).await {
                    debug!(event = "observer_stale_ack", request_id = %request_id);
                }
            }
            WireMsg::ScanThreads => {
                let reply = WireEnvelope::ack(client_id.clone(), envelope.request_id, AckPayload::ok());
                if out.send(reply).await.is_err() || inbound.send(Inbound::Rescan).await.is_err() {
                    return;
                }
            }
            other => {
                debug!(event = "observer_ignored_message", kind = other.kind());
            }
        }
    }
}

async fn writer_loop(
    client_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "observer_encode_error", client_id = %client_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(event = "observer_write_error", client_id = %client_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "observer_write_timeout", client_id = %client_id);
                break;
            }
        }
    }
}

pub fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
