use crate::coordinator::Coordinator;
#[cfg(unix)]
use crate::coordinator::{CoordinatorError, Transition};
use std::{io, path::PathBuf, sync::Arc, time::Duration};
#[cfg(unix)]
use std::{
    collections::{HashMap, VecDeque},
    fs,
    os::unix::fs::PermissionsExt,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};
#[cfg(unix)]
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixListener, UnixStream,
    },
    sync::{mpsc, Notify, RwLock},
};
use tokio::sync::watch;
#[cfg(unix)]
use tracing::{debug, info, warn};
#[cfg(unix)]
use tt_core::ipc::{
    decode_frame, encode_frame, unrecognized_type, AckPayload, ClientRole, ThreadRef,
    WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_BYTES, HUB_SENDER_ID,
};
#[cfg(unix)]
use tt_core::{ScanFrequency, SettingsPatch};

#[cfg(unix)]
const ACK_CACHE_MAX: usize = 512;
#[cfg(unix)]
const ACK_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl HubConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
        }
    }
}

#[cfg(not(unix))]
pub async fn run(
    _config: HubConfig,
    _coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn run(
    config: HubConfig,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    let hub = Arc::new(Hub::new(config.clone(), coordinator));
    hub.clone().spawn_scheduler(shutdown.clone());

    info!(
        event = "hub_start",
        socket = %config.socket_path.display(),
        queue_capacity = config.queue_capacity
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            hub.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "hub_accept_error", error = %err);
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "hub_stop");
    Ok(())
}

#[cfg(unix)]
#[derive(Clone)]
struct ClientEntry {
    client_id: String,
    role: ClientRole,
    sender: mpsc::Sender<WireEnvelope>,
}

#[cfg(unix)]
struct AckCacheEntry {
    envelope: WireEnvelope,
    stored_at: Instant,
}

#[cfg(unix)]
struct Hub {
    config: HubConfig,
    coordinator: Arc<Coordinator>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, ClientEntry>>,
    ack_cache: RwLock<HashMap<String, AckCacheEntry>>,
    ack_cache_order: RwLock<VecDeque<String>>,
    settings_changed: Notify,
}

#[cfg(unix)]
impl Hub {
    fn new(config: HubConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            ack_cache: RwLock::new(HashMap::new()),
            ack_cache_order: RwLock::new(VecDeque::new()),
            settings_changed: Notify::new(),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hub-conn-{id}")
    }

    async fn register_client(&self, conn_id: &str, client: ClientEntry) {
        info!(
            event = "hub_client_connected",
            conn_id = conn_id,
            client_id = %client.client_id,
            role = ?client.role
        );
        self.clients.write().await.insert(conn_id.to_string(), client);
    }

    async fn unregister_client(&self, conn_id: &str) {
        if self.clients.write().await.remove(conn_id).is_some() {
            info!(event = "hub_client_disconnected", conn_id = conn_id);
        }
    }

    /// Forwards a rescan request to every connected observer and returns how
    /// many accepted it.
    async fn broadcast_scan(&self) -> usize {
        let observers = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(_, client)| client.role == ClientRole::Observer)
            .map(|(conn_id, client)| (conn_id.clone(), client.sender.clone()))
            .collect::<Vec<_>>();

        let mut reached = 0;
        let mut dead = Vec::new();
        for (conn_id, sender) in observers {
            match offer_scan(&sender) {
                ScanOffer::Queued => reached += 1,
                ScanOffer::Closed => dead.push(conn_id),
                // Still connected; it gets the next round.
                ScanOffer::Skipped => warn!(event = "hub_slow_observer", conn_id = %conn_id),
            }
        }
        for conn_id in dead {
            self.unregister_client(&conn_id).await;
        }
        debug!(event = "hub_scan_broadcast", reached = reached);
        reached
    }

    async fn scan_interval(&self) -> Duration {
        match self.coordinator.settings().await {
            Ok(settings) => settings.scan_frequency.interval(),
            Err(err) => {
                warn!(event = "hub_scan_interval_fallback", error = %err);
                ScanFrequency::default().interval()
            }
        }
    }

    async fn scheduled_tick(&self) {
        match self.coordinator.refresh().await {
            Ok(transitions) => {
                debug!(event = "hub_scheduled_refresh", transitions = transitions.len());
            }
            Err(err) => {
                warn!(event = "hub_scheduled_refresh_failed", error = %err);
            }
        }
        self.broadcast_scan().await;
    }

    /// Runs a refresh and rescan at startup, then once per `scanFrequency`.
    /// A settings change re-arms the timer against the new interval.
    fn spawn_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            self.scheduled_tick().await;
            let mut last_tick = tokio::time::Instant::now();
            loop {
                let deadline = last_tick + self.scan_interval().await;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        self.scheduled_tick().await;
                        last_tick = tokio::time::Instant::now();
                    }
                    _ = self.settings_changed.notified() => {
                        debug!(event = "hub_scheduler_rearmed");
                    }
                }
            }
        });
    }

    fn ack_cache_key(client_id: &str, request_id: &str) -> String {
        format!("{client_id}:{request_id}")
    }

    async fn cached_ack(&self, client_id: &str, request_id: &str) -> Option<WireEnvelope> {
        let key = Self::ack_cache_key(client_id, request_id);
        {
            let cache = self.ack_cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.stored_at.elapsed() <= ACK_CACHE_TTL {
                    return Some(entry.envelope.clone());
                }
            }
        }
        self.ack_cache.write().await.remove(&key);
        None
    }

    async fn cache_ack(&self, client_id: &str, request_id: &str, envelope: WireEnvelope) {
        let key = Self::ack_cache_key(client_id, request_id);
        self.ack_cache.write().await.insert(
            key.clone(),
            AckCacheEntry {
                envelope,
                stored_at: Instant::now(),
            },
        );
        let mut evicted = Vec::new();
        {
            let mut order = self.ack_cache_order.write().await;
            order.push_back(key);
            while order.len() > ACK_CACHE_MAX {
                if let Some(oldest) = order.pop_front() {
                    evicted.push(oldest);
                }
            }
        }
        let mut cache = self.ack_cache.write().await;
        for oldest in evicted {
            cache.remove(&oldest);
        }
        cache.retain(|_, entry| entry.stored_at.elapsed() <= ACK_CACHE_TTL);
    }

    async fn handle_request(&self, client_id: &str, role: ClientRole, msg: WireMsg) -> AckPayload {
        match (role, msg) {
            (ClientRole::Observer, WireMsg::ThreadsUpdated(entries)) => {
                match self.coordinator.receive(entries, client_id).await {
                    Ok(report) => AckPayload::ok_with(format!(
                        "merged {} of {} entries",
                        report.received - report.dropped,
                        report.received
                    )),
                    Err(err) => AckPayload::failed(err.to_string()),
                }
            }
            (ClientRole::Viewer, WireMsg::ScanThreads) => {
                let reached = self.broadcast_scan().await;
                if reached > 0 {
                    AckPayload::ok_with(format!("scan requested from {reached} observer(s)"))
                } else {
                    AckPayload::failed("no observer connected")
                }
            }
            (ClientRole::Viewer, WireMsg::ResolveThread(ThreadRef { id })) => {
                transition_ack(self.coordinator.resolve(&id).await)
            }
            (ClientRole::Viewer, WireMsg::ReopenThread(ThreadRef { id })) => {
                transition_ack(self.coordinator.reopen(&id).await)
            }
            (ClientRole::Viewer, WireMsg::UpdateSettings(patch)) => self.update_settings(&patch).await,
            (ClientRole::Viewer, WireMsg::ListThreads) => {
                let view = self.coordinator.threads_view().await;
                match serde_json::to_string(&view) {
                    Ok(json) => AckPayload::ok_with(json),
                    Err(err) => AckPayload::failed(err.to_string()),
                }
            }
            (role, msg) => AckPayload::failed(format!(
                "{} is not accepted from {}",
                msg.kind(),
                role_name(role)
            )),
        }
    }

    async fn update_settings(&self, patch: &SettingsPatch) -> AckPayload {
        match self.coordinator.update_settings(patch).await {
            Ok(settings) => {
                self.settings_changed.notify_one();
                match serde_json::to_string(&settings) {
                    Ok(json) => AckPayload::ok_with(json),
                    Err(_) => AckPayload::ok(),
                }
            }
            Err(err) => AckPayload::failed(err.to_string()),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        let (reader_half, writer_half) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        let Some(hello) = read_next_valid_frame(&mut reader).await else {
            return;
        };

        if hello.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "hub_unsupported_version",
                conn_id = %conn_id,
                version = hello.version.0
            );
            return;
        }

        let first_kind = hello.msg.kind();
        let WireMsg::Hello(payload) = hello.msg else {
            warn!(event = "hub_expected_hello", conn_id = %conn_id, kind = first_kind);
            return;
        };
        let client_id = if payload.client_id.trim().is_empty() {
            conn_id.clone()
        } else {
            payload.client_id.clone()
        };
        let role = payload.role;

        let (tx, rx) = mpsc::channel::<WireEnvelope>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let writer_task = tokio::spawn(async move {
            writer_loop(conn_for_writer, writer_half, rx, write_timeout).await;
        });

        self.register_client(
            &conn_id,
            ClientEntry {
                client_id: client_id.clone(),
                role,
                sender: tx.clone(),
            },
        )
        .await;

        loop {
            let Some(envelope) = read_next_valid_frame(&mut reader).await else {
                break;
            };
            if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
                warn!(
                    event = "hub_skip_version",
                    conn_id = %conn_id,
                    version = envelope.version.0
                );
                continue;
            }

            match envelope.msg {
                WireMsg::Ack(ack) => {
                    debug!(
                        event = "hub_ack_received",
                        conn_id = %conn_id,
                        request_id = envelope.request_id.as_deref().unwrap_or_default(),
                        success = ack.success
                    );
                    continue;
                }
                WireMsg::Unknown => {
                    debug!(event = "hub_ignored_message", conn_id = %conn_id);
                    continue;
                }
                WireMsg::Hello(_) => {
                    warn!(event = "hub_unexpected_hello", conn_id = %conn_id);
                    continue;
                }
                _ => {}
            }

            let request_id = envelope.request_id.clone();
            if let Some(request_id) = request_id.as_deref() {
                if let Some(cached) = self.cached_ack(&client_id, request_id).await {
                    debug!(event = "hub_ack_cache_hit", conn_id = %conn_id, request_id = request_id);
                    if tx.send(cached).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let kind = envelope.msg.kind();
            let ack = self.handle_request(&client_id, role, envelope.msg).await;
            if !ack.success {
                debug!(
                    event = "hub_request_rejected",
                    conn_id = %conn_id,
                    kind = kind,
                    message = ack.message.as_deref().unwrap_or_default()
                );
            }
            let reply = WireEnvelope::ack(HUB_SENDER_ID, request_id.clone(), ack);
            if let Some(request_id) = request_id.as_deref() {
                self.cache_ack(&client_id, request_id, reply.clone()).await;
            }
            if tx.send(reply).await.is_err() {
                break;
            }
        }

        self.unregister_client(&conn_id).await;
        drop(tx);
        let _ = writer_task.await;
    }
}

#[cfg(unix)]
fn transition_ack(result: Result<Option<Transition>, CoordinatorError>) -> AckPayload {
    match result {
        Ok(Some(transition)) => {
            AckPayload::ok_with(format!("{} -> {}", transition.from, transition.to))
        }
        Ok(None) => AckPayload::ok_with("unchanged"),
        Err(err) => AckPayload::failed(err.to_string()),
    }
}

#[cfg(unix)]
fn role_name(role: ClientRole) -> &'static str {
    match role {
        ClientRole::Observer => "observer",
        ClientRole::Viewer => "viewer",
    }
}

#[cfg(unix)]
async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WireEnvelope>,
    write_timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_encode_error", conn_id = %conn_id, error = %err);
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
                debug!(event = "hub_write_error", conn_id = %conn_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "hub_write_timeout", conn_id = %conn_id);
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<WireEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => match unrecognized_type(&line) {
                Some(kind) => debug!(event = "hub_ignored_message", kind = %kind),
                None => warn!(event = "hub_decode_error", error = %err),
            },
        }
    }
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOffer {
    Queued,
    Skipped,
    Closed,
}

#[cfg(unix)]
fn offer_scan(sender: &mpsc::Sender<WireEnvelope>) -> ScanOffer {
    let envelope = WireEnvelope::request(HUB_SENDER_ID, WireMsg::ScanThreads);
    match sender.try_send(envelope) {
        Ok(()) => ScanOffer::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => ScanOffer::Skipped,
        Err(mpsc::error::TrySendError::Closed(_)) => ScanOffer::Closed,
    }
}
