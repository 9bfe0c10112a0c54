use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tt_core::ipc::{
    decode_frame, encode_frame, AckPayload, ClientRole, HelloPayload, ThreadsView, WireEnvelope,
    WireMsg, DEFAULT_MAX_FRAME_BYTES,
};

/// Sends one viewer command to the hub and waits for its ack.
pub async fn send_command(
    socket_path: &Path,
    client_id: &str,
    msg: WireMsg,
    timeout: Duration,
) -> Result<AckPayload> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to hub at {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello = WireEnvelope::new(
        client_id,
        None,
        WireMsg::Hello(HelloPayload {
            client_id: client_id.to_string(),
            role: ClientRole::Viewer,
            capabilities: Vec::new(),
        }),
    );
    let request = WireEnvelope::request(client_id, msg);
    for envelope in [&hello, &request] {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)?;
        writer.write_all(&frame).await.context("failed to write to hub")?;
    }
    writer.flush().await.context("failed to flush hub socket")?;

    tokio::time::timeout(timeout, read_ack(&mut reader, request.request_id.as_deref()))
        .await
        .map_err(|_| anyhow!("no response from hub within {}ms", timeout.as_millis()))?
}

/// Asks the hub for the current threads with statuses derived at read time.
pub async fn fetch_view(
    socket_path: &Path,
    client_id: &str,
    timeout: Duration,
) -> Result<ThreadsView> {
    let ack = send_command(socket_path, client_id, WireMsg::ListThreads, timeout).await?;
    let message = ack.message.unwrap_or_default();
    if !ack.success {
        bail!("LIST_THREADS failed: {message}");
    }
    serde_json::from_str(&message).context("hub sent an unreadable thread view")
}

async fn read_ack<R>(reader: &mut BufReader<R>, request_id: Option<&str>) -> Result<AckPayload>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .context("failed to read from hub")?;
        if read == 0 {
            bail!("hub closed the connection");
        }
        let Ok(envelope) = decode_frame::<WireEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) else {
            continue;
        };
        if let WireMsg::Ack(ack) = envelope.msg {
            if envelope.request_id.as_deref() == request_id {
                return Ok(ack);
            }
        }
    }
}
