//! Unix-socket control API server.
//!
//! One task per connection; a connection carries any number of
//! request/response frame pairs. Store work is synchronous, so each
//! request is handled on the blocking pool.

use std::path::Path;
use std::sync::Arc;

use cocoon_core::error::{ApiError, ErrorCode};
use cocoon_core::ipc::{Envelope, IpcError, RequestFrame, frame_message, parse_frame_length};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::dispatch::Platform;

/// Binds the control socket, replacing a stale socket file.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Accept loop; runs until the listener fails.
///
/// # Errors
///
/// Returns the accept error that ended the loop.
pub async fn serve(listener: UnixListener, platform: Arc<Platform>) -> std::io::Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let platform = Arc::clone(&platform);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, platform).await {
                tracing::debug!(%err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    platform: Arc<Platform>,
) -> Result<(), IpcError> {
    loop {
        let Some(payload) = read_frame(&mut stream).await? else {
            return Ok(());
        };

        let envelope = match serde_json::from_slice::<RequestFrame>(&payload) {
            Ok(frame) => {
                let platform = Arc::clone(&platform);
                tokio::task::spawn_blocking(move || platform.handle(&frame))
                    .await
                    .map_err(|err| IpcError::Protocol(format!("handler panicked: {err}")))?
            },
            Err(err) => Envelope::error(&ApiError::new(
                ErrorCode::BadJson,
                format!("malformed request frame: {err}"),
            )),
        };

        let bytes = serde_json::to_vec(&envelope)?;
        stream.write_all(&frame_message(&bytes)).await?;
    }
}

/// Reads one length-prefixed frame; `None` on clean end of stream.
async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, IpcError> {
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {},
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = parse_frame_length(&prefix)?
        .ok_or_else(|| IpcError::Protocol("incomplete length prefix".to_string()))?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Sends one request over an open client connection and awaits the
/// response envelope.
///
/// # Errors
///
/// Returns an error on I/O or framing failure.
pub async fn call(stream: &mut UnixStream, frame: &RequestFrame) -> Result<Envelope, IpcError> {
    let bytes = serde_json::to_vec(frame)?;
    stream.write_all(&frame_message(&bytes)).await?;
    let payload = read_frame(stream)
        .await?
        .ok_or_else(|| IpcError::Protocol("server closed the connection".to_string()))?;
    Ok(serde_json::from_slice(&payload)?)
}
