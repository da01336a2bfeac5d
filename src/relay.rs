//! Bidirectional relay between a local socket and the remote tunnel.
//!
//! # Overview
//!
//! [`relay`] runs two tasks for one connection pair:
//! - local → remote: reads up to [`CHUNK_SIZE`] bytes from the local socket
//!   and sends each read as exactly one remote message
//! - remote → local: receives one remote message at a time and writes all of
//!   it to the local socket
//!
//! The first task to see EOF, an empty message, a timeout or an error closes
//! the halves it owns and raises a shared close signal. The sibling wakes on
//! that signal whether it is waiting to read or blocked on a write, and
//! closes its own halves, so both endpoints are always torn down together.
//! Errors never leave a pump; they are logged and end the relay for this
//! connection pair only.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time;

use crate::TunnelError;

/// Maximum number of bytes read from the local socket per remote message.
pub const CHUNK_SIZE: usize = 4096;

/// How long closing the remote sink may take before it is abandoned.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Statistics from a completed relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes received from the remote and written to the local client
    pub bytes_downloaded: u64,
    /// Bytes read from the local client and sent to the remote
    pub bytes_uploaded: u64,
}

/// One-shot signal shared by the two pumps of a connection pair.
#[derive(Clone)]
struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Resolves once [`trigger`](Self::trigger) has been called by either pump.
    async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Relays data between a local connection and a remote tunnel connection
/// until either side terminates.
///
/// Returns once both pump tasks have stopped. Every failure is logged and
/// absorbed; the caller only sees the byte counts.
///
/// # Arguments
///
/// * `local_read` / `local_write` - The two halves of the local socket
/// * `remote_sink` - Receives one item per local read
/// * `remote_stream` - Yields remote messages; `None` or an empty item ends the relay
/// * `read_timeout` - Maximum wait for local data; `None` waits forever
/// * `index` - Connection counter used to tag log events
pub async fn relay<R, W, S, T>(
    local_read: R,
    local_write: W,
    remote_sink: S,
    remote_stream: T,
    read_timeout: Option<Duration>,
    index: u64,
) -> RelayStats
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Sink<Bytes, Error = TunnelError> + Unpin + Send + 'static,
    T: Stream<Item = Result<Bytes, TunnelError>> + Unpin + Send + 'static,
{
    let closed = CloseSignal::new();

    // One task per direction, sharing the close signal
    let upload_handle = tokio::spawn(pump_local_to_remote(
        local_read,
        remote_sink,
        read_timeout,
        closed.clone(),
        index,
    ));
    let download_handle =
        tokio::spawn(pump_remote_to_local(remote_stream, local_write, closed, index));
    tracing::info!(index, "Both debugger and websocket pumps started");

    // Wait for both, so neither endpoint outlives the relay
    let (upload_result, download_result) = tokio::join!(upload_handle, download_handle);
    tracing::info!(index, "Both debugger and websocket pumps stopped");

    let bytes_uploaded = upload_result.unwrap_or_else(|e| {
        tracing::warn!(index, error = %e, "Upload task panicked");
        0
    });
    let bytes_downloaded = download_result.unwrap_or_else(|e| {
        tracing::warn!(index, error = %e, "Download task panicked");
        0
    });

    RelayStats { bytes_downloaded, bytes_uploaded }
}

/// Reads one chunk from the local socket, bounded by `read_timeout`.
async fn read_chunk<R>(
    local: &mut R,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> Result<usize, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let read = match read_timeout {
        Some(limit) => time::timeout(limit, local.read(buf))
            .await
            .map_err(|_| TunnelError::Timeout)?,
        None => local.read(buf).await,
    };
    read.map_err(|e| TunnelError::TransportError(e.to_string().into()))
}

/// Pumps data from the local socket to the remote tunnel.
async fn pump_local_to_remote<R, S>(
    mut local: R,
    mut remote: S,
    read_timeout: Option<Duration>,
    mut closed: CloseSignal,
    index: u64,
) -> u64
where
    R: AsyncRead + Unpin,
    S: Sink<Bytes, Error = TunnelError> + Unpin,
{
    let mut total_bytes = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    let outcome: Result<(), TunnelError> = loop {
        tracing::debug!(index, "Waiting for debugger data");
        let read = tokio::select! {
            _ = closed.triggered() => break Ok(()),
            read = read_chunk(&mut local, &mut buf, read_timeout) => read,
        };
        match read {
            Ok(0) => {
                tracing::warn!(index, "Client disconnected");
                break Ok(());
            }
            Ok(n) => {
                tracing::info!(index, nbytes = n, "Received debugger data");
                // A sink stalled on backpressure is abandoned once the sibling closes
                let sent = tokio::select! {
                    _ = closed.triggered() => break Ok(()),
                    sent = remote.send(Bytes::copy_from_slice(&buf[..n])) => sent,
                };
                if let Err(e) = sent {
                    break Err(e);
                }
                total_bytes += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = outcome {
        tracing::warn!(index, error = %e, "Error relaying debugger data to websocket");
    }
    closed.trigger();

    // Closing flushes the sink, so it is bounded as well
    if let Ok(Err(e)) = time::timeout(CLOSE_GRACE, remote.close()).await {
        tracing::debug!(index, error = %e, "Websocket already closed");
    }

    total_bytes
}

/// Pumps messages from the remote tunnel to the local socket.
async fn pump_remote_to_local<T, W>(
    mut remote: T,
    mut local: W,
    mut closed: CloseSignal,
    index: u64,
) -> u64
where
    T: Stream<Item = Result<Bytes, TunnelError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total_bytes = 0u64;

    let outcome: Result<(), TunnelError> = loop {
        tracing::debug!(index, "Waiting for websocket data");
        let message = tokio::select! {
            _ = closed.triggered() => break Ok(()),
            message = remote.next() => message,
        };
        // An empty message from the remote means end of stream
        let data = match message {
            Some(Ok(data)) if !data.is_empty() => data,
            Some(Ok(_)) | None => {
                tracing::info!(index, "Websocket disconnected");
                break Ok(());
            }
            Some(Err(e)) => break Err(e),
        };
        tracing::info!(index, nbytes = data.len(), "Received websocket data");
        // A client that stopped reading must not pin this task after the sibling closes
        let written = tokio::select! {
            _ = closed.triggered() => break Ok(()),
            written = write_message(&mut local, &data) => written,
        };
        if let Err(e) = written {
            break Err(TunnelError::TransportError(e.to_string().into()));
        }
        total_bytes += data.len() as u64;
    };

    if let Err(e) = outcome {
        tracing::warn!(index, error = %e, "Error relaying websocket data to debugger");
    }
    closed.trigger();

    // Signal EOF to the local client
    let _ = time::timeout(CLOSE_GRACE, local.shutdown()).await;

    total_bytes
}

/// Writes one whole remote message to the local socket.
async fn write_message<W>(local: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    local.write_all(data).await?;
    local.flush().await
}
