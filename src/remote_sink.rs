//! Write half of the remote tunnel connection.
//!
//! This module provides [`RemoteSink`], which implements `futures::Sink`
//! for sending relayed data to the tunnel WebSocket.

use bytes::Bytes;
use futures::{stream::SplitSink, Sink, SinkExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::TunnelError;

/// The underlying WebSocket sink type (write half).
pub(crate) type WsRawSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The write half of the remote tunnel connection.
///
/// `RemoteSink` implements `futures::Sink<Bytes, Error = TunnelError>`. Each
/// item becomes exactly one binary WebSocket message. Closing the sink sends
/// a close frame to the remote.
///
/// # Example
///
/// ```rust,ignore
/// use futures::SinkExt;
/// use bytes::Bytes;
///
/// sink.send(Bytes::from("PING")).await?;
/// sink.close().await?;
/// ```
pub struct RemoteSink {
    inner: WsRawSink,
    trace: bool,
    index: u64,
}

impl RemoteSink {
    pub(crate) fn new(inner: WsRawSink, trace: bool, index: u64) -> Self {
        Self { inner, trace, index }
    }
}

impl Sink<Bytes> for RemoteSink {
    type Error = TunnelError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().inner.poll_ready_unpin(cx).map_err(TunnelError::from)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let this = self.get_mut();
        if this.trace {
            tracing::info!(index = this.index, len = item.len(), "Sending frame: binary");
        }
        this.inner.start_send_unpin(Message::Binary(item)).map_err(TunnelError::from)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().inner.poll_flush_unpin(cx).map_err(TunnelError::from)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().inner.poll_close_unpin(cx).map_err(TunnelError::from)
    }
}
