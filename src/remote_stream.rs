//! Read half of the remote tunnel connection.
//!
//! This module provides [`RemoteStream`], which implements `futures::Stream`
//! for receiving relayed data from the tunnel WebSocket.

use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::TunnelError;

/// The underlying WebSocket stream type (read half).
pub(crate) type WsBaseStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// The read half of the remote tunnel connection.
///
/// `RemoteStream` implements `futures::Stream<Item = Result<Bytes, TunnelError>>`.
///
/// # Protocol
///
/// - Binary messages are yielded as-is, including empty ones (the relay
///   treats an empty message as end of stream)
/// - Text messages are yielded as their UTF-8 bytes
/// - A close frame or the end of the WebSocket ends the stream with `None`
/// - Ping and pong frames are answered by tungstenite and never yielded
///
/// With tracing enabled every received frame is logged at info level.
pub struct RemoteStream {
    /// `None` once the stream has ended.
    inner: Option<WsBaseStream>,
    trace: bool,
    index: u64,
}

impl RemoteStream {
    pub(crate) fn new(inner: WsBaseStream, trace: bool, index: u64) -> Self {
        Self { inner: Some(inner), trace, index }
    }
}

impl Stream for RemoteStream {
    type Item = Result<Bytes, TunnelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let inner = match &mut this.inner {
            Some(s) => s,
            None => return Poll::Ready(None),
        };

        match inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(Message::Binary(bin)))) => {
                if this.trace {
                    tracing::info!(index = this.index, len = bin.len(), "Received frame: binary");
                }
                return Poll::Ready(Some(Ok(bin)));
            }

            Poll::Ready(Some(Ok(Message::Text(txt)))) => {
                if this.trace {
                    tracing::info!(index = this.index, text = %txt, "Received frame: text");
                }
                return Poll::Ready(Some(Ok(Bytes::copy_from_slice(txt.as_str().as_bytes()))));
            }

            Poll::Ready(Some(Ok(Message::Close(frame)))) => {
                if this.trace {
                    tracing::info!(index = this.index, ?frame, "Received frame: close");
                }
                this.inner = None;
                return Poll::Ready(None);
            }

            Poll::Ready(None) => {
                this.inner = None;
                return Poll::Ready(None);
            }

            Poll::Ready(Some(Err(wserr))) => {
                this.inner = None;
                return Poll::Ready(Some(Err(TunnelError::from(wserr))));
            }

            // Ping, Pong and raw frames carry no relayed data
            Poll::Ready(Some(Ok(other))) => {
                if this.trace {
                    tracing::info!(index = this.index, frame = ?other, "Received frame: control");
                }
            }

            Poll::Pending => return Poll::Pending,
        }

        // The message didn't produce a value; poll again.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
