//! Websocket connection exposed as a byte stream

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Byte stream over a websocket. Writes become binary messages; reads
/// concatenate the payloads of binary and text messages. A close frame or the
/// end of the websocket reads as EOF.
///
/// Every write is pushed to the socket without waiting for an explicit
/// flush. If the socket is not ready, the remaining bytes are flushed by the
/// next read, write or flush.
pub struct WebSocketConn<S> {
    connection_id: String,
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    closed: bool,
    flush_pending: bool,
}

impl<S> std::fmt::Debug for WebSocketConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConn")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S> WebSocketConn<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
            inner,
            read_buf: Bytes::new(),
            closed: false,
            flush_pending: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl<S> WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Push buffered frames towards the socket. `Pending` leaves
    /// `flush_pending` set with the waker registered.
    fn poll_push(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                self.flush_pending = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.flush_pending = false;
                Poll::Ready(Err(into_io(e)))
            }
            Poll::Pending => {
                self.flush_pending = true;
                Poll::Pending
            }
        }
    }
}

fn into_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl<S> AsyncRead for WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.flush_pending {
            if let Poll::Ready(Err(e)) = this.poll_push(cx) {
                return Poll::Ready(Err(e));
            }
        }
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = Bytes::from(data),
                Some(Ok(Message::Text(text))) => this.read_buf = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    trace!("{} received close frame {:?}", this.connection_id, frame);
                    this.closed = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(into_io(e))),
                None => this.closed = true,
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.flush_pending {
            ready!(this.poll_push(cx))?;
        }
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(into_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(into_io)?;

        // The frame is accepted; a socket that is not ready yet is retried later
        if let Poll::Ready(Err(e)) = this.poll_push(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_push(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(into_io)
    }
}
