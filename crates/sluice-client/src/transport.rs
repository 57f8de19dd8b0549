//! Transport seam between the subscription driver and the network.
//!
//! A `Connector` opens one `Transport` per subscription attempt. The driver
//! only ever sees `ProtocolMessage`s; framing lives in the implementations:
//! WebSocket text frames (`ws_transport`) or length-delimited JSON over any
//! byte stream (`FramedTransport`, used by in-process harnesses).

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use sluice_protocol::{MessageCodec, ProtocolError, ProtocolMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A single frame could not be decoded. The connection itself is fine.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The byte stream can no longer be split into frames.
    #[error("framing lost: {0}")]
    Framing(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the connection is gone (as opposed to one bad frame).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

/// One open bidirectional message channel.
///
/// `recv` must be cancel-safe: the driver polls it inside `select!`.
pub trait Transport: Send + 'static {
    fn send(
        &mut self,
        message: ProtocolMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound message. `None` once the peer has closed the connection.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Option<Result<ProtocolMessage, TransportError>>> + Send;

    /// Close the connection. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports for a subscription token.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// `ProtocolMessage`s over a length-delimited byte stream.
pub struct FramedTransport<S> {
    framed: Framed<S, MessageCodec>,
    closed: bool,
    /// `Framed` yields one `None` after a decode error before reading on.
    skip_eof: bool,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            framed: Framed::new(io, MessageCodec),
            closed: false,
            skip_eof: false,
        }
    }
}

impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.framed.send(message).await.map_err(|e| match e {
            ProtocolError::Io(io) => TransportError::Io(io),
            other => TransportError::Protocol(other),
        })
    }

    async fn recv(&mut self) -> Option<Result<ProtocolMessage, TransportError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.framed.next().await {
                Some(Ok(message)) => return Some(Ok(message)),
                // The codec consumed the bad payload; framing is intact.
                Some(Err(ProtocolError::Json(e))) => {
                    self.skip_eof = true;
                    return Some(Err(TransportError::Protocol(e.into())));
                }
                Some(Err(ProtocolError::Io(e))) => {
                    self.closed = true;
                    return Some(Err(TransportError::Io(e)));
                }
                // Oversized length prefix: nothing after it can be trusted.
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(TransportError::Framing(e.to_string())));
                }
                None if std::mem::take(&mut self.skip_eof) => continue,
                None => return None,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = SinkExt::close(&mut self.framed).await {
            tracing::debug!("framed transport close: {e}");
        }
    }
}
