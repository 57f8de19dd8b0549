//! WebSocket transport to the filtered-resource service.
//!
//! One connection per subscription at `{base}/resource/{token}`, one JSON
//! message per text frame.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sluice_protocol::{decode_text, encode_text, ProtocolError, ProtocolMessage, RESOURCE_STREAM_PATH};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::transport::{Connector, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `{base_url}/resource/{token}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout,
        }
    }

    pub fn url_for(&self, token: &str) -> String {
        format!("{}{}/{}", self.base_url, RESOURCE_STREAM_PATH, token)
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, token: &str) -> Result<WsTransport, TransportError> {
        let url = self.url_for(token);
        tracing::debug!(%url, "ws: connecting");

        let connect_result =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await;

        let ws = match connect_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
                return Err(TransportError::Connect {
                    url,
                    reason: format!("server rejected upgrade: HTTP {}", response.status()),
                });
            }
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    url,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    url,
                    reason: format!("timed out after {:?}", self.connect_timeout),
                });
            }
        };

        tracing::info!(%url, "ws: connected");
        Ok(WsTransport { ws, closed: false })
    }
}

pub struct WsTransport {
    ws: WsStream,
    closed: bool,
}

impl Transport for WsTransport {
    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let payload = encode_text(&message)?;
        self.ws
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ProtocolMessage, TransportError>> {
        if self.closed {
            return None;
        }
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(decode_text(text.as_str()).map_err(TransportError::from));
                }
                Ok(Message::Binary(data)) => {
                    let decoded = match std::str::from_utf8(&data) {
                        Ok(text) => decode_text(text).map_err(TransportError::from),
                        Err(_) => Err(TransportError::Protocol(ProtocolError::UnexpectedFrame(
                            format!("{} byte non-UTF-8 binary frame", data.len()),
                        ))),
                    };
                    return Some(decoded);
                }
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(f) => tracing::info!(code = %f.code, reason = %f.reason, "ws: closed by server"),
                        None => tracing::info!("ws: closed by server"),
                    }
                    self.closed = true;
                    return None;
                }
                // tungstenite queues the Pong itself and flushes it on the next read or write.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => {
                    self.closed = true;
                    return Some(Err(TransportError::WebSocket(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!("ws: close handshake failed: {e}");
        }
    }
}
