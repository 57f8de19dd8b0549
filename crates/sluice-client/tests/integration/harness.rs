//! Test harness for in-process sluice client integration tests.
//!
//! Two kinds of fake broker:
//!   - `MockBroker`: a `Connector` over in-memory duplex pipes. Each connect
//!     hands the server end to the test as a `ServerConn`, which scripts
//!     the broker side frame by frame.
//!   - `HttpBroker`: a real axum server on 127.0.0.1 serving registration,
//!     chunked reads, and a scripted WebSocket stream, for end-to-end runs
//!     through `WsConnector` and reqwest.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use sluice_client::{Client, ClientConfig, Connector, FramedTransport, TransportError};
use sluice_flow::{Delivery, ResumePolicy};
use sluice_protocol::{
    decode_text, encode_text, DataRequest, DataRequestResponse, MessageCodec, ProtocolMessage,
    ReadRequest, ResourceBody,
};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

pub const TOKEN: &str = "abcd-1";

/// Upper bound for anything a test waits on.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with fast reconnects so tests do not sleep for seconds.
pub fn test_config(capacity: usize) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.download.capacity = capacity;
    cfg.download.slot_poll_ms = 20;
    cfg.stream.connect_timeout_ms = 2_000;
    cfg.reconnect.max_attempts = 3;
    cfg.reconnect.base_delay_ms = 10;
    cfg.reconnect.max_delay_ms = 50;
    cfg.reconnect.resume_policy = ResumePolicy::Fail;
    cfg
}

pub fn resource_body(leaf: &str, url: &str) -> ResourceBody {
    ResourceBody {
        leaf_resource_id: leaf.into(),
        url: url.into(),
        resource_type: "file".into(),
        serialised_format: "json".into(),
        attributes: BTreeMap::new(),
    }
}

pub fn resource_msg(leaf: &str) -> ProtocolMessage {
    ProtocolMessage::Resource {
        token: TOKEN.into(),
        body: resource_body(leaf, "http://127.0.0.1:1"),
    }
}

pub fn error_msg(text: &str) -> ProtocolMessage {
    ProtocolMessage::Error {
        token: TOKEN.into(),
        body: text.into(),
    }
}

pub fn rts() -> ProtocolMessage {
    ProtocolMessage::ReadyToSend {
        token: TOKEN.into(),
    }
}

pub fn subscribed(resumed: bool) -> ProtocolMessage {
    ProtocolMessage::Subscribed {
        token: TOKEN.into(),
        resumed,
    }
}

pub fn complete() -> ProtocolMessage {
    ProtocolMessage::Complete {
        token: TOKEN.into(),
    }
}

/// Pull one delivery or fail the test.
pub async fn next_delivery(stream: &sluice_client::ResourceStream) -> Delivery {
    stream
        .next(STEP_TIMEOUT)
        .await
        .expect("no delivery within timeout")
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

/// Connector whose connections terminate in the test body.
#[derive(Clone)]
pub struct MockBroker {
    conns: mpsc::UnboundedSender<ServerConn>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerConn>) {
        let (conns, rx) = mpsc::unbounded_channel();
        (
            Self {
                conns,
                refuse: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Make every further connect fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockBroker {
    type Transport = FramedTransport<DuplexStream>;

    async fn connect(&self, token: &str) -> Result<Self::Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: format!("mock://{token}"),
                reason: "connection refused".into(),
            });
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.conns
            .send(ServerConn {
                framed: Framed::new(server, MessageCodec),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(FramedTransport::new(client))
    }
}

/// Broker side of one client connection.
pub struct ServerConn {
    framed: Framed<DuplexStream, MessageCodec>,
}

#[allow(dead_code)]
impl ServerConn {
    pub async fn send(&mut self, message: ProtocolMessage) {
        self.framed.send(message).await.expect("server send failed");
    }

    /// Send, ignoring a client that already hung up.
    pub async fn try_send(&mut self, message: ProtocolMessage) -> bool {
        self.framed.send(message).await.is_ok()
    }

    /// Next client frame; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        match tokio::time::timeout(STEP_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            Ok(Some(Err(e))) => panic!("server decode failed: {e}"),
            Ok(None) => None,
            Err(_) => panic!("no client frame within {STEP_TIMEOUT:?}"),
        }
    }

    pub async fn expect(&mut self, expected: ProtocolMessage) {
        let got = self.recv().await;
        assert_eq!(got.as_ref(), Some(&expected));
    }

    /// Assert the client sends nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(frame) = tokio::time::timeout(window, self.framed.next()).await {
            panic!("expected silence, got {frame:?}");
        }
    }

    /// Drain until the client closes; returns what it sent on the way.
    pub async fn until_closed(&mut self) -> Vec<ProtocolMessage> {
        let mut seen = Vec::new();
        while let Some(message) = self.recv().await {
            seen.push(message);
        }
        seen
    }

    /// SUBSCRIBE / SUBSCRIBED handshake.
    pub async fn handshake(&mut self, resumed: bool) {
        self.expect(ProtocolMessage::subscribe(TOKEN)).await;
        self.send(subscribed(resumed)).await;
    }

    /// RTS, wait for CTS, then send `item`.
    pub async fn offer(&mut self, item: ProtocolMessage) {
        self.send(rts()).await;
        self.expect(ProtocolMessage::clear_to_send(TOKEN)).await;
        self.send(item).await;
    }
}

pub async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    tokio::time::timeout(STEP_TIMEOUT, conns.recv())
        .await
        .expect("client never connected")
        .expect("broker dropped")
}

/// Client wired to a fresh `MockBroker`.
pub fn mock_client(
    cfg: ClientConfig,
) -> (Client<MockBroker>, MockBroker, mpsc::UnboundedReceiver<ServerConn>) {
    let (broker, conns) = MockBroker::new();
    let client = Client::with_connector(cfg, broker.clone()).expect("client config rejected");
    (client, broker, conns)
}

// ---------------------------------------------------------------------------
// HTTP + WebSocket broker
// ---------------------------------------------------------------------------

/// Leaf ids the HTTP broker can serve, with their bytes.
pub const FILES: &[(&str, &[u8])] = &[("file0", b"contents of file0"), ("file1", b"file1!")];

#[derive(Clone)]
struct BrokerState {
    base_url: String,
    cts_seen: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<DataRequest>>>,
    reads_in_flight: Arc<AtomicUsize>,
    peak_reads: Arc<AtomicUsize>,
}

/// A running axum broker. Dropping it leaves the server task running
/// until the test runtime shuts down.
pub struct HttpBroker {
    pub addr: SocketAddr,
    cts_seen: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<DataRequest>>>,
    peak_reads: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl HttpBroker {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let state = BrokerState {
            base_url: format!("http://{addr}"),
            cts_seen: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            reads_in_flight: Arc::new(AtomicUsize::new(0)),
            peak_reads: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/api/registerDataRequest", post(register))
            .route("/read/chunked", post(read_chunked))
            .route("/resource/:token", get(resource_ws))
            .with_state(state.clone());

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("http broker stopped: {e}");
            }
        });

        Self {
            addr,
            cts_seen: state.cts_seen,
            requests: state.requests,
            peak_reads: state.peak_reads,
        }
    }

    pub fn config(&self, capacity: usize) -> ClientConfig {
        let mut cfg = test_config(capacity);
        cfg.services.registration_url = format!("http://{}", self.addr);
        cfg.services.filtered_resource_url = format!("ws://{}", self.addr);
        cfg
    }

    pub fn cts_seen(&self) -> usize {
        self.cts_seen.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<DataRequest> {
        self.requests.lock().await.clone()
    }

    /// Most `/read/chunked` requests ever handled at the same time.
    pub fn peak_reads(&self) -> usize {
        self.peak_reads.load(Ordering::SeqCst)
    }
}

async fn register(
    State(state): State<BrokerState>,
    Json(request): Json<DataRequest>,
) -> axum::response::Response {
    if request.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId required").into_response();
    }
    state.requests.lock().await.push(request);
    Json(DataRequestResponse {
        token: TOKEN.into(),
    })
    .into_response()
}

/// Leaf ids starting with `slow-` take `SLOW_READ` to answer and serve
/// `SLOW_BODY`.
pub const SLOW_READ: Duration = Duration::from_millis(300);
pub const SLOW_BODY: &[u8] = b"slow bytes";

async fn read_chunked(
    State(state): State<BrokerState>,
    Json(read): Json<ReadRequest>,
) -> axum::response::Response {
    let now = state.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_reads.fetch_max(now, Ordering::SeqCst);
    let response = serve_read(read).await;
    state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

async fn serve_read(read: ReadRequest) -> axum::response::Response {
    if read.token != TOKEN {
        return (StatusCode::FORBIDDEN, "unknown token").into_response();
    }
    if read.leaf_resource_id.starts_with("slow-") {
        tokio::time::sleep(SLOW_READ).await;
        return SLOW_BODY.to_vec().into_response();
    }
    if read.leaf_resource_id == "boom" {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk on fire").into_response();
    }
    match FILES.iter().find(|(leaf, _)| *leaf == read.leaf_resource_id) {
        Some((_, bytes)) => bytes.to_vec().into_response(),
        None => (StatusCode::NOT_FOUND, "no such resource").into_response(),
    }
}

async fn resource_ws(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<BrokerState>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| scripted_stream(socket, token, state))
}

/// file0, file1, ERROR "test error", COMPLETE -- one item per CTS.
async fn scripted_stream(mut socket: WebSocket, token: String, state: BrokerState) {
    let items = vec![
        ProtocolMessage::Resource {
            token: token.clone(),
            body: resource_body("file0", &state.base_url),
        },
        ProtocolMessage::Resource {
            token: token.clone(),
            body: resource_body("file1", &state.base_url),
        },
        ProtocolMessage::Error {
            token: token.clone(),
            body: "test error".into(),
        },
    ];

    match ws_recv(&mut socket).await {
        Some(ProtocolMessage::Subscribe { .. }) => {}
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }
    ws_send(
        &mut socket,
        ProtocolMessage::Subscribed {
            token: token.clone(),
            resumed: false,
        },
    )
    .await;

    for item in items {
        ws_send(&mut socket, ProtocolMessage::ReadyToSend { token: token.clone() }).await;
        match ws_recv(&mut socket).await {
            Some(ProtocolMessage::ClearToSend { .. }) => {
                state.cts_seen.fetch_add(1, Ordering::SeqCst);
            }
            other => panic!("expected CTS, got {other:?}"),
        }
        ws_send(&mut socket, item).await;
    }
    ws_send(&mut socket, ProtocolMessage::Complete { token }).await;

    // Client closes after COMPLETE; nothing else may arrive first.
    if let Some(extra) = ws_recv(&mut socket).await {
        panic!("frame after COMPLETE: {extra:?}");
    }
}

async fn ws_send(socket: &mut WebSocket, message: ProtocolMessage) {
    let text = encode_text(&message).expect("encode failed");
    let _ = socket.send(WsMessage::Text(text)).await;
}

async fn ws_recv(socket: &mut WebSocket) -> Option<ProtocolMessage> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Some(decode_text(&text).expect("bad client frame")),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
