use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use together_api::broadcast::{QueueBackend, QueueBuilder, SessionRegistry};
use together_api::config::Config;
use together_api::db::backplane::{Backplane, MemoryBackplane};
use together_api::db::directory::BackplaneDirectory;
use together_api::models::session::SessionRecord;
use together_api::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for a frame it expects before failing.
const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.public_ws_base = "ws://test.local".to_string();
    config.broadcast.fanout_tick = Duration::from_millis(5);
    config
}

fn build_state(backplane: Arc<dyn Backplane>, backend: QueueBackend) -> AppState {
    let config = test_config();
    let queues = QueueBuilder::from_config(backend, &config.broadcast);
    let registry = SessionRegistry::new(queues, config.broadcast.clone());
    AppState {
        config: Arc::new(config),
        directory: Arc::new(BackplaneDirectory::new(backplane)),
        registry: Arc::new(registry),
    }
}

/// Single-process state: local event queues, in-memory session records.
pub fn test_state() -> AppState {
    build_state(Arc::new(MemoryBackplane::new()), QueueBackend::Local)
}

/// One replica of a scaled deployment; replicas built on the same backplane
/// share sessions.
pub fn replica_state(backplane: Arc<dyn Backplane>) -> AppState {
    build_state(backplane.clone(), QueueBackend::Distributed(backplane))
}

/// Build the full application router wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = together_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = together_api::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Register a session directly in the directory and return its id.
pub async fn create_session(state: &AppState, name: &str) -> String {
    let record = SessionRecord::new(
        together_common::id::new_session_id(),
        name.to_string(),
        "tester".to_string(),
        "https://example.com".to_string(),
    );
    state.directory.store(&record).await.expect("store session");
    record.id
}

pub async fn connect(addr: SocketAddr, session_id: &str) -> WsClient {
    let url = format!("ws://{addr}/ws/{session_id}/cursors");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_position(ws: &mut WsClient, x: f64, y: f64, selector: &str, location: &str) {
    let update = serde_json::json!({
        "x": x,
        "y": y,
        "selector": selector,
        "location": location,
    });
    ws.send(tungstenite::Message::Text(update.to_string().into()))
        .await
        .expect("send position");
}

/// Read frames until one satisfies `pred`, and return it.
pub async fn frame_where(
    ws: &mut WsClient,
    mut pred: impl FnMut(&[serde_json::Value]) -> bool,
) -> Vec<serde_json::Value> {
    let found = time::timeout(FRAME_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let frame: Vec<serde_json::Value> =
                        serde_json::from_str(&text).expect("frame is a JSON array");
                    if pred(&frame) {
                        return frame;
                    }
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    panic!("connection closed while waiting for a frame: {frame:?}")
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("ws error while waiting for a frame: {e}"),
                None => panic!("connection ended while waiting for a frame"),
            }
        }
    })
    .await;
    found.expect("no matching frame before timeout")
}

/// Member ids present in a frame.
pub fn member_ids(frame: &[serde_json::Value]) -> Vec<i64> {
    frame
        .iter()
        .map(|p| p["memberId"].as_i64().expect("memberId"))
        .collect()
}

/// Wait until the server closes the connection, returning the close code if
/// one was sent.
pub async fn expect_closed(ws: &mut WsClient) -> Option<u16> {
    let closed = time::timeout(FRAME_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    return frame.map(|f| u16::from(f.code));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    })
    .await;
    closed.expect("connection still open")
}
