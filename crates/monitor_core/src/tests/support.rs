use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use discovery::Endpoint;
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    sync::broadcast,
};

#[derive(Clone)]
struct AgentState {
    replies: Arc<Vec<String>>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    kick: broadcast::Sender<()>,
}

/// Websocket server that answers `getProperties` with canned documents.
#[derive(Clone)]
pub struct MockAgent {
    pub addr: SocketAddr,
    state: AgentState,
}

impl MockAgent {
    pub async fn spawn(replies: Vec<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (kick, _) = broadcast::channel(16);
        let state = AgentState {
            replies: Arc::new(replies),
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            kick,
        };
        let app = Router::new()
            .route("/", get(upgrade))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().expect("lock").clone()
    }

    pub fn received_containing(&self, needle: &str) -> usize {
        self.received()
            .iter()
            .filter(|text| text.contains(needle))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Closes every open session from the server side.
    pub fn kick_all(&self) {
        let _ = self.state.kick.send(());
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AgentState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| agent_session(socket, state))
}

async fn agent_session(mut socket: WebSocket, state: AgentState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.active.fetch_add(1, Ordering::SeqCst);
    let mut kick = state.kick.subscribe();

    loop {
        tokio::select! {
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let is_hello = text.contains("getProperties");
                    state.received.lock().expect("lock").push(text);
                    if is_hello {
                        for reply in state.replies.iter() {
                            if socket.send(Message::Text(reply.clone())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state.active.fetch_sub(1, Ordering::SeqCst);
}

/// Accepts TCP connections and answers with a non-websocket HTTP response.
pub async fn spawn_plain_http() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
    });
    Endpoint::new("127.0.0.1", port)
}

/// A port nothing listens on.
pub async fn closed_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(20);

pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    false
}

/// Like [`eventually`] for checks that must await (store reads, status queries).
pub async fn eventually_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    false
}

pub fn vector(tag: &str, device: &str, name: &str, state: &str, items: &[(&str, &str)]) -> String {
    let items: Vec<serde_json::Value> = items
        .iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();
    let mut document = serde_json::Map::new();
    document.insert(
        tag.to_string(),
        serde_json::json!({ "device": device, "name": name, "state": state, "items": items }),
    );
    serde_json::Value::Object(document).to_string()
}
