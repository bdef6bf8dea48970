// Shared primitives for driving a broker over real websockets in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use signaling_server::broker::Broker;
use signaling_server::codes::CodeGenerator;
use signaling_server::config::Settings;
use signaling_server::store::{CounterStore, SnapshotStore, StoreError};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory stand-in for the persistent store, so the served broker runs
/// without a database.
#[derive(Default)]
pub struct MemoryStore {
    pub rows: Mutex<HashMap<String, Vec<u8>>>,
    counter: Mutex<u64>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upsert(&self, code: &str, blob: &[u8]) -> Result<(), StoreError> {
        self.rows
            .lock()
            .await
            .insert(code.to_string(), blob.to_vec());
        Ok(())
    }

    async fn upsert_batch(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        for (code, blob) in entries {
            self.upsert(code, blob).await?;
        }
        Ok(())
    }

    async fn load(&self, code: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.rows.lock().await.get(code).cloned())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn load_counter(&self) -> Result<u64, StoreError> {
        Ok(*self.counter.lock().await)
    }

    async fn save_counter(&self, value: u64) -> Result<(), StoreError> {
        *self.counter.lock().await = value;
        Ok(())
    }
}

/// Boots a broker on an ephemeral port and returns the websocket URL.
pub async fn start_server(settings: Settings) -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let generator = CodeGenerator::new(0, store.clone())
        .await
        .expect("in-memory counter never fails");
    let broker = Arc::new(Broker::new(settings, store.clone(), generator));

    // Bind to an ephemeral port to avoid collisions with local services.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral test port");
    let addr = listener.local_addr().expect("get local addr");

    tokio::spawn(async move {
        let _ = signaling_server::run(listener, broker).await;
    });

    (format!("ws://{addr}/ws"), store)
}

/// One websocket client speaking the signaling protocol.
pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn connect(url: &str) -> Client {
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        Client { ws }
    }

    pub async fn send_frame(&mut self, kind: u32, id: u32, data: &str) {
        let text = serde_json::json!({ "type": kind, "id": id, "data": data }).to_string();
        self.ws
            .send(Message::Text(text))
            .await
            .expect("send text frame");
    }

    pub async fn send_raw_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send raw frame");
    }

    pub async fn send_binary(&mut self, blob: Vec<u8>) {
        self.ws
            .send(Message::Binary(blob))
            .await
            .expect("send binary frame");
    }

    /// Next control envelope as `(type, id, data)`. Skips transport pings.
    pub async fn recv_envelope(&mut self) -> (u64, u64, String) {
        loop {
            match self.next_message().await {
                Message::Text(text) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&text).expect("valid envelope json");
                    return (
                        value["type"].as_u64().expect("type field"),
                        value["id"].as_u64().expect("id field"),
                        value["data"].as_str().unwrap_or_default().to_string(),
                    );
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Next binary frame. Skips transport pings.
    pub async fn recv_binary(&mut self) -> Vec<u8> {
        loop {
            match self.next_message().await {
                Message::Binary(blob) => return blob,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a binary frame, got {other:?}"),
            }
        }
    }

    /// Waits for the server to close the connection; returns `(code, reason)`.
    pub async fn recv_close(&mut self) -> (u16, String) {
        loop {
            match self.next_message().await {
                Message::Close(Some(frame)) => {
                    return (u16::from(frame.code), frame.reason.to_string());
                }
                Message::Close(None) => return (1005, String::new()),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    }

    pub async fn disconnect(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn next_message(&mut self) -> Message {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended unexpectedly");
        frame.expect("websocket error")
    }
}
