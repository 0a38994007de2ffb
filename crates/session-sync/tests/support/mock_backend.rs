//! Scripted backend for driving `SessionClient` through exact frame sequences.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

enum ConnectionCommand {
    SendJson(Value),
    ForceClose,
}

pub struct MockConnection {
    index: usize,
    frame_rx: mpsc::Receiver<Value>,
    command_tx: mpsc::Sender<ConnectionCommand>,
}

impl MockConnection {
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn recv_frame(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.frame_rx.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("mock connection frame channel closed")
    }

    /// Next frame, asserting its `type`.
    pub async fn recv_type(&mut self, expected: &str) -> Value {
        let frame = self.recv_frame().await;
        assert_eq!(
            frame.get("type").and_then(Value::as_str),
            Some(expected),
            "unexpected frame: {frame}"
        );
        frame
    }

    /// Nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = timeout(wait, self.frame_rx.recv()).await {
            panic!("expected no frame, got {frame}");
        }
    }

    pub async fn send_json(&self, value: Value) {
        self.command_tx
            .send(ConnectionCommand::SendJson(value))
            .await
            .expect("failed to send command to mock connection");
    }

    pub async fn force_close(&self) {
        let _ = self.command_tx.send(ConnectionCommand::ForceClose).await;
    }

    /// hello → connect → connected → active_state_sync.
    ///
    /// Returns the `connect` frame and the session ids it resubscribes.
    pub async fn drive_handshake(&mut self, locked_sessions: &[&str]) -> (Value, Vec<String>) {
        self.send_json(json!({"type": "hello", "protocol_version": 1}))
            .await;
        let connect = self.recv_type("connect").await;
        let resubscribed = connect["subscriptions"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.send_json(json!({"type": "connected"})).await;

        self.send_json(json!({
            "type": "active_state_sync",
            "locked_sessions": locked_sessions,
            "sessions": [],
        }))
        .await;
        (connect, resubscribed)
    }
}

pub struct MockBackend {
    addr: SocketAddr,
    connection_rx: mpsc::Receiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let (connection_tx, connection_rx) = mpsc::channel(16);
        let next_index = Arc::new(AtomicUsize::new(0));

        let server_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection_tx = connection_tx.clone();
                let index = next_index.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    let Ok(ws_stream) = accept_async(stream).await else {
                        return;
                    };
                    let (mut ws_sink, mut ws_source) = ws_stream.split();
                    let (frame_tx, frame_rx) = mpsc::channel(64);
                    let (command_tx, mut command_rx) = mpsc::channel(64);

                    let connection = MockConnection {
                        index,
                        frame_rx,
                        command_tx,
                    };
                    if connection_tx.send(connection).await.is_err() {
                        return;
                    }

                    loop {
                        tokio::select! {
                            command = command_rx.recv() => match command {
                                Some(ConnectionCommand::SendJson(value)) => {
                                    let message = Message::Text(value.to_string().into());
                                    if ws_sink.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ConnectionCommand::ForceClose) | None => break,
                            },
                            message = ws_source.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                        let _ = frame_tx.send(value).await;
                                    }
                                }
                                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Ok(Self {
            addr,
            connection_rx,
            server_task,
        })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connection_rx.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock backend connection channel closed")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        match timeout(wait, self.connection_rx.recv()).await {
            Ok(Some(connection)) => Some(connection),
            _ => None,
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
