//! Bare WebSocket client for exercising `SyncServer` frame by frame.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::mock_backend::STEP_TIMEOUT;

pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    /// Connect and consume the server's `hello`.
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = timeout(STEP_TIMEOUT, connect_async(url))
            .await
            .expect("timed out connecting")
            .expect("failed to connect");
        let mut client = Self { ws };
        client.recv_type("hello").await;
        client
    }

    /// Connect, authenticate, and consume `connected` + `active_state_sync`.
    ///
    /// Returns the state sync frame.
    pub async fn authenticated(url: &str, credential: &str, client_id: &str) -> (Self, Value) {
        let connect = json!({"type": "connect", "credential": credential, "client_id": client_id});
        Self::handshake(url, connect).await
    }

    /// Like [`RawClient::authenticated`], restoring `sessions` on `connect`.
    pub async fn subscribed(
        url: &str,
        credential: &str,
        client_id: &str,
        sessions: &[&str],
    ) -> (Self, Value) {
        let connect = json!({
            "type": "connect",
            "credential": credential,
            "client_id": client_id,
            "subscriptions": sessions,
        });
        Self::handshake(url, connect).await
    }

    /// Send `connect` and consume `connected` + `active_state_sync`.
    pub async fn handshake(url: &str, connect: Value) -> (Self, Value) {
        let mut client = Self::connect(url).await;
        client.send_json(connect).await;
        client.recv_type("connected").await;
        let sync = client.recv_type("active_state_sync").await;
        (client, sync)
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("failed to send frame");
    }

    /// Next JSON frame, skipping heartbeats.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let frame = self
                .try_recv_json(STEP_TIMEOUT)
                .await
                .expect("timed out waiting for frame");
            if frame["type"] != "heartbeat" {
                return frame;
            }
        }
    }

    pub async fn try_recv_json(&mut self, wait: Duration) -> Option<Value> {
        loop {
            match timeout(wait, self.ws.next()).await.ok()?? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv_type(&mut self, expected: &str) -> Value {
        let frame = self.recv_json().await;
        assert_eq!(frame["type"], expected, "unexpected frame: {frame}");
        frame
    }

    /// The server closes the socket within `wait`.
    pub async fn expect_closed(&mut self, wait: Duration) {
        let closed = timeout(wait, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "server did not close the socket");
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
