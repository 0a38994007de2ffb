//! Per-connection task: from WebSocket upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::protocol::codec::{self, DecodeError};
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::{ClientMessage, Envelope, ServerMessage, SessionId};
use crate::server::ServerShared;
use crate::server::WorkExecutor;
use crate::server::auth::{AUTH_FAILURE_MESSAGE, Gate};
use crate::server::connection::{Outbound, ServerConnection};
use crate::server::lock_coordinator::AcquireOutcome;

/// Capacity of each connection's outbound queue.
const OUTBOUND_CAPACITY: usize = 1024;

/// How long the writer gets to flush a final close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether the read loop should keep going after a frame.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Run one client connection to completion.
///
/// 1. Upgrades the socket and sends `hello`
/// 2. Gates every message on authentication
/// 3. Dispatches authenticated messages
/// 4. Releases the connection's locks and registrations on exit
#[instrument(skip_all, fields(connection_id = tracing::field::Empty, %peer))]
pub(crate) async fn run_connection<E: WorkExecutor>(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    shared: Arc<ServerShared<E>>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "WebSocket upgrade failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (send_tx, mut send_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let cancel = shared.shutdown.child_token();
    let connection = Arc::new(ServerConnection::new(
        connection_id.clone(),
        send_tx,
        cancel.clone(),
    ));
    shared.connections.add(Arc::clone(&connection));
    info!("Client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    connection.send_message(ServerMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = cancel.cancelled() => {
                debug!("Connection cancelled");
                break;
            }
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "Ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "Read error");
                break;
            }
        };

        if handle_frame(&text, &connection, &shared) == Flow::Close {
            connection.close();
            break;
        }
    }

    disconnect(&connection, &shared);

    // Dropping the last sender ends the writer once queued frames are out.
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Writer did not drain in time");
    }
}

/// Tear down everything this connection owned. Safe to call twice.
fn disconnect<E: WorkExecutor>(connection: &Arc<ServerConnection>, shared: &ServerShared<E>) {
    shared.connections.remove(connection.id());
    if let Some(client_key) = connection.client_key() {
        if connection.is_anonymous() {
            shared.acks.forget(client_key, connection.id());
        } else {
            shared.acks.detach(client_key, connection.id());
        }
    }
    for session_id in shared.locks.release_all_for(connection.id()) {
        publish(shared, ServerMessage::SessionUnlocked { session_id }, &[]);
    }
    info!(
        age_ms = u64::try_from(connection.age().as_millis()).unwrap_or(u64::MAX),
        dropped = connection.drop_count(),
        "Client disconnected"
    );
}

fn handle_frame<E: WorkExecutor>(
    text: &str,
    connection: &Arc<ServerConnection>,
    shared: &Arc<ServerShared<E>>,
) -> Flow {
    let message = match codec::decode_client(text) {
        Ok(message) => message,
        Err(err) if !connection.is_authenticated() => {
            debug!(error = %err, "Undecodable frame before authentication");
            return reject(connection);
        }
        Err(err) => {
            if let DecodeError::UnknownType(ref tag) = err {
                debug!(tag, "Unknown message type");
            }
            connection.send_message(ServerMessage::Error {
                session_id: None,
                message: err.to_string(),
            });
            return Flow::Continue;
        }
    };
    debug!(message_type = message.message_type(), "Received message");

    if !connection.is_authenticated() {
        return match shared.authenticator.gate(&message, connection.id()) {
            Gate::Open => {
                connection.send_message(ServerMessage::Pong);
                Flow::Continue
            }
            Gate::Accept {
                client_key,
                anonymous,
                subscriptions,
            } => {
                complete_handshake(connection, shared, client_key, anonymous, subscriptions);
                Flow::Continue
            }
            Gate::Reject => reject(connection),
        };
    }

    match message {
        ClientMessage::Ping => {
            connection.send_message(ServerMessage::Pong);
        }
        ClientMessage::Connect { .. } => {
            // Already authenticated; the credential is checked once per socket.
            connection.send_message(ServerMessage::Connected);
        }
        ClientMessage::Subscribe { session_id } => {
            connection.subscribe(session_id.clone());
            connection.send_message(ServerMessage::Subscribed { session_id });
        }
        ClientMessage::Unsubscribe { session_id } => {
            connection.unsubscribe(&session_id);
            connection.send_message(ServerMessage::Unsubscribed { session_id });
        }
        ClientMessage::Dispatch {
            session_id,
            payload,
        } => dispatch(connection, shared, session_id, payload),
        ClientMessage::Unlock { session_id } => {
            if let Some(owner) = shared.locks.force_release(&session_id) {
                info!(%session_id, "Session manually unlocked");
                let unlocked = ServerMessage::SessionUnlocked { session_id };
                publish(shared, unlocked, &[connection.id(), owner.connection_id.as_str()]);
            } else {
                connection.send_message(ServerMessage::SessionUnlocked { session_id });
            }
        }
        ClientMessage::DeleteSession { session_id } => {
            shared.sessions.soft_delete(&session_id);
            let owner = shared.locks.force_release(&session_id);
            let mut notify = vec![connection.id()];
            if let Some(owner) = &owner {
                notify.push(owner.connection_id.as_str());
                let unlocked = ServerMessage::SessionUnlocked {
                    session_id: session_id.clone(),
                };
                publish(shared, unlocked, &notify);
            }
            let deleted = ServerMessage::SessionDeleted { session_id };
            publish(shared, deleted, &notify);
        }
        ClientMessage::Ack { message_id } => {
            if let Some(client_key) = connection.client_key() {
                if !shared.acks.acknowledge(client_key, &message_id) {
                    debug!(message_id, "Ack for unknown message id");
                }
            }
        }
    }
    Flow::Continue
}

fn reject(connection: &ServerConnection) -> Flow {
    warn!("Authentication failed, closing connection");
    connection.send_message(ServerMessage::AuthError {
        message: AUTH_FAILURE_MESSAGE.to_string(),
    });
    Flow::Close
}

/// Restore subscriptions, then `connected`, replay and the state snapshot.
///
/// Subscriptions are recorded before the connection counts as
/// authenticated, so session events reach it no later than the snapshot.
fn complete_handshake<E: WorkExecutor>(
    connection: &Arc<ServerConnection>,
    shared: &ServerShared<E>,
    client_key: String,
    anonymous: bool,
    subscriptions: Vec<SessionId>,
) {
    let subscribed = subscriptions.len();
    for session_id in subscriptions {
        connection.subscribe(session_id);
    }
    connection.authenticate(client_key.clone(), anonymous);
    connection.send_message(ServerMessage::Connected);
    let target: Arc<ServerConnection> = Arc::clone(connection);
    let replayed = shared.acks.attach(&client_key, target);
    connection.send_message(ServerMessage::ActiveStateSync {
        locked_sessions: shared.locks.locked_sessions(),
        sessions: shared.sessions.summaries(&shared.locks),
    });
    info!(client_key, anonymous, subscribed, replayed, "Client authenticated");
}

/// Deliver a session event to its followers and to `also`.
fn publish<E: WorkExecutor>(shared: &ServerShared<E>, message: ServerMessage, also: &[&str]) {
    shared.connections.publish(&Envelope::plain(message), also);
}

/// Where the outcome of a dispatch is reported.
struct Recipient {
    connection_id: String,
    client_key: String,
    anonymous: bool,
}

impl Recipient {
    fn of(connection: &ServerConnection) -> Option<Self> {
        Some(Self {
            connection_id: connection.id().to_string(),
            client_key: connection.client_key()?.to_string(),
            anonymous: connection.is_anonymous(),
        })
    }
}

/// Send `message` through the ack buffer when it needs acknowledgment,
/// straight to the socket otherwise.
fn deliver<E: WorkExecutor>(
    shared: &ServerShared<E>,
    recipient: &Recipient,
    message: ServerMessage,
) {
    let live = shared.connections.get(&recipient.connection_id);
    if message.requires_ack() {
        if recipient.anonymous && live.is_none() {
            debug!(client_key = %recipient.client_key, "Anonymous client gone, outcome dropped");
            return;
        }
        shared.acks.enqueue(&recipient.client_key, message);
    } else if let Some(connection) = live {
        connection.send_message(message);
    }
}

fn dispatch<E: WorkExecutor>(
    connection: &Arc<ServerConnection>,
    shared: &Arc<ServerShared<E>>,
    session_id: SessionId,
    payload: Value,
) {
    let Some(recipient) = Recipient::of(connection) else {
        return;
    };

    if shared.sessions.is_deleted(&session_id) {
        let rejected = ServerMessage::Error {
            session_id: Some(session_id),
            message: "session has been deleted".into(),
        };
        deliver(shared, &recipient, rejected);
        return;
    }

    match shared.locks.try_acquire(&session_id, connection.id()) {
        AcquireOutcome::Busy { owner } => {
            debug!(%session_id, owner, "Dispatch rejected, session busy");
            connection.send_message(ServerMessage::Busy { session_id });
        }
        AcquireOutcome::Acquired => {
            shared.sessions.touch(&session_id);
            connection.send_message(ServerMessage::Accepted {
                session_id: session_id.clone(),
            });
            let locked = ServerMessage::SessionLocked {
                session_id: session_id.clone(),
            };
            publish(shared, locked, &[connection.id()]);

            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                run_work(shared, recipient, session_id, payload).await;
            });
        }
    }
}

/// Execute one unit of work and deliver its outcome reliably.
async fn run_work<E: WorkExecutor>(
    shared: Arc<ServerShared<E>>,
    recipient: Recipient,
    session_id: SessionId,
    payload: Value,
) {
    info!(%session_id, "Work started");
    let outcome = shared.executor.execute(session_id.clone(), payload).await;
    shared.sessions.touch(&session_id);

    let message = match outcome {
        Ok(result) => {
            info!(%session_id, "Work complete");
            ServerMessage::Complete {
                session_id: session_id.clone(),
                result,
            }
        }
        Err(message) => {
            warn!(%session_id, error = %message, "Work failed");
            ServerMessage::Error {
                session_id: Some(session_id.clone()),
                message,
            }
        }
    };
    deliver(&shared, &recipient, message);

    if shared.locks.release(&session_id, &recipient.connection_id) {
        let unlocked = ServerMessage::SessionUnlocked { session_id };
        publish(&shared, unlocked, &[recipient.connection_id.as_str()]);
    }
}
