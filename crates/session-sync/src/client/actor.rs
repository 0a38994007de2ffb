//! The client's single logical actor.
//!
//! Every mutation of connection state happens here, one event at a time:
//! host commands, socket frames, timer expiries and reachability changes
//! all arrive through one `select!` loop. Socket reads and connection
//! attempts run in helper tasks that report back through a channel tagged
//! with a generation number, so events from a torn-down socket are ignored.

use std::collections::BTreeSet;
use std::future::pending;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::client::applied::AppliedMessages;
use crate::client::{ClientEvent, ClientOptions, Command};
use crate::credential::Credential;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::HeartbeatWatchdog;
use crate::locks::{LocalLockTable, LockTransition};
use crate::protocol::codec;
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::{ClientMessage, Envelope, ServerMessage, SessionId};
use crate::reachability::{NetworkPath, ReachabilityChange};
use crate::reconnect::{ConnectionState, ReconnectAction, Reconnector};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Buffer between socket helper tasks and the actor.
const LINK_CHANNEL_BUFFER: usize = 256;

/// How long a graceful close may take before the socket is simply dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Reports from socket helper tasks.
enum LinkEvent {
    Opened {
        generation: u64,
        stream: Box<WsStream>,
    },
    OpenFailed {
        generation: u64,
        error: SyncError,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LinkPhase {
    AwaitingHello,
    AwaitingConnected,
    AwaitingSync,
    Ready,
}

/// One open socket.
struct Link {
    generation: u64,
    writer: WsWriter,
    reader: JoinHandle<()>,
    phase: LinkPhase,
    handshake_deadline: Option<Instant>,
    watchdog: Option<HeartbeatWatchdog>,
}

impl Link {
    fn next_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
            .or_else(|| self.watchdog.map(|w| w.deadline()))
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub(crate) struct ClientActor {
    options: ClientOptions,
    credential: Credential,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnectionState>,
    reachability: watch::Receiver<NetworkPath>,
    reachability_open: bool,
    last_path: NetworkPath,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    reconnector: Reconnector,
    locks: LocalLockTable,
    subscriptions: BTreeSet<SessionId>,
    applied: AppliedMessages,
    generation: u64,
    link: Option<Link>,
    connect_task: Option<JoinHandle<()>>,
    retry_at: Option<Instant>,
    drain_deadline: Option<Instant>,
    /// Disconnected because the app went to the background.
    suspended: bool,
    pending_connects: Vec<oneshot::Sender<SyncResult<()>>>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_path(rx: &mut watch::Receiver<NetworkPath>, open: bool) -> Option<NetworkPath> {
    if !open {
        return pending().await;
    }
    match rx.changed().await {
        Ok(()) => Some(*rx.borrow_and_update()),
        Err(_) => None,
    }
}

impl ClientActor {
    pub(crate) fn new(
        options: ClientOptions,
        credential: Credential,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<ClientEvent>,
        state_tx: watch::Sender<ConnectionState>,
        mut reachability: watch::Receiver<NetworkPath>,
    ) -> Self {
        let last_path = *reachability.borrow_and_update();
        let mut reconnector = Reconnector::new(options.backoff.clone(), options.reconnect_enabled);
        reconnector.set_network_available(last_path.is_available());
        let (link_tx, link_rx) = mpsc::channel(LINK_CHANNEL_BUFFER);
        Self {
            options,
            credential,
            commands,
            events,
            state_tx,
            reachability,
            reachability_open: true,
            last_path,
            link_tx,
            link_rx,
            reconnector,
            locks: LocalLockTable::new(),
            subscriptions: BTreeSet::new(),
            applied: AppliedMessages::default(),
            generation: 0,
            link: None,
            connect_task: None,
            retry_at: None,
            drain_deadline: None,
            suspended: false,
            pending_connects: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let retry_at = self.retry_at;
            let link_deadline = self.link.as_ref().and_then(Link::next_deadline);
            let drain_at = self.drain_deadline;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.link_rx.recv() => self.handle_link_event(event).await,
                () = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
                () = sleep_until_opt(link_deadline) => self.handle_link_deadline(),
                () = sleep_until_opt(drain_at) => {
                    info!("Drain window elapsed with locks still held");
                    self.suspend().await;
                }
                path = next_path(&mut self.reachability, self.reachability_open) => match path {
                    Some(path) => self.handle_path(path),
                    None => self.reachability_open = false,
                },
            }
        }

        self.close_link("client shut down").await;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        debug!("Client actor stopped");
    }

    // ─── Commands ───────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.suspended = false;
                if self.reconnector.state().is_connected() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.pending_connects.push(reply);
                let action = self.reconnector.request_connect();
                self.apply_action(action);
                self.publish_state();
            }
            Command::Disconnect(reply) => {
                self.suspended = false;
                self.drain_deadline = None;
                self.reconnector.request_disconnect();
                self.close_link("disconnect requested").await;
                self.publish_state();
                let _ = reply.send(());
            }
            Command::Subscribe(session_id, reply) => {
                let changed = self.subscriptions.insert(session_id.clone());
                let result = if changed && self.connect_sent() {
                    self.send(ClientMessage::Subscribe { session_id }).await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Unsubscribe(session_id, reply) => {
                let changed = self.subscriptions.remove(&session_id);
                let result = if changed && self.connect_sent() {
                    self.send(ClientMessage::Unsubscribe { session_id }).await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Send(message, reply) => {
                let result = if self.is_ready() {
                    self.send(message).await
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = reply.send(result);
            }
            Command::Dispatch {
                session_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.dispatch(session_id, payload).await);
            }
            Command::Unlock(session_id, reply) => {
                let result = if self.is_ready() {
                    if let Some(t) = self.locks.release(&session_id) {
                        self.publish_lock(t);
                    }
                    self.send(ClientMessage::Unlock { session_id }).await
                } else {
                    Err(SyncError::NotConnected)
                };
                let _ = reply.send(result);
                self.check_drain().await;
            }
            Command::SetCredential(credential) => {
                self.credential = credential;
            }
            Command::Foregrounded => {
                self.drain_deadline = None;
                let action = if std::mem::take(&mut self.suspended) {
                    self.reconnector.request_connect()
                } else {
                    self.reconnector.app_foregrounded()
                };
                self.apply_action(action);
                self.publish_state();
            }
            Command::Backgrounded => {
                if !self.reconnector.wants_connection() {
                    return;
                }
                self.suspended = true;
                self.drain_deadline = Some(Instant::now() + self.options.drain_timeout);
                self.check_drain().await;
            }
            Command::LockedSessions(reply) => {
                let _ = reply.send(self.locks.locked_sessions());
            }
            Command::Subscriptions(reply) => {
                let _ = reply.send(self.subscriptions.iter().cloned().collect());
            }
            Command::Shutdown => {}
        }
    }

    async fn dispatch(
        &mut self,
        session_id: SessionId,
        payload: serde_json::Value,
    ) -> SyncResult<()> {
        if !self.is_ready() {
            return Err(SyncError::NotConnected);
        }
        let Some(transition) = self.locks.acquire_optimistic(&session_id) else {
            return Err(SyncError::Busy {
                session_id: session_id.to_string(),
            });
        };
        self.publish_lock(transition);
        self.send(ClientMessage::Dispatch {
            session_id,
            payload,
        })
        .await
    }

    // ─── Connection attempts ────────────────────────────────────────

    fn start_attempt(&mut self) {
        self.retry_at = None;
        self.teardown_link("new connection attempt");
        self.generation += 1;
        let generation = self.generation;

        self.reconnector.attempt_started();
        self.publish_state();

        let url = self.options.server_url.clone();
        let timeout = self.options.connect_timeout;
        let tx = self.link_tx.clone();
        info!(url = %url, attempt = self.reconnector.attempt(), "Connecting to backend");

        self.connect_task = Some(tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connect_async(url.as_str())).await;
            let event = match result {
                Ok(Ok((stream, _response))) => LinkEvent::Opened {
                    generation,
                    stream: Box::new(stream),
                },
                Ok(Err(e)) => LinkEvent::OpenFailed {
                    generation,
                    error: SyncError::ConnectionFailed {
                        url,
                        reason: e.to_string(),
                    },
                },
                Err(_) => LinkEvent::OpenFailed {
                    generation,
                    error: SyncError::Timeout {
                        seconds: timeout.as_secs(),
                    },
                },
            };
            let _ = tx.send(event).await;
        }));
    }

    fn spawn_reader(&self, generation: u64, mut reader: WsReader) -> JoinHandle<()> {
        let tx = self.link_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                let text = match reader.next().await {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) => break "closed by backend".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                };
                if tx.send(LinkEvent::Frame { generation, text }).await.is_err() {
                    return;
                }
            };
            let _ = tx.send(LinkEvent::Closed { generation, reason }).await;
        })
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let live_link = self.link.as_ref().map(|l| l.generation);
        match event {
            LinkEvent::Opened { generation, stream } if generation == self.generation => {
                self.connect_task = None;
                let (writer, reader) = (*stream).split();
                let reader = self.spawn_reader(generation, reader);
                self.link = Some(Link {
                    generation,
                    writer,
                    reader,
                    phase: LinkPhase::AwaitingHello,
                    handshake_deadline: Some(Instant::now() + self.options.handshake_timeout),
                    watchdog: None,
                });
                self.reconnector.transport_opened();
                self.publish_state();
                debug!(generation, "Socket open, awaiting hello");
            }
            LinkEvent::OpenFailed { generation, error } if generation == self.generation => {
                self.connect_task = None;
                warn!(error = %error, "Connection attempt failed");
                self.on_link_lost(error.to_string());
            }
            LinkEvent::Frame { generation, text } if live_link == Some(generation) => {
                self.handle_frame(&text).await;
            }
            LinkEvent::Closed { generation, reason } if live_link == Some(generation) => {
                info!(reason, "Connection closed");
                self.on_link_lost(reason);
            }
            _ => debug!("Ignoring event from a superseded connection"),
        }
    }

    fn handle_link_deadline(&mut self) {
        let now = Instant::now();
        let Some(link) = &self.link else {
            return;
        };
        if link.handshake_deadline.is_some_and(|d| now >= d) {
            warn!(phase = ?link.phase, "Handshake timed out");
            self.on_link_lost("handshake timed out".into());
            return;
        }
        if let Some(watchdog) = link.watchdog {
            if watchdog.is_breached(now) {
                let silent_for = watchdog.silent_for(now);
                warn!(
                    silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                    "No heartbeat, connection is a zombie"
                );
                self.emit(ClientEvent::ZombieDetected { silent_for });
                let error = SyncError::ZombieConnection {
                    silent_secs: silent_for.as_secs(),
                };
                self.on_link_lost(error.to_string());
            }
        }
    }

    fn handle_path(&mut self, path: NetworkPath) {
        let change = ReachabilityChange::between(self.last_path, path);
        self.last_path = path;
        if let Some(change) = change {
            let action = self.reconnector.network_changed(change);
            self.apply_action(action);
            self.publish_state();
        }
    }

    fn apply_action(&mut self, action: ReconnectAction) {
        match action {
            ReconnectAction::Idle => {}
            ReconnectAction::ConnectNow => self.start_attempt(),
            ReconnectAction::RetryAfter { attempt, delay } => {
                info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
                self.emit(ClientEvent::Reconnecting { attempt, delay });
            }
            ReconnectAction::AwaitNetwork => {
                self.retry_at = None;
                self.fail_pending(|| SyncError::ConnectionFailed {
                    url: String::new(),
                    reason: "network unreachable".into(),
                });
            }
            ReconnectAction::GiveUp { attempts } => {
                self.retry_at = None;
                self.emit(ClientEvent::ReconnectFailed { attempts });
                self.fail_pending(|| SyncError::ReconnectExhausted { attempts });
            }
            ReconnectAction::Cycle => {
                info!("Network interface changed, cycling connection");
                self.start_attempt();
            }
        }
    }

    /// Tear down after an unplanned loss and let the reconnector decide.
    /// Pending `connect` calls keep waiting while retries are scheduled.
    fn on_link_lost(&mut self, reason: String) {
        self.teardown_link(&reason);
        let action = self.reconnector.connection_lost();
        if action == ReconnectAction::Idle {
            self.fail_pending(|| SyncError::ConnectionLost {
                reason: reason.clone(),
            });
        }
        self.apply_action(action);
        self.publish_state();
    }

    /// Drop the socket and every local lock. Synchronous, so nothing can
    /// observe a lock that outlived its connection.
    fn teardown_link(&mut self, reason: &str) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.generation += 1;
        let had_link = self.link.take().is_some();
        for transition in self.locks.clear_all() {
            self.publish_lock(transition);
        }
        if had_link {
            self.emit(ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Close the socket gracefully, then tear down.
    async fn close_link(&mut self, reason: &str) {
        self.retry_at = None;
        if let Some(link) = self.link.as_mut() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, link.writer.close()).await;
        }
        self.teardown_link(reason);
        self.fail_pending(|| SyncError::NotConnected);
    }

    async fn suspend(&mut self) {
        self.drain_deadline = None;
        self.reconnector.request_disconnect();
        self.close_link("app backgrounded").await;
        self.publish_state();
    }

    async fn check_drain(&mut self) {
        if self.drain_deadline.is_some() && !self.locks.has_held_locks() {
            debug!("All locks cleared, suspending");
            self.suspend().await;
        }
    }

    // ─── Inbound ────────────────────────────────────────────────────

    async fn handle_frame(&mut self, text: &str) {
        let Envelope {
            message_id,
            message,
        } = match codec::decode_server(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable server message");
                return;
            }
        };

        if let Some(id) = &message_id {
            if self.applied.contains(id) {
                debug!(message_id = %id, "Duplicate delivery, acknowledging again");
                let _ = self.send(ClientMessage::Ack { message_id: id.clone() }).await;
                return;
            }
        }

        self.apply(message).await;

        if let Some(id) = message_id {
            self.applied.insert(id.clone());
            let _ = self.send(ClientMessage::Ack { message_id: id }).await;
        }
    }

    async fn apply(&mut self, message: ServerMessage) {
        let phase = self.link.as_ref().map(|l| l.phase);
        match &message {
            ServerMessage::Hello { protocol_version } => {
                if phase != Some(LinkPhase::AwaitingHello) {
                    debug!("Unexpected hello");
                    return;
                }
                if *protocol_version != PROTOCOL_VERSION {
                    warn!(
                        server = protocol_version,
                        client = PROTOCOL_VERSION,
                        "Protocol version mismatch"
                    );
                }
                self.set_phase(LinkPhase::AwaitingConnected);
                let connect = ClientMessage::Connect {
                    credential: Some(self.credential.clone()),
                    client_id: Some(self.options.client_id.clone()),
                    subscriptions: self.subscriptions.iter().cloned().collect(),
                };
                let _ = self.send(connect).await;
                return;
            }
            ServerMessage::Connected => {
                if phase == Some(LinkPhase::AwaitingConnected) {
                    self.set_phase(LinkPhase::AwaitingSync);
                }
                return;
            }
            ServerMessage::AuthError { message } => {
                self.on_auth_rejected(message.clone());
                return;
            }
            ServerMessage::Heartbeat { .. } => {
                if let Some(watchdog) = self.link.as_mut().and_then(|l| l.watchdog.as_mut()) {
                    watchdog.record(Instant::now());
                }
                return;
            }
            ServerMessage::ActiveStateSync {
                locked_sessions,
                sessions,
            } => {
                for transition in self.locks.reconcile(locked_sessions) {
                    self.publish_lock(transition);
                }
                if phase.is_some_and(|p| p < LinkPhase::Ready) {
                    self.mark_ready();
                    self.emit(ClientEvent::Ready {
                        locked_sessions: locked_sessions.clone(),
                        sessions: sessions.clone(),
                    });
                }
            }
            ServerMessage::Accepted { session_id }
            | ServerMessage::SessionLocked { session_id } => {
                if let Some(t) = self.locks.confirm(session_id) {
                    self.publish_lock(t);
                }
            }
            ServerMessage::Busy { session_id } => {
                if let Some(t) = self.locks.roll_back(session_id) {
                    self.publish_lock(t);
                }
            }
            ServerMessage::Complete { session_id, .. }
            | ServerMessage::Error {
                session_id: Some(session_id),
                ..
            }
            | ServerMessage::SessionUnlocked { session_id }
            | ServerMessage::SessionDeleted { session_id } => {
                if let Some(t) = self.locks.release(session_id) {
                    self.publish_lock(t);
                }
            }
            _ => {}
        }
        self.emit(ClientEvent::Message(message));
        self.check_drain().await;
    }

    fn mark_ready(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.phase = LinkPhase::Ready;
            link.handshake_deadline = None;
            link.watchdog = Some(HeartbeatWatchdog::new(
                Instant::now(),
                self.options.heartbeat_timeout,
            ));
        }
        self.reconnector.sync_completed();
        self.publish_state();
        info!("Connected and synchronized");
        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    fn on_auth_rejected(&mut self, reason: String) {
        warn!("Backend rejected the credential");
        self.retry_at = None;
        self.reconnector.authentication_rejected();
        self.teardown_link("authentication failed");
        self.publish_state();
        self.emit(ClientEvent::AuthenticationFailed {
            reason: reason.clone(),
        });
        self.fail_pending(|| SyncError::AuthenticationFailed {
            reason: reason.clone(),
        });
    }

    // ─── Outbound ───────────────────────────────────────────────────

    async fn send(&mut self, message: ClientMessage) -> SyncResult<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(SyncError::NotConnected);
        };
        let text = codec::encode_client(&message)?;
        debug!(message_type = message.message_type(), "Sending");
        if let Err(e) = link.writer.send(Message::Text(text.into())).await {
            let error = SyncError::from(e);
            warn!(error = %error, "Send failed");
            self.on_link_lost(error.to_string());
            return Err(error);
        }
        Ok(())
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn is_ready(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.phase == LinkPhase::Ready)
    }

    /// The backend has accepted our credential on the current socket.
    /// Whether this link's `connect` already went out. Later subscription
    /// changes travel as their own frames behind it.
    fn connect_sent(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|l| l.phase >= LinkPhase::AwaitingConnected)
    }

    fn set_phase(&mut self, phase: LinkPhase) {
        if let Some(link) = self.link.as_mut() {
            link.phase = phase;
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> SyncError) {
        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(Err(error()));
        }
    }

    fn publish_lock(&self, transition: LockTransition) {
        debug!(session_id = %transition.session_id, phase = ?transition.phase, "Lock changed");
        self.emit(ClientEvent::Lock(transition));
    }

    fn publish_state(&self) {
        let state = self.reconnector.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(%state, "Connection state changed");
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
