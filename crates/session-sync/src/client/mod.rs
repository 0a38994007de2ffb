//! # Session Client
//!
//! [`SessionClient`] keeps one logical link to the backend alive across
//! socket drops, network changes and app lifecycle transitions:
//!
//! - **Handshake**: `hello` → `connect{credential, subscriptions}` →
//!   `connected` → `active_state_sync`. The subscription set rides on
//!   `connect`, so the backend has it before taking the state snapshot. The
//!   client is only *connected* once the state sync arrives.
//! - **Automatic reconnection** with capped exponential backoff and jitter
//! - **Zombie detection**: a socket with no heartbeat for the configured
//!   timeout is torn down and reconnected
//! - **Reliable delivery**: every `message_id` is acknowledged, and replays
//!   of already-applied messages are acknowledged again but not re-applied
//! - **Optimistic locks** confirmed or rolled back by the backend, and
//!   cleared the moment a socket goes away
//!
//! ## Usage
//!
//! ```no_run
//! use session_sync::client::{ClientEvent, ClientOptions, SessionClient};
//! use session_sync::credential::Credential;
//! use session_sync::protocol::SessionId;
//!
//! # async fn demo(credential: Credential) -> session_sync::SyncResult<()> {
//! let client = SessionClient::new(ClientOptions::new("ws://127.0.0.1:8080"), credential);
//! let mut events = client.event_receiver();
//!
//! client.connect().await?;
//! client.subscribe(SessionId::new("s1")).await?;
//! client.dispatch(SessionId::new("s1"), serde_json::json!({"text": "hi"})).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::Message(message) = event {
//!         println!("{message:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! All state lives in a single background task. The handle only sends it
//! commands, so it is cheap to share behind an `Arc`.

mod actor;
pub mod applied;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::credential::Credential;
use crate::error::{SyncError, SyncResult};
use crate::locks::LockTransition;
use crate::protocol::{ClientMessage, ServerMessage, SessionId, SessionSummary};
use crate::reachability::ReachabilityTracker;
use crate::reconnect::ConnectionState;

use actor::ClientActor;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Client tunables, usually built from a [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_url: String,
    pub client_id: String,
    pub backoff: BackoffPolicy,
    pub reconnect_enabled: bool,
    /// Silence after which the socket is declared a zombie.
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    /// Socket open until `active_state_sync`.
    pub handshake_timeout: Duration,
    /// How long a backgrounded client waits for its locks to clear.
    pub drain_timeout: Duration,
}

impl ClientOptions {
    /// Defaults with the given backend URL and a random client id.
    pub fn new(server_url: impl Into<String>) -> Self {
        let mut options = Self::from_config(&SyncConfig::default());
        options.server_url = server_url.into();
        options
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()));
        Self {
            server_url: config.server_url.clone(),
            client_id,
            backoff: BackoffPolicy::from_config(&config.reconnect),
            reconnect_enabled: config.reconnect.enabled,
            heartbeat_timeout: config.heartbeat.timeout(),
            connect_timeout: config.timeouts.connect(),
            handshake_timeout: config.timeouts.handshake(),
            drain_timeout: config.timeouts.drain(),
        }
    }
}

/// Lifecycle and data events emitted by [`SessionClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),

    /// Handshake finished; carries the backend's authoritative state.
    Ready {
        locked_sessions: Vec<SessionId>,
        sessions: Vec<SessionSummary>,
    },

    /// Any server message after it has been applied locally.
    Message(ServerMessage),

    /// A local lock changed phase. `phase: None` means released.
    Lock(LockTransition),

    Reconnecting { attempt: u32, delay: Duration },

    ReconnectFailed { attempts: u32 },

    /// No heartbeat for `silent_for`; the socket is being replaced.
    ZombieDetected { silent_for: Duration },

    /// Terminal until a new credential is set and `connect` is called.
    AuthenticationFailed { reason: String },

    Disconnected { reason: String },
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Connect(Reply<SyncResult<()>>),
    Disconnect(Reply<()>),
    Subscribe(SessionId, Reply<SyncResult<()>>),
    Unsubscribe(SessionId, Reply<SyncResult<()>>),
    Send(ClientMessage, Reply<SyncResult<()>>),
    Dispatch {
        session_id: SessionId,
        payload: Value,
        reply: Reply<SyncResult<()>>,
    },
    Unlock(SessionId, Reply<SyncResult<()>>),
    SetCredential(Credential),
    Foregrounded,
    Backgrounded,
    LockedSessions(Reply<Vec<SessionId>>),
    Subscriptions(Reply<Vec<SessionId>>),
    Shutdown,
}

/// Handle to the client actor.
///
/// See [module docs](self) for usage.
pub struct SessionClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    reachability: Arc<ReachabilityTracker>,
    actor: Option<JoinHandle<()>>,
}

impl SessionClient {
    /// Spawn the client actor. Must be called inside a Tokio runtime.
    ///
    /// The client starts disconnected; call [`connect`](Self::connect).
    pub fn new(options: ClientOptions, credential: Credential) -> Self {
        Self::with_reachability(options, credential, Arc::new(ReachabilityTracker::default()))
    }

    /// Like [`new`](Self::new), driven by a host-owned reachability tracker.
    pub fn with_reachability(
        options: ClientOptions,
        credential: Credential,
        reachability: Arc<ReachabilityTracker>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let actor = ClientActor::new(
            options,
            credential,
            command_rx,
            events.clone(),
            state_tx,
            reachability.subscribe(),
        );
        let actor = tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            events,
            state,
            reachability,
            actor: Some(actor),
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Connect and wait until the backend's state sync has been applied.
    ///
    /// Returns immediately if already connected.
    ///
    /// # Errors
    /// [`SyncError::AuthenticationFailed`] if the credential is rejected,
    /// [`SyncError::ReconnectExhausted`] once retries are used up, or a
    /// connection error when the network is unreachable.
    pub async fn connect(&self) -> SyncResult<()> {
        self.request(Command::Connect).await?
    }

    /// Close the socket and stop reconnecting.
    pub async fn disconnect(&self) -> SyncResult<()> {
        self.request(Command::Disconnect).await
    }

    /// Replace the credential used by the next handshake.
    pub async fn set_credential(&self, credential: Credential) -> SyncResult<()> {
        self.post(Command::SetCredential(credential)).await
    }

    /// The host app returned to the foreground.
    pub async fn app_foregrounded(&self) -> SyncResult<()> {
        self.post(Command::Foregrounded).await
    }

    /// The host app went to the background. The socket closes once no
    /// locks are held, or when the drain timeout expires.
    pub async fn app_backgrounded(&self) -> SyncResult<()> {
        self.post(Command::Backgrounded).await
    }

    /// Stop the actor and close the socket.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
    }

    // ─── Sessions ───────────────────────────────────────────────────

    /// Add a subscription. It is restored on every reconnect.
    pub async fn subscribe(&self, session_id: SessionId) -> SyncResult<()> {
        self.request(|reply| Command::Subscribe(session_id, reply)).await?
    }

    pub async fn unsubscribe(&self, session_id: SessionId) -> SyncResult<()> {
        self.request(|reply| Command::Unsubscribe(session_id, reply)).await?
    }

    /// Start a unit of work, taking an optimistic lock on the session.
    ///
    /// # Errors
    /// [`SyncError::Busy`] if this client already holds the lock,
    /// [`SyncError::NotConnected`] before the handshake completes.
    pub async fn dispatch(&self, session_id: SessionId, payload: Value) -> SyncResult<()> {
        self.request(|reply| Command::Dispatch {
            session_id,
            payload,
            reply,
        })
        .await?
    }

    /// Force-release a session lock.
    pub async fn unlock(&self, session_id: SessionId) -> SyncResult<()> {
        self.request(|reply| Command::Unlock(session_id, reply)).await?
    }

    pub async fn delete_session(&self, session_id: SessionId) -> SyncResult<()> {
        self.send(ClientMessage::DeleteSession { session_id }).await
    }

    pub async fn ping(&self) -> SyncResult<()> {
        self.send(ClientMessage::Ping).await
    }

    /// Send a raw message on the current socket.
    pub async fn send(&self, message: ClientMessage) -> SyncResult<()> {
        self.request(|reply| Command::Send(message, reply)).await?
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub async fn locked_sessions(&self) -> SyncResult<Vec<SessionId>> {
        self.request(Command::LockedSessions).await
    }

    pub async fn subscriptions(&self) -> SyncResult<Vec<SessionId>> {
        self.request(Command::Subscriptions).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to client events.
    pub fn event_receiver(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The tracker the host should feed with network path updates.
    pub fn reachability(&self) -> &Arc<ReachabilityTracker> {
        &self.reachability
    }

    // ─── Internal helpers ───────────────────────────────────────────

    async fn post(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.post(make(reply)).await?;
        rx.await.map_err(|_| SyncError::NotConnected)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(actor) = self.actor.take() {
            actor.abort();
        }
    }
}
