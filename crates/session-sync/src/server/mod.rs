//! # Backend
//!
//! [`SyncServer`] accepts WebSocket connections, authenticates them, and
//! coordinates session locks, reliable delivery and heartbeats across all
//! of them. What a unit of work actually *does* is supplied by the host
//! through [`WorkExecutor`].
//!
//! ```no_run
//! use serde_json::Value;
//! use session_sync::credential::Credential;
//! use session_sync::protocol::SessionId;
//! use session_sync::server::{ServerOptions, SyncServer};
//!
//! # async fn run() -> session_sync::SyncResult<()> {
//! let server = SyncServer::new(
//!     Credential::generate(),
//!     |_session: SessionId, payload: Value| async move { Ok::<_, String>(payload) },
//!     ServerOptions::default(),
//! );
//! let handle = server.bind("127.0.0.1:8080").await?;
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod ack_buffer;
pub mod auth;
pub mod connection;
mod handler;
pub mod lock_coordinator;
pub mod registry;
pub mod sessions;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::credential::Credential;
use crate::error::SyncResult;
use crate::heartbeat::HeartbeatBroadcaster;
use crate::protocol::SessionId;

pub use ack_buffer::{AckBuffer, DeliveryTarget};
pub use auth::Authenticator;
pub use connection::ServerConnection;
pub use lock_coordinator::{AcquireOutcome, LockCoordinator};
pub use registry::ConnectionRegistry;
pub use sessions::{SessionRecord, SessionRegistry};

/// Longest pause between two ack retention sweeps.
const MAX_RETENTION_SWEEP: Duration = Duration::from_secs(60);

/// Host-supplied execution of one unit of work for a session.
///
/// The backend guarantees at most one call per session is in flight. `Ok`
/// becomes `complete{result}`, `Err` becomes `error{message}`.
pub trait WorkExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        session_id: SessionId,
        payload: Value,
    ) -> impl Future<Output = Result<Value, String>> + Send;
}

impl<F, Fut> WorkExecutor for F
where
    F: Fn(SessionId, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    fn execute(
        &self,
        session_id: SessionId,
        payload: Value,
    ) -> impl Future<Output = Result<Value, String>> + Send {
        self(session_id, payload)
    }
}

/// Backend tunables.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub heartbeat_interval: Duration,
    pub max_buffered_per_client: usize,
    /// How long a detached client's unacknowledged messages are kept.
    pub ack_retention: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl ServerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat.interval(),
            max_buffered_per_client: config.ack.max_buffered_per_client,
            ack_retention: config.ack.retention(),
        }
    }
}

/// State shared by the accept loop, every connection task and every work
/// task.
pub(crate) struct ServerShared<E> {
    pub(crate) authenticator: Authenticator,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) locks: LockCoordinator,
    pub(crate) acks: AckBuffer,
    pub(crate) sessions: SessionRegistry,
    pub(crate) executor: E,
    pub(crate) shutdown: CancellationToken,
}

/// An unbound backend.
pub struct SyncServer<E> {
    shared: Arc<ServerShared<E>>,
    options: ServerOptions,
}

impl<E: WorkExecutor> SyncServer<E> {
    pub fn new(credential: Credential, executor: E, options: ServerOptions) -> Self {
        let shared = ServerShared {
            authenticator: Authenticator::new(credential),
            connections: Arc::new(ConnectionRegistry::new()),
            locks: LockCoordinator::new(),
            acks: AckBuffer::new(options.max_buffered_per_client),
            sessions: SessionRegistry::new(),
            executor,
            shutdown: CancellationToken::new(),
        };
        Self {
            shared: Arc::new(shared),
            options,
        }
    }

    /// Registry for seeding sessions discovered in persisted work.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    /// Bind the listener and start serving.
    ///
    /// # Errors
    /// Returns [`SyncError::Io`](crate::SyncError::Io) if the address cannot be bound.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> SyncResult<ServerHandle<E>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Session sync backend listening");

        let heartbeat = HeartbeatBroadcaster::start(
            Arc::clone(&self.shared.connections),
            self.options.heartbeat_interval,
            self.shared.shutdown.child_token(),
        );
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        let retention_task = tokio::spawn(retention_loop(
            Arc::clone(&self.shared),
            self.options.ack_retention,
        ));

        Ok(ServerHandle {
            shared: self.shared,
            local_addr,
            accept_task,
            retention_task,
            heartbeat,
        })
    }
}

async fn accept_loop<E: WorkExecutor>(listener: TcpListener, shared: Arc<ServerShared<E>>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handler::run_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            () = shared.shutdown.cancelled() => break,
        }
    }
    info!("Accept loop stopped");
}

/// Periodically forget clients that stayed away longer than `retention`.
async fn retention_loop<E: WorkExecutor>(shared: Arc<ServerShared<E>>, retention: Duration) {
    let every = (retention / 4).clamp(Duration::from_millis(10), MAX_RETENTION_SWEEP);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.acks.prune_idle(retention, Instant::now());
            }
            () = shared.shutdown.cancelled() => break,
        }
    }
}

/// A running backend.
pub struct ServerHandle<E> {
    shared: Arc<ServerShared<E>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    retention_task: JoinHandle<()>,
    heartbeat: HeartbeatBroadcaster,
}

impl<E: WorkExecutor> ServerHandle<E> {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.shared.connections
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.shared.locks
    }

    pub fn acks(&self) -> &AckBuffer {
        &self.shared.acks
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.shared.sessions
    }

    /// Stop accepting, close every connection, stop the beacon.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        self.heartbeat.stop();
        let _ = (&mut self.accept_task).await;
        let _ = (&mut self.retention_task).await;
        info!("Session sync backend stopped");
    }
}

impl<E> Drop for ServerHandle<E> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
