//! # Reconnector
//!
//! Decides *when* the client should (re)open its connection. The state
//! machine is pure: it owns no timers and no sockets. The client actor feeds
//! it lifecycle facts (attempt started, transport open, sync done, link
//! lost, network changed, app foregrounded) and executes the returned
//! [`ReconnectAction`].
//!
//! ```text
//!             request_connect
//! Disconnected ──────────────▶ Connecting ──▶ Authenticating ──▶ Connected
//!      ▲                           │                │                │
//!      └──── connection_lost ──────┴────────────────┴────────────────┘
//!                                                   │
//!                                     auth rejected ▼
//!                                                 Failed
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::reachability::ReachabilityChange;

/// Connection lifecycle as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    /// Authenticated and state-synced; traffic may flow.
    Connected,
    /// Terminal until the host intervenes: credential rejected or retries
    /// exhausted.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// Whether a connection attempt is in progress.
    pub fn is_establishing(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectAction {
    /// Nothing.
    Idle,
    /// Open a connection immediately, cancelling any pending retry.
    ConnectNow,
    /// Open a connection once `delay` elapses. `attempt` is 1-based.
    RetryAfter { attempt: u32, delay: Duration },
    /// Cancel any pending retry; wait for the network to return.
    AwaitNetwork,
    /// Automatic retry is exhausted.
    GiveUp { attempts: u32 },
    /// Drop the live connection and open a new one immediately.
    Cycle,
}

/// Reconnection state machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: BackoffPolicy,
    enabled: bool,
    state: ConnectionState,
    attempt: u32,
    network_available: bool,
    wants_connection: bool,
    auth_rejected: bool,
}

impl Reconnector {
    pub fn new(policy: BackoffPolicy, enabled: bool) -> Self {
        Self {
            policy,
            enabled,
            state: ConnectionState::Disconnected,
            attempt: 0,
            network_available: true,
            wants_connection: false,
            auth_rejected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last success or reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn network_available(&self) -> bool {
        self.network_available
    }

    pub fn set_network_available(&mut self, available: bool) {
        self.network_available = available;
    }

    /// Whether the host currently wants a live connection.
    pub fn wants_connection(&self) -> bool {
        self.wants_connection
    }

    fn may_reconnect(&self) -> bool {
        self.wants_connection && !self.auth_rejected
    }

    // ─── Host requests ──────────────────────────────────────────────

    /// The host asked for a connection. Clears any terminal failure.
    pub fn request_connect(&mut self) -> ReconnectAction {
        self.wants_connection = true;
        self.auth_rejected = false;
        self.attempt = 0;
        if self.state.is_connected() || self.state.is_establishing() {
            return ReconnectAction::Idle;
        }
        self.state = ConnectionState::Disconnected;
        if self.network_available {
            ReconnectAction::ConnectNow
        } else {
            ReconnectAction::AwaitNetwork
        }
    }

    /// The host asked to disconnect. No automatic retry follows.
    pub fn request_disconnect(&mut self) {
        self.wants_connection = false;
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
    }

    /// The app returned to the foreground. Resets backoff and reconnects
    /// right away if the link is down.
    pub fn app_foregrounded(&mut self) -> ReconnectAction {
        self.attempt = 0;
        if !self.may_reconnect() {
            return ReconnectAction::Idle;
        }
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.state = ConnectionState::Disconnected;
                if self.network_available {
                    ReconnectAction::ConnectNow
                } else {
                    ReconnectAction::AwaitNetwork
                }
            }
            _ => ReconnectAction::Idle,
        }
    }

    // ─── Connection lifecycle ───────────────────────────────────────

    pub fn attempt_started(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn transport_opened(&mut self) {
        self.state = ConnectionState::Authenticating;
    }

    /// The handshake completed and state is synced.
    pub fn sync_completed(&mut self) {
        if self.attempt > 0 {
            info!(attempts = self.attempt, "Reconnected");
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// The backend rejected the credential. Terminal until the next
    /// [`request_connect`](Self::request_connect).
    pub fn authentication_rejected(&mut self) {
        self.auth_rejected = true;
        self.state = ConnectionState::Failed;
    }

    /// The transport closed, failed to open, or was declared a zombie.
    pub fn connection_lost(&mut self) -> ReconnectAction {
        self.state = ConnectionState::Disconnected;
        if !self.may_reconnect() || !self.enabled {
            return ReconnectAction::Idle;
        }
        if !self.network_available {
            debug!("Network unavailable, holding reconnect");
            return ReconnectAction::AwaitNetwork;
        }
        if self.policy.is_exhausted(self.attempt) {
            warn!(attempts = self.attempt, "Reconnect attempts exhausted");
            self.state = ConnectionState::Failed;
            return ReconnectAction::GiveUp {
                attempts: self.attempt,
            };
        }
        let delay = self.policy.jittered_delay(self.attempt);
        self.attempt += 1;
        ReconnectAction::RetryAfter {
            attempt: self.attempt,
            delay,
        }
    }

    // ─── Network ────────────────────────────────────────────────────

    pub fn network_changed(&mut self, change: ReachabilityChange) -> ReconnectAction {
        match change {
            ReachabilityChange::BecameUnavailable => {
                self.network_available = false;
                if self.state == ConnectionState::Disconnected {
                    ReconnectAction::AwaitNetwork
                } else {
                    ReconnectAction::Idle
                }
            }
            ReachabilityChange::BecameAvailable(_) => {
                self.network_available = true;
                self.attempt = 0;
                match self.state {
                    ConnectionState::Disconnected | ConnectionState::Failed
                        if self.may_reconnect() =>
                    {
                        self.state = ConnectionState::Disconnected;
                        ReconnectAction::ConnectNow
                    }
                    _ => ReconnectAction::Idle,
                }
            }
            ReachabilityChange::InterfaceChanged { .. } => {
                self.network_available = true;
                if self.may_reconnect()
                    && (self.state.is_connected() || self.state.is_establishing())
                {
                    self.attempt = 0;
                    ReconnectAction::Cycle
                } else {
                    ReconnectAction::Idle
                }
            }
        }
    }
}
