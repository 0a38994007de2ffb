//! # Heartbeat
//!
//! Liveness on top of the transport, in both directions of trust:
//!
//! - The backend runs a [`HeartbeatBroadcaster`] that sends `heartbeat` to
//!   every authenticated connection at a fixed interval and prunes any
//!   connection the beacon can no longer reach.
//! - The client keeps a [`HeartbeatWatchdog`]. If no beacon arrives within
//!   `timeout` (default 2 × 45 s) the connection is a zombie: the socket may
//!   look open but nothing is getting through.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;
use crate::server::ConnectionRegistry;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ─── Client side ────────────────────────────────────────────────────────

/// Tracks the last beacon and when silence becomes fatal.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatWatchdog {
    last_received: Instant,
    timeout: Duration,
}

impl HeartbeatWatchdog {
    /// Start watching as of `now`.
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            last_received: now,
            timeout,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_received = self.last_received.max(now);
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// The instant at which the link is declared a zombie.
    pub fn deadline(&self) -> Instant {
        self.last_received + self.timeout
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_received)
    }

    pub fn is_breached(&self, now: Instant) -> bool {
        self.silent_for(now) >= self.timeout
    }
}

// ─── Server side ────────────────────────────────────────────────────────

/// Outcome of one beacon round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BeatReport {
    pub sent: usize,
    pub pruned: Vec<String>,
}

/// Send one beacon to every authenticated connection.
///
/// Connections whose channel refuses the beacon are removed from the
/// registry and terminated.
pub fn beat(registry: &ConnectionRegistry) -> BeatReport {
    let message = ServerMessage::Heartbeat {
        timestamp: unix_millis(),
    };
    let mut report = BeatReport::default();
    for conn in registry.authenticated() {
        if conn.send_message(message.clone()) {
            report.sent += 1;
        } else {
            warn!(connection_id = %conn.id(), "Heartbeat undeliverable, pruning connection");
            registry.remove(conn.id());
            conn.terminate();
            report.pruned.push(conn.id().to_string());
        }
    }
    debug!(sent = report.sent, pruned = report.pruned.len(), "Heartbeat round");
    report
}

/// Periodic beacon task.
///
/// Runs until [`stop()`](Self::stop) is called, the cancellation token
/// fires, or the broadcaster is dropped.
pub struct HeartbeatBroadcaster {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl HeartbeatBroadcaster {
    pub fn start(
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            beat(&registry);
                        }
                        () = cancel.cancelled() => break,
                    }
                }
                debug!("Heartbeat broadcaster stopped");
            })
        };

        Self {
            handle: Some(handle),
            cancel,
        }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HeartbeatBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}
