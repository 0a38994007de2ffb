//! # Reachability Tracker
//!
//! Observes the host's network path and turns raw path updates into the
//! three transitions the reconnector cares about: the network went away,
//! the network came back, or the active interface changed underneath a live
//! connection.
//!
//! The platform integration (netlink, `SCNetworkReachability`, a mobile OS
//! callback, …) lives outside this crate and simply calls
//! [`ReachabilityTracker::update`]. The client watches the tracker's
//! channel.

use std::fmt;

use tokio::sync::watch;
use tracing::info;

/// Kind of interface carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkInterface {
    Wifi,
    Cellular,
    Wired,
    Other,
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wifi => "wifi",
            Self::Cellular => "cellular",
            Self::Wired => "wired",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Current network path as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPath {
    Unavailable,
    Available(NetworkInterface),
}

impl NetworkPath {
    pub fn is_available(self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// A meaningful change between two consecutive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityChange {
    BecameUnavailable,
    BecameAvailable(NetworkInterface),
    InterfaceChanged {
        from: NetworkInterface,
        to: NetworkInterface,
    },
}

impl ReachabilityChange {
    /// Classify the move from `previous` to `next`. `None` when nothing
    /// relevant changed.
    pub fn between(previous: NetworkPath, next: NetworkPath) -> Option<Self> {
        match (previous, next) {
            (NetworkPath::Available(_), NetworkPath::Unavailable) => Some(Self::BecameUnavailable),
            (NetworkPath::Unavailable, NetworkPath::Available(to)) => {
                Some(Self::BecameAvailable(to))
            }
            (NetworkPath::Available(from), NetworkPath::Available(to)) if from != to => {
                Some(Self::InterfaceChanged { from, to })
            }
            _ => None,
        }
    }
}

/// Holder of the current network path.
///
/// Assumes the network is available until told otherwise, so a host without
/// a platform integration still reconnects normally.
#[derive(Debug)]
pub struct ReachabilityTracker {
    tx: watch::Sender<NetworkPath>,
}

impl Default for ReachabilityTracker {
    fn default() -> Self {
        Self::new(NetworkPath::Available(NetworkInterface::Other))
    }
}

impl ReachabilityTracker {
    pub fn new(initial: NetworkPath) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> NetworkPath {
        *self.tx.borrow()
    }

    pub fn is_available(&self) -> bool {
        self.current().is_available()
    }

    /// Record a new path and return the transition it represents.
    ///
    /// Watchers are only woken for relevant transitions.
    pub fn update(&self, path: NetworkPath) -> Option<ReachabilityChange> {
        let mut change = None;
        self.tx.send_if_modified(|current| {
            change = ReachabilityChange::between(*current, path);
            *current = path;
            change.is_some()
        });
        if let Some(change) = change {
            info!(?change, "Network reachability changed");
        }
        change
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}
