//! Set of live connections, used for session events and the heartbeat
//! beacon.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::protocol::{Envelope, codec};
use crate::server::connection::ServerConnection;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ServerConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<ServerConnection>) {
        self.connections
            .insert(connection.id().to_string(), connection);
    }

    /// Remove a connection. Idempotent.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.remove(connection_id).map(|(_, c)| c)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of authenticated connections.
    ///
    /// Collected before any sending so no shard lock is held while callers
    /// mutate the registry.
    pub fn authenticated(&self) -> Vec<Arc<ServerConnection>> {
        self.connections
            .iter()
            .filter(|c| c.is_authenticated())
            .map(|c| Arc::clone(c.value()))
            .collect()
    }

    /// Send an envelope to every authenticated connection.
    ///
    /// Returns the number of connections that accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let Ok(text) = codec::encode_server(envelope) else {
            return 0;
        };
        let targets = self.authenticated();
        let delivered = targets
            .iter()
            .filter(|conn| conn.send_text(text.clone()))
            .count();
        debug!(delivered, total = targets.len(), "Broadcast sent");
        delivered
    }

    /// Send a session event to the connections following that session.
    ///
    /// Receivers are the authenticated connections subscribed to the
    /// message's session plus any connection listed in `also`. A message
    /// that names no session goes to every authenticated connection.
    ///
    /// Returns the number of connections that accepted it.
    pub fn publish(&self, envelope: &Envelope, also: &[&str]) -> usize {
        let Some(session_id) = envelope.message.session_id() else {
            return self.broadcast(envelope);
        };
        let Ok(text) = codec::encode_server(envelope) else {
            return 0;
        };
        let targets: Vec<Arc<ServerConnection>> = self
            .authenticated()
            .into_iter()
            .filter(|conn| conn.is_subscribed(session_id) || also.iter().any(|id| *id == conn.id()))
            .collect();
        let delivered = targets
            .iter()
            .filter(|conn| conn.send_text(text.clone()))
            .count();
        debug!(%session_id, delivered, "Session event published");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerMessage, SessionId};
    use crate::server::connection::Outbound;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_connection(id: &str) -> (Arc<ServerConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Arc::new(ServerConnection::new(id.into(), tx, CancellationToken::new())),
            rx,
        )
    }

    #[test]
    fn test_add_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = make_connection("c1");
        registry.add(conn);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_skips_unauthenticated() {
        let registry = ConnectionRegistry::new();
        let (authed, mut authed_rx) = make_connection("c1");
        let (anon, mut anon_rx) = make_connection("c2");
        authed.authenticate("client-a".into(), false);
        registry.add(authed);
        registry.add(anon);

        let sent = registry.broadcast(&Envelope::plain(ServerMessage::SessionLocked {
            session_id: SessionId::new("s1"),
        }));

        assert_eq!(sent, 1);
        assert!(authed_rx.try_recv().is_ok());
        assert!(anon_rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_reaches_subscribers_and_named_connections_only() {
        let registry = ConnectionRegistry::new();
        let (follower, mut follower_rx) = make_connection("c1");
        let (owner, mut owner_rx) = make_connection("c2");
        let (bystander, mut bystander_rx) = make_connection("c3");
        for (conn, key) in [(&follower, "a"), (&owner, "b"), (&bystander, "c")] {
            conn.authenticate(key.into(), false);
        }
        follower.subscribe(SessionId::new("s1"));
        bystander.subscribe(SessionId::new("s2"));
        registry.add(follower);
        registry.add(owner);
        registry.add(bystander);

        let sent = registry.publish(
            &Envelope::plain(ServerMessage::SessionUnlocked {
                session_id: SessionId::new("s1"),
            }),
            &["c2"],
        );

        assert_eq!(sent, 2);
        assert!(follower_rx.try_recv().is_ok());
        assert!(owner_rx.try_recv().is_ok());
        assert!(bystander_rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_session_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = make_connection("c1");
        let (b, mut b_rx) = make_connection("c2");
        a.authenticate("a".into(), false);
        b.authenticate("b".into(), false);
        registry.add(a);
        registry.add(b);

        let sent = registry.publish(&Envelope::plain(ServerMessage::Pong), &[]);
        assert_eq!(sent, 2);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
    }
}
