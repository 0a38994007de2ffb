//! Connection authentication.
//!
//! Every socket must present the pre-shared credential in its first
//! `connect` message. Until then the only thing it may do is `ping`. A
//! missing credential and a wrong one are answered identically.

use crate::credential::Credential;
use crate::protocol::{ClientMessage, SessionId};

/// Text of every `auth_error`. Never varies with the failure cause.
pub const AUTH_FAILURE_MESSAGE: &str = "Authentication failed";

/// How an unauthenticated connection's message should be handled.
#[derive(Debug, PartialEq, Eq)]
pub enum Gate {
    /// Answer without requiring authentication.
    Open,
    /// The credential matched; `client_key` identifies the client.
    ///
    /// `anonymous` is set when the client did not name itself and the
    /// connection id stands in as its key.
    Accept {
        client_key: String,
        anonymous: bool,
        subscriptions: Vec<SessionId>,
    },
    /// Send `auth_error` and close.
    Reject,
}

pub struct Authenticator {
    expected: Credential,
}

impl Authenticator {
    pub fn new(expected: Credential) -> Self {
        Self { expected }
    }

    /// Constant-time credential check.
    pub fn verify(&self, presented: Option<&Credential>) -> bool {
        presented.is_some_and(|c| c == &self.expected)
    }

    /// Classify the first messages of a not-yet-authenticated connection.
    ///
    /// `connection_id` becomes the client key when the client does not
    /// name itself.
    pub fn gate(&self, message: &ClientMessage, connection_id: &str) -> Gate {
        match message {
            ClientMessage::Ping => Gate::Open,
            ClientMessage::Connect {
                credential,
                client_id,
                subscriptions,
            } if self.verify(credential.as_ref()) => {
                let named = client_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty());
                Gate::Accept {
                    client_key: named.unwrap_or(connection_id).to_string(),
                    anonymous: named.is_none(),
                    subscriptions: subscriptions.clone(),
                }
            }
            _ => Gate::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> (Authenticator, Credential) {
        let credential = Credential::generate();
        (Authenticator::new(credential.clone()), credential)
    }

    #[test]
    fn test_ping_is_open() {
        let (auth, _) = authenticator();
        assert_eq!(auth.gate(&ClientMessage::Ping, "c1"), Gate::Open);
    }

    #[test]
    fn test_valid_credential_accepts_with_client_id() {
        let (auth, credential) = authenticator();
        let gate = auth.gate(
            &ClientMessage::Connect {
                credential: Some(credential),
                client_id: Some("tablet".into()),
                subscriptions: vec![SessionId::new("s1")],
            },
            "c1",
        );
        assert_eq!(
            gate,
            Gate::Accept {
                client_key: "tablet".into(),
                anonymous: false,
                subscriptions: vec![SessionId::new("s1")],
            }
        );
    }

    #[test]
    fn test_missing_client_id_falls_back_to_connection_id() {
        let (auth, credential) = authenticator();
        let gate = auth.gate(
            &ClientMessage::Connect {
                credential: Some(credential),
                client_id: Some("  ".into()),
                subscriptions: Vec::new(),
            },
            "c1",
        );
        assert_eq!(
            gate,
            Gate::Accept {
                client_key: "c1".into(),
                anonymous: true,
                subscriptions: Vec::new(),
            }
        );
    }

    #[test]
    fn test_missing_and_wrong_credentials_are_indistinguishable() {
        let (auth, _) = authenticator();
        let missing = auth.gate(
            &ClientMessage::Connect {
                credential: None,
                client_id: None,
                subscriptions: Vec::new(),
            },
            "c1",
        );
        let wrong = auth.gate(
            &ClientMessage::Connect {
                credential: Some(Credential::generate()),
                client_id: None,
                subscriptions: Vec::new(),
            },
            "c1",
        );
        assert_eq!(missing, Gate::Reject);
        assert_eq!(wrong, Gate::Reject);
    }

    #[test]
    fn test_other_messages_before_connect_are_rejected() {
        let (auth, _) = authenticator();
        let msg = ClientMessage::Subscribe {
            session_id: SessionId::new("s1"),
        };
        assert_eq!(auth.gate(&msg, "c1"), Gate::Reject);
    }
}
