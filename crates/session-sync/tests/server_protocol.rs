mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use session_sync::credential::Credential;
use session_sync::protocol::SessionId;
use session_sync::server::{ServerHandle, ServerOptions, SyncServer, WorkExecutor};
use tokio::sync::Notify;

use support::raw_client::RawClient;

/// Echoes the payload back once `gate` is notified. `"instant": true`
/// skips the wait and `"fail": true` returns an error.
fn gated_echo(gate: &Arc<Notify>) -> impl WorkExecutor + use<> {
    let gate = Arc::clone(gate);
    move |_session: SessionId, payload: Value| {
        let gate = Arc::clone(&gate);
        async move {
            if payload["fail"].as_bool() == Some(true) {
                return Err("executor failed".to_string());
            }
            if payload["instant"].as_bool() != Some(true) {
                gate.notified().await;
            }
            Ok(payload)
        }
    }
}

struct Harness<E> {
    handle: ServerHandle<E>,
    credential: Credential,
    gate: Arc<Notify>,
}

impl<E: WorkExecutor> Harness<E> {
    fn url(&self) -> String {
        self.handle.url()
    }

    fn secret(&self) -> &str {
        self.credential.expose()
    }

    async fn client(&self, client_id: &str) -> (RawClient, Value) {
        RawClient::authenticated(&self.url(), self.secret(), client_id).await
    }

    /// A client that follows `sessions` from the handshake on.
    async fn follower(&self, client_id: &str, sessions: &[&str]) -> (RawClient, Value) {
        RawClient::subscribed(&self.url(), self.secret(), client_id, sessions).await
    }
}

async fn start_server_or_skip(
    test_name: &str,
    options: ServerOptions,
) -> Option<Harness<impl WorkExecutor>> {
    support::init_tracing();
    let credential = Credential::generate();
    let gate = Arc::new(Notify::new());
    let server = SyncServer::new(credential.clone(), gated_echo(&gate), options);
    match server.bind("127.0.0.1:0").await {
        Ok(handle) => Some(Harness {
            handle,
            credential,
            gate,
        }),
        Err(err) => {
            eprintln!("Skipping {test_name}: unable to bind backend: {err}");
            None
        }
    }
}

fn quiet_options() -> ServerOptions {
    ServerOptions {
        heartbeat_interval: Duration::from_secs(3600),
        ..ServerOptions::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

// ─── Authentication ─────────────────────────────────────────────────────

#[tokio::test]
async fn valid_credential_gets_connected_then_state_sync() {
    let Some(harness) = start_server_or_skip("valid_credential", quiet_options()).await else {
        return;
    };
    let (client, sync) = harness.client("app-1").await;
    assert_eq!(sync["locked_sessions"], json!([]));
    assert_eq!(sync["sessions"], json!([]));
    assert_eq!(harness.handle.connections().authenticated().len(), 1);
    client.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn wrong_and_missing_credentials_are_rejected_identically() {
    let Some(harness) = start_server_or_skip("wrong_credential", quiet_options()).await else {
        return;
    };

    let mut wrong = RawClient::connect(&harness.url()).await;
    wrong
        .send_json(json!({"type": "connect", "credential": Credential::generate().expose()}))
        .await;
    let wrong_reply = wrong.recv_type("auth_error").await;
    wrong.expect_closed(Duration::from_secs(2)).await;

    let mut missing = RawClient::connect(&harness.url()).await;
    missing.send_json(json!({"type": "connect"})).await;
    let missing_reply = missing.recv_type("auth_error").await;
    missing.expect_closed(Duration::from_secs(2)).await;

    assert_eq!(wrong_reply, missing_reply);
    assert_eq!(wrong_reply["message"], "Authentication failed");
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn unauthenticated_dispatch_is_rejected() {
    let Some(harness) = start_server_or_skip("unauth_dispatch", quiet_options()).await else {
        return;
    };
    let mut client = RawClient::connect(&harness.url()).await;
    client
        .send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    client.recv_type("auth_error").await;
    client.expect_closed(Duration::from_secs(2)).await;
    assert!(!harness.handle.locks().is_locked(&SessionId::new("s1")));
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn ping_works_before_authentication() {
    let Some(harness) = start_server_or_skip("ping_unauth", quiet_options()).await else {
        return;
    };
    let mut client = RawClient::connect(&harness.url()).await;
    client.send_json(json!({"type": "ping"})).await;
    client.recv_type("pong").await;
    client.send_json(json!({"type": "ping"})).await;
    client.recv_type("pong").await;
    client.close().await;
    harness.handle.shutdown().await;
}

// ─── Messages ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_and_malformed_messages_get_an_error_without_closing() {
    let Some(harness) = start_server_or_skip("unknown_type", quiet_options()).await else {
        return;
    };
    let (mut client, _) = harness.client("app-1").await;

    client.send_json(json!({"type": "unknown"})).await;
    let error = client.recv_type("error").await;
    assert!(error["message"].as_str().unwrap().contains("unknown"));
    assert!(error.get("message_id").is_none());

    client.send_text("{not json").await;
    client.recv_type("error").await;

    client.send_json(json!({"type": "ping"})).await;
    client.recv_type("pong").await;
    client.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn camel_case_fields_are_accepted() {
    let Some(harness) = start_server_or_skip("camel_case", quiet_options()).await else {
        return;
    };
    let (mut client, _) = harness.client("app-1").await;
    client.send_json(json!({"type": "subscribe", "sessionId": "ABC"})).await;
    let reply = client.recv_type("subscribed").await;
    assert_eq!(reply["session_id"], "abc");
    client.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn dispatch_is_accepted_completed_and_second_dispatch_is_busy() {
    let Some(harness) = start_server_or_skip("dispatch_busy", quiet_options()).await else {
        return;
    };
    let (mut a, _) = harness.client("app-a").await;
    let (mut b, _) = harness.follower("app-b", &["S1"]).await;

    a.send_json(json!({"type": "dispatch", "session_id": "S1", "payload": {"n": 1}}))
        .await;
    a.recv_type("accepted").await;
    let locked = a.recv_type("session_locked").await;
    assert_eq!(locked["session_id"], "s1");
    b.recv_type("session_locked").await;

    b.send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    let busy = b.recv_type("busy").await;
    assert_eq!(busy["session_id"], "s1");

    harness.gate.notify_one();
    let complete = a.recv_type("complete").await;
    assert_eq!(complete["result"], json!({"n": 1}));
    let message_id = complete["message_id"].as_str().unwrap().to_string();
    a.recv_type("session_unlocked").await;
    b.recv_type("session_unlocked").await;
    assert!(!harness.handle.locks().is_locked(&SessionId::new("s1")));

    assert_eq!(harness.handle.acks().pending_count("app-a"), 1);
    a.send_json(json!({"type": "ack", "message_id": message_id})).await;
    wait_until(|| harness.handle.acks().pending_count("app-a") == 0).await;

    a.close().await;
    b.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn executor_failure_becomes_reliable_error() {
    let Some(harness) = start_server_or_skip("executor_failure", quiet_options()).await else {
        return;
    };
    let (mut client, _) = harness.client("app-1").await;
    client
        .send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {"fail": true}}))
        .await;
    client.recv_type("accepted").await;
    client.recv_type("session_locked").await;
    let error = client.recv_type("error").await;
    assert_eq!(error["session_id"], "s1");
    assert_eq!(error["message"], "executor failed");
    assert!(error["message_id"].is_string());
    client.recv_type("session_unlocked").await;
    client.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn state_sync_reports_locked_sessions() {
    let Some(harness) = start_server_or_skip("state_sync_locks", quiet_options()).await else {
        return;
    };
    let (mut a, _) = harness.client("app-a").await;
    a.send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    a.recv_type("accepted").await;

    let (b, sync) = harness.client("app-b").await;
    assert_eq!(sync["locked_sessions"], json!(["s1"]));
    assert_eq!(sync["sessions"][0]["session_id"], "s1");
    assert_eq!(sync["sessions"][0]["locked"], true);

    harness.gate.notify_one();
    a.close().await;
    b.close().await;
    harness.handle.shutdown().await;
}

// ─── Locks ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn locks_are_released_when_the_owner_disconnects() {
    let Some(harness) = start_server_or_skip("release_on_disconnect", quiet_options()).await
    else {
        return;
    };
    let (mut owner, _) = harness.client("owner").await;
    let (mut observer, _) = harness.follower("observer", &["s1"]).await;

    owner
        .send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    owner.recv_type("accepted").await;
    observer.recv_type("session_locked").await;

    owner.close().await;
    let unlocked = observer.recv_type("session_unlocked").await;
    assert_eq!(unlocked["session_id"], "s1");
    assert!(!harness.handle.locks().is_locked(&SessionId::new("s1")));

    // The orphaned work still finishes without re-broadcasting an unlock.
    harness.gate.notify_one();
    assert!(observer.try_recv_json(Duration::from_millis(200)).await.is_none());
    observer.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn manual_unlock_notifies_followers_and_frees_the_session() {
    let Some(harness) = start_server_or_skip("manual_unlock", quiet_options()).await else {
        return;
    };
    let (mut a, _) = harness.client("app-a").await;
    let (mut b, _) = harness.follower("app-b", &["s1"]).await;

    a.send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    a.recv_type("accepted").await;
    a.recv_type("session_locked").await;
    b.recv_type("session_locked").await;

    b.send_json(json!({"type": "unlock", "session_id": "s1"})).await;
    a.recv_type("session_unlocked").await;
    b.recv_type("session_unlocked").await;

    b.send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {"instant": true}}))
        .await;
    b.recv_type("accepted").await;

    harness.gate.notify_waiters();
    a.close().await;
    b.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn deleted_session_reaches_followers_and_refuses_new_work() {
    let Some(harness) = start_server_or_skip("delete_session", quiet_options()).await else {
        return;
    };
    let (mut a, _) = harness.client("app-a").await;
    let (mut b, _) = harness.follower("app-b", &["s9"]).await;
    let (mut bystander, _) = harness.client("app-c").await;

    a.send_json(json!({"type": "delete_session", "session_id": "s9"}))
        .await;
    a.recv_type("session_deleted").await;
    let deleted = b.recv_type("session_deleted").await;
    assert_eq!(deleted["session_id"], "s9");
    assert!(bystander.try_recv_json(Duration::from_millis(200)).await.is_none());

    a.send_json(json!({"type": "dispatch", "session_id": "s9", "payload": {}}))
        .await;
    let error = a.recv_type("error").await;
    assert_eq!(error["message"], "session has been deleted");
    assert!(!harness.handle.locks().is_locked(&SessionId::new("s9")));

    a.close().await;
    b.close().await;
    bystander.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn session_events_reach_only_followers_of_that_session() {
    let Some(harness) = start_server_or_skip("scoped_events", quiet_options()).await else {
        return;
    };
    let (mut owner, _) = harness.client("owner").await;
    let (mut follower, _) = harness.client("follower").await;
    let (mut other, _) = harness.follower("other", &["s2"]).await;

    follower
        .send_json(json!({"type": "subscribe", "session_id": "s1"}))
        .await;
    follower.recv_type("subscribed").await;

    owner
        .send_json(json!({"type": "dispatch", "session_id": "s1", "payload": {}}))
        .await;
    owner.recv_type("accepted").await;
    owner.recv_type("session_locked").await;
    follower.recv_type("session_locked").await;

    follower
        .send_json(json!({"type": "unsubscribe", "session_id": "s1"}))
        .await;
    follower.recv_type("unsubscribed").await;

    harness.gate.notify_one();
    owner.recv_type("complete").await;
    owner.recv_type("session_unlocked").await;

    assert!(follower.try_recv_json(Duration::from_millis(200)).await.is_none());
    assert!(other.try_recv_json(Duration::from_millis(200)).await.is_none());

    owner.close().await;
    follower.close().await;
    other.close().await;
    harness.handle.shutdown().await;
}

// ─── Reliable delivery ──────────────────────────────────────────────────

#[tokio::test]
async fn unacknowledged_outcomes_replay_in_order_after_reconnect() {
    let Some(harness) = start_server_or_skip("replay", quiet_options()).await else {
        return;
    };
    let (mut first, _) = harness.client("app-1").await;
    for session in ["s1", "s2"] {
        let payload = json!({"instant": true, "id": session});
        first
            .send_json(json!({"type": "dispatch", "session_id": session, "payload": payload}))
            .await;
    }
    let mut originals = Vec::new();
    while originals.len() < 2 {
        let frame = first.recv_json().await;
        if frame["type"] == "complete" {
            originals.push(frame["message_id"].as_str().unwrap().to_string());
        }
    }
    first.close().await;
    wait_until(|| harness.handle.connections().is_empty()).await;
    assert_eq!(harness.handle.acks().pending_count("app-1"), 2);

    let mut second = RawClient::connect(&harness.url()).await;
    second
        .send_json(json!({"type": "connect", "credential": harness.secret(), "client_id": "app-1"}))
        .await;
    second.recv_type("connected").await;
    let replayed: Vec<String> = vec![
        second.recv_type("complete").await["message_id"].as_str().unwrap().to_string(),
        second.recv_type("complete").await["message_id"].as_str().unwrap().to_string(),
    ];
    assert_eq!(replayed, originals);
    second.recv_type("active_state_sync").await;

    for id in &replayed {
        second.send_json(json!({"type": "ack", "message_id": id})).await;
    }
    wait_until(|| harness.handle.acks().pending_count("app-1") == 0).await;
    second.close().await;
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn anonymous_client_buffers_are_dropped_when_it_leaves() {
    let Some(harness) = start_server_or_skip("anonymous_buffers", quiet_options()).await else {
        return;
    };
    for _ in 0..3 {
        let connect = json!({"type": "connect", "credential": harness.secret()});
        let (mut client, _) = RawClient::handshake(&harness.url(), connect).await;
        let dispatch =
            json!({"type": "dispatch", "session_id": "s1", "payload": {"instant": true}});
        client.send_json(dispatch).await;
        client.recv_type("accepted").await;
        client.recv_type("session_locked").await;
        client.recv_type("complete").await;
        client.recv_type("session_unlocked").await;
        assert_eq!(harness.handle.acks().total_pending(), 1);
        client.close().await;
        wait_until(|| harness.handle.acks().total_pending() == 0).await;
    }
    assert_eq!(harness.handle.acks().client_count(), 0);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn named_client_buffers_expire_after_retention() {
    let options = ServerOptions {
        ack_retention: Duration::from_millis(100),
        ..quiet_options()
    };
    let Some(harness) = start_server_or_skip("ack_retention", options).await else {
        return;
    };
    let (mut client, _) = harness.client("app-1").await;
    let dispatch = json!({"type": "dispatch", "session_id": "s1", "payload": {"instant": true}});
    client.send_json(dispatch).await;
    client.recv_type("accepted").await;
    client.recv_type("session_locked").await;
    client.recv_type("complete").await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(harness.handle.acks().pending_count("app-1"), 1);

    client.close().await;
    wait_until(|| harness.handle.acks().pending_count("app-1") == 0).await;
    assert_eq!(harness.handle.acks().client_count(), 0);
    harness.handle.shutdown().await;
}

// ─── Heartbeat ──────────────────────────────────────────────────────────

#[tokio::test]
async fn authenticated_connections_receive_heartbeats() {
    let options = ServerOptions {
        heartbeat_interval: Duration::from_millis(50),
        ..ServerOptions::default()
    };
    let Some(harness) = start_server_or_skip("heartbeats", options).await else {
        return;
    };
    let (mut client, _) = harness.client("app-1").await;
    let mut beats = 0;
    while beats < 2 {
        let frame = client
            .try_recv_json(Duration::from_secs(2))
            .await
            .expect("no heartbeat");
        if frame["type"] == "heartbeat" {
            assert!(frame["timestamp"].as_u64().unwrap() > 0);
            beats += 1;
        }
    }
    client.close().await;
    harness.handle.shutdown().await;
}
