use colored::Colorize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use session_sync::client::ClientEvent;
use session_sync::protocol::{ServerMessage, SessionId};
use session_sync::{ClientOptions, SessionClient, SyncError, SyncResult};

use crate::app::{CliContext, format_event, print_pretty_json};

fn start_client(context: &CliContext, url: Option<String>) -> SyncResult<SessionClient> {
    let credential = context.store.load()?;
    let mut options = ClientOptions::from_config(&context.config);
    if let Some(url) = url {
        options.server_url = url;
    }
    println!("Connecting to {}...", options.server_url.cyan());
    Ok(SessionClient::new(options, credential))
}

pub async fn cmd_watch(
    context: CliContext,
    url: Option<String>,
    sessions: Vec<String>,
) -> SyncResult<()> {
    let client = start_client(&context, url)?;
    let mut events = client.event_receiver();

    for session in sessions {
        client.subscribe(SessionId::new(session)).await?;
    }
    client.connect().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = format_event(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    eprintln!("{} skipped {skipped} events", "warning:".yellow());
                }
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    client.disconnect().await?;
    client.shutdown().await;
    Ok(())
}

pub async fn cmd_dispatch(
    context: CliContext,
    url: Option<String>,
    session: String,
    payload: &str,
) -> SyncResult<()> {
    let payload: Value = serde_json::from_str(payload)?;
    let session_id = SessionId::new(session);
    let client = start_client(&context, url)?;
    let mut events = client.event_receiver();

    client.connect().await?;
    client.dispatch(session_id.clone(), payload).await?;

    let outcome = loop {
        match events.recv().await {
            Ok(ClientEvent::Message(ServerMessage::Complete {
                session_id: done,
                result,
            })) if done == session_id => break Ok(result),
            Ok(ClientEvent::Message(ServerMessage::Error {
                session_id: Some(failed),
                message,
            })) if failed == session_id => {
                break Err(SyncError::WorkFailed {
                    session_id: failed.to_string(),
                    message,
                });
            }
            Ok(ClientEvent::Message(ServerMessage::Busy { session_id: busy }))
                if busy == session_id =>
            {
                break Err(SyncError::Busy {
                    session_id: busy.to_string(),
                });
            }
            Ok(ClientEvent::AuthenticationFailed { reason }) => {
                break Err(SyncError::AuthenticationFailed { reason });
            }
            Ok(ClientEvent::ReconnectFailed { attempts }) => {
                break Err(SyncError::ReconnectExhausted { attempts });
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break Err(SyncError::NotConnected),
        }
    };

    client.disconnect().await?;
    client.shutdown().await;
    print_pretty_json(&outcome?);
    Ok(())
}
