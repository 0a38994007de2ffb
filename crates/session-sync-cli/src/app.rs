use std::path::{Path, PathBuf};

use colored::Colorize;

use session_sync::client::ClientEvent;
use session_sync::locks::LockPhase;
use session_sync::protocol::ServerMessage;
use session_sync::{ConnectionState, CredentialStore, SyncConfig, SyncError, SyncResult};

/// Resolved configuration shared by every subcommand.
pub struct CliContext {
    pub config: SyncConfig,
    pub store: CredentialStore,
}

impl CliContext {
    pub fn load(config_path: Option<&Path>, credential_file: Option<PathBuf>) -> SyncResult<Self> {
        let config = SyncConfig::discover(config_path)?;
        let path = credential_file
            .or_else(|| config.credential_path.clone())
            .or_else(CredentialStore::default_path)
            .ok_or_else(|| SyncError::ConfigError {
                reason: "no credential path configured and no home directory found".into(),
            })?;
        Ok(Self {
            config,
            store: CredentialStore::new(path),
        })
    }
}

pub fn print_pretty_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            eprintln!("{} {}", "Failed to format JSON output:".yellow(), err);
            println!("{value}");
        }
    }
}

pub fn format_state(state: ConnectionState) -> String {
    match state {
        ConnectionState::Connected => state.to_string().green().to_string(),
        ConnectionState::Connecting | ConnectionState::Authenticating => {
            state.to_string().yellow().to_string()
        }
        ConnectionState::Disconnected => state.to_string().dimmed().to_string(),
        ConnectionState::Failed => state.to_string().red().to_string(),
    }
}

/// One line per event; `None` for events not worth printing.
pub fn format_event(event: &ClientEvent) -> Option<String> {
    let line = match event {
        ClientEvent::StateChanged(state) => {
            format!("{} {}", "state".bright_blue(), format_state(*state))
        }
        ClientEvent::Ready {
            locked_sessions,
            sessions,
        } => format!(
            "{} {} sessions, {} locked",
            "ready".green(),
            sessions.len(),
            locked_sessions.len()
        ),
        ClientEvent::Lock(transition) => {
            let phase = match transition.phase {
                Some(LockPhase::Optimistic) => "optimistic".yellow(),
                Some(LockPhase::Confirmed) => "locked".cyan(),
                Some(LockPhase::RolledBack) => "rolled back".red(),
                None => "released".green(),
            };
            format!("{} {} {}", "lock".bright_blue(), transition.session_id, phase)
        }
        ClientEvent::Reconnecting { attempt, delay } => format!(
            "{} attempt {attempt} in {}ms",
            "reconnecting".yellow(),
            delay.as_millis()
        ),
        ClientEvent::ReconnectFailed { attempts } => {
            format!("{} after {attempts} attempts", "gave up".red())
        }
        ClientEvent::ZombieDetected { silent_for } => format!(
            "{} no heartbeat for {}s",
            "zombie".red(),
            silent_for.as_secs()
        ),
        ClientEvent::AuthenticationFailed { reason } => {
            format!("{} {reason}", "auth failed".red())
        }
        ClientEvent::Disconnected { reason } => format!("{} {reason}", "disconnected".dimmed()),
        ClientEvent::Message(message) => format_message(message)?,
    };
    Some(line)
}

fn format_message(message: &ServerMessage) -> Option<String> {
    let line = match message {
        ServerMessage::Complete { session_id, result } => {
            format!("{} {session_id} {result}", "complete".green())
        }
        ServerMessage::Error {
            session_id,
            message,
        } => format!(
            "{} {} {message}",
            "error".red(),
            session_id.as_ref().map_or("-", |s| s.as_str())
        ),
        ServerMessage::Busy { session_id } => format!("{} {session_id}", "busy".yellow()),
        ServerMessage::SessionDeleted { session_id } => {
            format!("{} {session_id}", "deleted".dimmed())
        }
        ServerMessage::Subscribed { session_id } => {
            format!("{} {session_id}", "subscribed".bright_blue())
        }
        // Lock changes are already reported as lock events.
        _ => return None,
    };
    Some(line)
}
