//! # session-sync
//!
//! Session synchronization and connection resilience over a single
//! persistent WebSocket link between a client app and its local backend.
//!
//! The crate ships both ends of the link:
//!
//! - [`SessionClient`] survives socket drops, zombie sockets, network
//!   changes and app backgrounding, and keeps local session locks
//!   consistent with the backend.
//! - [`SyncServer`] authenticates clients with a pre-shared credential,
//!   serializes work per session, publishes lock changes to each session's
//!   subscribers, and replays unacknowledged work outcomes after a reconnect.
//!
//! ## Quick Start
//!
//! ```no_run
//! use session_sync::{ClientOptions, CredentialStore, SessionClient, SyncConfig};
//!
//! # async fn demo() -> session_sync::SyncResult<()> {
//! let config = SyncConfig::discover(None)?;
//! let credential = CredentialStore::new("/var/lib/my-app/credential").load()?;
//!
//! let client = SessionClient::new(ClientOptions::from_config(&config), credential);
//! client.connect().await?;
//! println!("state: {}", client.state());
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! | Module | Side | Role |
//! |--------|------|------|
//! | [`protocol`] | both | Typed messages and the wire codec |
//! | [`credential`] | both | Credential format, constant-time check, on-disk store |
//! | [`backoff`], [`reconnect`], [`reachability`] | client | When and whether to reconnect |
//! | [`locks`], [`queue`] | client | Local lock table and the priority queue |
//! | [`heartbeat`] | both | Server beacon and client zombie watchdog |
//! | [`server`] | backend | Connections, auth gate, lock coordinator, ack buffer |
//!
//! ## Configuration
//!
//! See [`SyncConfig`]. Either a `session-sync.toml` file or the
//! `SESSION_SYNC_URL` / `SESSION_SYNC_BIND` environment variables.

pub mod backoff;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod heartbeat;
pub mod locks;
pub mod protocol;
pub mod queue;
pub mod reachability;
pub mod reconnect;
pub mod server;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use client::{ClientEvent, ClientOptions, SessionClient};
pub use config::SyncConfig;
pub use credential::{Credential, CredentialStore};
pub use error::{SyncError, SyncResult};
pub use protocol::SessionId;
pub use queue::PriorityQueue;
pub use reconnect::ConnectionState;
pub use server::{ServerHandle, ServerOptions, SyncServer};
