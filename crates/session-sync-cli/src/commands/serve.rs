use std::time::Duration;

use colored::Colorize;
use serde_json::{Value, json};

use session_sync::protocol::SessionId;
use session_sync::{ServerOptions, SyncResult, SyncServer};

use crate::app::CliContext;

pub async fn cmd_serve(context: CliContext, bind: Option<String>, work_ms: u64) -> SyncResult<()> {
    let credential = context.store.load_or_create()?;
    let options = ServerOptions::from_config(&context.config);
    let work = Duration::from_millis(work_ms);

    let server = SyncServer::new(
        credential,
        move |session_id: SessionId, payload: Value| async move {
            tokio::time::sleep(work).await;
            Ok::<_, String>(json!({ "session_id": session_id, "echo": payload }))
        },
        options,
    );

    let bind = bind.unwrap_or(context.config.bind_addr);
    let handle = server.bind(bind.as_str()).await?;
    println!("{} {}", "Listening on".green(), handle.url().cyan());
    println!(
        "Credential file: {}",
        context.store.path().display().to_string().dimmed()
    );
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    handle.shutdown().await;
    Ok(())
}
