//! # session-sync-cli
//!
//! Command-line front end for the session-sync crate: inspect or rotate the
//! pre-shared credential, run a backend with a demo executor, or attach a
//! client that prints connection and lock events as they happen.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

mod app;
mod commands;

use app::CliContext;
use commands::{CredentialAction, cmd_credential, cmd_dispatch, cmd_serve, cmd_watch};

/// Session synchronization backend and client tools.
#[derive(Parser)]
#[command(name = "session-sync", version, about)]
struct Cli {
    /// Path to session-sync.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Credential file override
    #[arg(long, global = true)]
    credential_file: Option<PathBuf>,

    /// Enable verbose logging (set RUST_LOG for fine-grained control)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show or regenerate the pre-shared credential
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Run a backend that echoes every dispatched payload back
    Serve {
        /// Listen address override
        #[arg(long)]
        bind: Option<String>,

        /// Simulated work duration per dispatch, in milliseconds
        #[arg(long, default_value_t = 500)]
        work_ms: u64,
    },

    /// Connect and print events until Ctrl-C
    Watch {
        /// Backend URL override
        #[arg(long)]
        url: Option<String>,

        /// Sessions to subscribe to
        #[arg(short, long = "session")]
        sessions: Vec<String>,
    },

    /// Dispatch one unit of work and wait for its outcome
    Dispatch {
        /// Backend URL override
        #[arg(long)]
        url: Option<String>,

        session: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            "session_sync=debug,session_sync_cli=debug".into()
        } else {
            "session_sync=warn".into()
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let context = match CliContext::load(cli.config.as_deref(), cli.credential_file) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("{} {}", "Configuration error:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Credential { action } => cmd_credential(&context, &action),
        Command::Serve { bind, work_ms } => cmd_serve(context, bind, work_ms).await,
        Command::Watch { url, sessions } => cmd_watch(context, url, sessions).await,
        Command::Dispatch {
            url,
            session,
            payload,
        } => cmd_dispatch(context, url, session, &payload).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}
