use clap::Subcommand;
use colored::Colorize;

use session_sync::SyncResult;

use crate::app::CliContext;

#[derive(Subcommand)]
pub enum CredentialAction {
    /// Print the stored credential, creating one on first run
    Show {
        /// Print the full secret instead of a masked form
        #[arg(long)]
        reveal: bool,
    },
    /// Replace the stored credential with a new one
    Regenerate,
    /// Print where the credential is stored
    Path,
}

pub fn cmd_credential(context: &CliContext, action: &CredentialAction) -> SyncResult<()> {
    match action {
        CredentialAction::Show { reveal } => {
            let credential = context.store.load_or_create()?;
            if *reveal {
                println!("{}", credential.expose());
            } else {
                println!("{}", credential.masked());
                eprintln!("{}", "Use --reveal to print the full credential.".dimmed());
            }
        }
        CredentialAction::Regenerate => {
            let credential = context.store.regenerate()?;
            println!("{} {}", "Regenerated:".green(), credential.expose());
            println!(
                "{}",
                "Connected clients keep working until they reconnect.".dimmed()
            );
        }
        CredentialAction::Path => {
            println!("{}", context.store.path().display());
        }
    }
    Ok(())
}
