mod credential;
mod serve;
mod watch;

pub use credential::{CredentialAction, cmd_credential};
pub use serve::cmd_serve;
pub use watch::{cmd_dispatch, cmd_watch};
