//! # Credential
//!
//! The backend is protected by a single pre-shared secret. It has a fixed,
//! recognizable prefix and a fixed total length so that a pasted value can be
//! sanity-checked before it ever reaches the wire.
//!
//! Comparison is constant-time (`subtle`), so the time taken to reject a
//! credential does not depend on where the first differing byte is. The
//! secret lives in a single file inside a directory that only its owner can
//! read (`0700` directory, `0600` file on Unix).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::{SyncError, SyncResult};

/// Recognizable prefix of every credential.
pub const CREDENTIAL_PREFIX: &str = "vcs_";

/// Total credential length, prefix included.
pub const CREDENTIAL_LEN: usize = 43;

const FILE_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o700;

/// Compare two byte strings in constant time with respect to their contents.
///
/// Length is not treated as secret; every valid credential has the same length.
pub fn constant_time_equals(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

/// The pre-shared secret.
///
/// `Debug` output is masked and equality is constant-time.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a value without validating it. Used for whatever a peer sent.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Wrap a value, rejecting anything with the wrong prefix or length.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidCredential`] when the format is wrong.
    pub fn parse(value: impl Into<String>) -> SyncResult<Self> {
        let credential = Self(value.into().trim().to_string());
        credential.validate()?;
        Ok(credential)
    }

    /// Generate a fresh random credential.
    pub fn generate() -> Self {
        let body: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CREDENTIAL_LEN - CREDENTIAL_PREFIX.len())
            .map(char::from)
            .collect();
        Self(format!("{CREDENTIAL_PREFIX}{body}"))
    }

    /// Check prefix, length, and character set.
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidCredential`] describing the first problem.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.0.starts_with(CREDENTIAL_PREFIX) {
            return Err(SyncError::InvalidCredential {
                reason: format!("expected prefix `{CREDENTIAL_PREFIX}`"),
            });
        }
        if self.0.len() != CREDENTIAL_LEN {
            return Err(SyncError::InvalidCredential {
                reason: format!("expected {CREDENTIAL_LEN} characters, got {}", self.0.len()),
            });
        }
        if !self.0[CREDENTIAL_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric())
        {
            return Err(SyncError::InvalidCredential {
                reason: "body must be ASCII alphanumeric".into(),
            });
        }
        Ok(())
    }

    /// The raw secret. Only for sending it or showing it to its owner.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Prefix plus the last four characters, for logs and status output.
    pub fn masked(&self) -> String {
        let tail_start = self.0.len().saturating_sub(4).max(CREDENTIAL_PREFIX.len());
        match self.0.get(tail_start..) {
            Some(tail) if self.0.starts_with(CREDENTIAL_PREFIX) => {
                format!("{CREDENTIAL_PREFIX}…{tail}")
            }
            _ => "…".to_string(),
        }
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        constant_time_equals(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

// ─── Store ──────────────────────────────────────────────────────────────

/// On-disk home of the credential.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.config/session-sync/credential` (or `%APPDATA%` on Windows).
    pub fn default_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|dir| PathBuf::from(dir).join("session-sync").join("credential"))
        }
        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("HOME").ok().map(|dir| {
                PathBuf::from(dir)
                    .join(".config")
                    .join("session-sync")
                    .join("credential")
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, reason: impl Into<String>) -> SyncError {
        SyncError::CredentialStore {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Read and validate the stored credential.
    ///
    /// # Errors
    /// Returns [`SyncError::CredentialStore`] if the file is missing,
    /// unreadable, or does not contain a well-formed credential.
    pub fn load(&self) -> SyncResult<Credential> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| self.store_error(format!("failed to read: {e}")))?;
        Credential::parse(raw).map_err(|e| self.store_error(format!("corrupted: {e}")))
    }

    /// Load the credential, generating and saving one on first run.
    ///
    /// A file that exists but is corrupted is an error, never silently replaced.
    ///
    /// # Errors
    /// Propagates [`load`](Self::load) and [`save`](Self::save) failures.
    pub fn load_or_create(&self) -> SyncResult<Credential> {
        if self.path.exists() {
            return self.load();
        }
        let credential = Credential::generate();
        self.save(&credential)?;
        tracing::info!(path = %self.path.display(), "Generated new credential");
        Ok(credential)
    }

    /// Replace the stored credential with a freshly generated one.
    ///
    /// # Errors
    /// Propagates [`save`](Self::save) failures.
    pub fn regenerate(&self) -> SyncResult<Credential> {
        let credential = Credential::generate();
        self.save(&credential)?;
        tracing::info!(path = %self.path.display(), "Regenerated credential");
        Ok(credential)
    }

    /// Write the credential with owner-only permissions.
    ///
    /// # Errors
    /// Returns [`SyncError::CredentialStore`] on any filesystem failure.
    pub fn save(&self, credential: &Credential) -> SyncResult<()> {
        credential.validate()?;
        if let Some(parent) = self.path.parent() {
            self.ensure_private_dir(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(FILE_MODE);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|e| self.store_error(format!("failed to open for writing: {e}")))?;
        file.write_all(credential.expose().as_bytes())
            .map_err(|e| self.store_error(format!("failed to write: {e}")))?;

        // `mode` only applies on creation; tighten an existing file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(FILE_MODE))
                .map_err(|e| self.store_error(format!("failed to set permissions: {e}")))?;
        }
        Ok(())
    }

    fn ensure_private_dir(&self, dir: &Path) -> SyncResult<()> {
        if dir.as_os_str().is_empty() || dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(dir)
            .map_err(|e| self.store_error(format!("failed to create {}: {e}", dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(DIRECTORY_MODE)).map_err(|e| {
                self.store_error(format!("failed to set permissions on {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}
