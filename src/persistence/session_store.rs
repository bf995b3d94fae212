//! File-backed store for the active agent session id.
//!
//! The file holds `#`-prefixed comment lines followed by at most one id
//! line. A missing file, or a file with only comments, means no session.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{AppError, Result};

const HEADER: &str = "# Active agent session id. Delete this file to start fresh.";

/// Reads and writes the session id file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Create a store backed by `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current session id, if one is stored.
    ///
    /// Read failures other than a missing file are logged and treated as
    /// no session.
    #[must_use]
    pub fn read(&self) -> Option<String> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(%err, path = %self.path.display(), "failed to read session file");
                return None;
            }
        };
        raw.lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
    }

    /// Persist `id` as the active session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for a blank or multi-line id, or
    /// `AppError::Io` if the file cannot be written.
    pub fn write(&self, id: &str) -> Result<()> {
        let id = id.trim();
        if id.is_empty() || id.contains('\n') || id.starts_with('#') {
            return Err(AppError::Validation(format!("invalid session id: {id:?}")));
        }
        let body = format!("{HEADER}\n# Updated: {}\n{id}\n", Utc::now().to_rfc3339());
        self.write_raw(&body)?;
        debug!(session_id = id, "session id stored");
        Ok(())
    }

    /// Forget the active session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn clear(&self) -> Result<()> {
        let body = format!("{HEADER}\n# Cleared: {}\n", Utc::now().to_rfc3339());
        self.write_raw(&body)?;
        debug!("session id cleared");
        Ok(())
    }

    fn write_raw(&self, body: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        fs::write(&self.path, body)
            .map_err(|err| AppError::Io(format!("failed to write {}: {err}", self.path.display())))
    }
}
