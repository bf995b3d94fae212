//! Context preamble prepended to every agent payload.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::warn;

/// Reads the operator-maintained context file.
#[derive(Debug, Clone)]
pub struct ContextPreamble {
    path: PathBuf,
}

impl ContextPreamble {
    /// Create a reader for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current preamble text. A missing or unreadable file yields an empty
    /// preamble.
    #[must_use]
    pub fn load(&self) -> String {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().to_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => {
                warn!(%err, path = %self.path.display(), "failed to read context file");
                String::new()
            }
        }
    }
}
