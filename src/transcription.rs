//! Voice-note transcription boundary.
//!
//! Transcription runs an external speech-to-text command with the audio
//! path as its last argument and reads the transcript from stdout.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::TranscriptionConfig;
use crate::{AppError, Result};

/// Turns audio files into text.
pub trait Transcriber: Send + Sync {
    /// Transcribe the audio file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transcription` when no usable transcript comes back.
    fn transcribe(&self, path: PathBuf) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// Transcriber backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    command: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    /// Create a transcriber running `command args... <path>`.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl Transcriber for CommandTranscriber {
    fn transcribe(&self, path: PathBuf) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            debug!(path = %path.display(), command = self.command, "transcribing voice note");
            let output = Command::new(&self.command)
                .args(&self.args)
                .arg(&path)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| {
                    AppError::Transcription(format!("failed to run {}: {err}", self.command))
                })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(status = ?output.status, %stderr, "transcription command failed");
                return Err(AppError::Transcription(format!(
                    "{} exited with {}",
                    self.command, output.status
                )));
            }
            let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            if text.is_empty() {
                return Err(AppError::Transcription("empty transcript".into()));
            }
            Ok(text)
        })
    }
}

/// Transcriber used when none is configured; always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranscriber;

impl Transcriber for NoTranscriber {
    fn transcribe(&self, _path: PathBuf) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async {
            Err(AppError::Transcription(
                "voice notes need transcription.command in the config".into(),
            ))
        })
    }
}

/// Build the transcriber selected by configuration.
#[must_use]
pub fn from_config(config: &TranscriptionConfig) -> Arc<dyn Transcriber> {
    match &config.command {
        Some(command) if !command.trim().is_empty() => {
            Arc::new(CommandTranscriber::new(command.clone(), config.args.clone()))
        }
        _ => Arc::new(NoTranscriber),
    }
}
