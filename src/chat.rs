//! Chat platform boundary.
//!
//! The orchestrator talks to the operator only through [`ChatPlatform`].
//! Every call addresses the single operator conversation the platform was
//! configured for. The Slack adapter implements it for production; tests
//! substitute a recording implementation.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::models::control::Control;
use crate::Result;

/// Platform-assigned id of a posted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text plus optional button rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message body (markdown).
    pub text: String,
    /// Button rows, top to bottom.
    pub controls: Vec<Vec<Control>>,
}

impl OutboundMessage {
    /// Text-only message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            controls: Vec::new(),
        }
    }

    /// Attach button rows.
    #[must_use]
    pub fn with_controls(mut self, controls: Vec<Vec<Control>>) -> Self {
        self.controls = controls;
        self
    }
}

/// Boxed future returned by [`ChatPlatform`] methods.
pub type ChatFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outbound operations against the operator conversation.
pub trait ChatPlatform: Send + Sync {
    /// Post a message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chat` if the platform rejects the message.
    fn send_message(&self, message: OutboundMessage) -> ChatFuture<'_, MessageId>;

    /// Replace the text and buttons of a posted message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chat` if the platform call fails.
    fn edit_message(&self, id: MessageId, message: OutboundMessage) -> ChatFuture<'_, ()>;

    /// Delete a posted message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chat` if the platform call fails.
    fn delete_message(&self, id: MessageId) -> ChatFuture<'_, ()>;

    /// Upload a local file with an optional caption.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read or `AppError::Chat`
    /// if the upload fails.
    fn upload_file(&self, path: PathBuf, caption: Option<String>) -> ChatFuture<'_, ()>;
}
