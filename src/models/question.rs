//! Question the agent asked the operator mid-run.

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Maximum number of options rendered as buttons.
pub const MAX_OPTIONS: usize = 8;

/// An open question awaiting the operator's next message or button press.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingQuestion {
    /// Question text.
    pub prompt: String,
    /// Suggested answers, at most [`MAX_OPTIONS`].
    pub options: Vec<String>,
}

impl PendingQuestion {
    /// Validate and build a question.
    ///
    /// Empty options are dropped; extra options beyond [`MAX_OPTIONS`] are
    /// cut off.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the prompt is blank or no option
    /// survives.
    pub fn new(prompt: impl Into<String>, options: Vec<String>) -> Result<Self> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(AppError::Validation("question must not be empty".into()));
        }
        let options: Vec<String> = options
            .into_iter()
            .map(|option| option.trim().to_owned())
            .filter(|option| !option.is_empty())
            .take(MAX_OPTIONS)
            .collect();
        if options.is_empty() {
            return Err(AppError::Validation(
                "question needs at least one option".into(),
            ));
        }
        Ok(Self { prompt, options })
    }

    /// Option text at `index`.
    #[must_use]
    pub fn option(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }
}
