//! Ephemeral status messages posted around an invocation.

use crate::chat::MessageId;

/// Status messages and the progress indicator of the current invocation.
#[derive(Debug, Default)]
pub struct IntermediateMessages {
    status: Vec<MessageId>,
    progress: Option<MessageId>,
}

impl IntermediateMessages {
    /// Track a status message.
    pub fn push_status(&mut self, id: MessageId) {
        self.status.push(id);
    }

    /// Replace the progress indicator, returning the previous one.
    pub fn set_progress(&mut self, id: MessageId) -> Option<MessageId> {
        self.progress.replace(id)
    }

    /// Forget the progress indicator, returning it for deletion.
    pub fn take_progress(&mut self) -> Option<MessageId> {
        self.progress.take()
    }

    /// Messages to delete before a new invocation; the set is left empty.
    ///
    /// With several status messages the newest is kept on screen.
    pub fn take_for_cleanup(&mut self) -> Vec<MessageId> {
        let mut status = std::mem::take(&mut self.status);
        if status.len() > 1 {
            status.pop();
        }
        status.extend(self.progress.take());
        status
    }
}
