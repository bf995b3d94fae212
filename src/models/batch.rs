//! Ordered group of chat events submitted as one invocation.

use super::event::{Attachment, ChatEvent};

/// Separator placed between the texts of consecutive batch items.
pub const ITEM_SEPARATOR: &str = "\n\n---\n\n";

/// Accumulation policy a batch was collected under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchMode {
    /// Debounced accumulation, the default.
    Auto,
    /// Explicit accumulation until the operator starts it.
    Multi,
    /// Album parts sharing a group key.
    MediaGroup(String),
}

impl BatchMode {
    /// Select the policy for an incoming event.
    ///
    /// A group key always wins, then multi mode, then the default.
    #[must_use]
    pub fn select(event: &ChatEvent, multi_active: bool) -> Self {
        match (&event.group_key, multi_active) {
            (Some(key), _) => Self::MediaGroup(key.clone()),
            (None, true) => Self::Multi,
            (None, false) => Self::Auto,
        }
    }
}

/// Events queued for one submission, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Policy the batch was collected under.
    pub mode: BatchMode,
    /// Conversation the batch belongs to.
    pub chat_id: String,
    /// Collected events.
    pub items: Vec<ChatEvent>,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new(mode: BatchMode, chat_id: impl Into<String>) -> Self {
        Self {
            mode,
            chat_id: chat_id.into(),
            items: Vec::new(),
        }
    }

    /// Wrap a single event (used for question answers).
    #[must_use]
    pub fn single(event: ChatEvent) -> Self {
        Self {
            mode: BatchMode::Auto,
            chat_id: event.chat_id.clone(),
            items: vec![event],
        }
    }

    /// Append an event.
    pub fn push(&mut self, event: ChatEvent) {
        self.items.push(event);
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All attachments across items, in order.
    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.items.iter().flat_map(|item| item.attachments.iter())
    }
}
