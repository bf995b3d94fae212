//! Inbound chat events as seen by the orchestrator.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Shape of an inbound event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Plain text message.
    Text,
    /// Standalone message carrying an attachment.
    Attachment,
    /// One part of a multi-attachment album.
    AlbumPart,
}

/// Category of an attached file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Still image.
    Photo,
    /// Generic file.
    Document,
    /// Video clip.
    Video,
    /// Audio track.
    Audio,
    /// Recorded voice note.
    Voice,
    /// Round video message.
    VideoNote,
}

impl AttachmentKind {
    /// Guess the kind from a MIME type.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Photo
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime == "audio/webm" || mime == "audio/ogg" || mime.contains("opus") {
            Self::Voice
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

impl Display for AttachmentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice note",
            Self::VideoNote => "video note",
        };
        f.write_str(label)
    }
}

/// A file that has already been downloaded to local disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// What kind of file this is.
    pub kind: AttachmentKind,
    /// Display name.
    pub name: String,
    /// Local path of the downloaded file.
    pub path: PathBuf,
    /// Size in bytes, when known.
    pub size: Option<u64>,
}

/// A single inbound chat event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatEvent {
    /// Conversation the event arrived in.
    pub chat_id: String,
    /// Event shape.
    pub kind: EventKind,
    /// Message text or caption.
    pub text: Option<String>,
    /// Files carried by the event.
    pub attachments: Vec<Attachment>,
    /// Album key shared by parts that arrived together.
    pub group_key: Option<String>,
}

impl ChatEvent {
    /// Build a plain text event.
    #[must_use]
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            kind: EventKind::Text,
            text: Some(text.into()),
            attachments: Vec::new(),
            group_key: None,
        }
    }

    /// Build an event carrying a single attachment with an optional caption.
    #[must_use]
    pub fn attachment(
        chat_id: impl Into<String>,
        attachment: Attachment,
        caption: Option<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            kind: EventKind::Attachment,
            text: caption,
            attachments: vec![attachment],
            group_key: None,
        }
    }

    /// Build one part of an album.
    #[must_use]
    pub fn album_part(
        chat_id: impl Into<String>,
        group_key: impl Into<String>,
        attachment: Attachment,
        caption: Option<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            kind: EventKind::AlbumPart,
            text: caption,
            attachments: vec![attachment],
            group_key: Some(group_key.into()),
        }
    }

    /// Trimmed text, if any remains after trimming.
    #[must_use]
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    /// Whether the event carries anything worth submitting.
    #[must_use]
    pub fn is_qualifying(&self) -> bool {
        self.trimmed_text().is_some() || !self.attachments.is_empty()
    }

    /// Short single-line preview for control messages and logs.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        let base = match (self.trimmed_text(), self.attachments.first()) {
            (Some(text), _) => text.replace('\n', " "),
            (None, Some(attachment)) => format!("[{}] {}", attachment.kind, attachment.name),
            (None, None) => String::new(),
        };
        if base.chars().count() <= max_chars {
            base
        } else {
            let cut: String = base.chars().take(max_chars).collect();
            format!("{cut}\u{2026}")
        }
    }
}
