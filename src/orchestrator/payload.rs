//! Payload text handed to the agent on stdin.

use std::fmt::Write as _;

use crate::models::batch::{Batch, ITEM_SEPARATOR};
use crate::models::event::{Attachment, AttachmentKind};
use crate::transcription::Transcriber;
use crate::Result;

/// First line of every resume payload.
pub const RESUME_REMINDER: &str = "[Reminder: you are running as the chat relay agent]";

/// Instruction used when the operator sent only attachments.
pub const DEFAULT_PROMPT: &str = "Review the attached files.";

const MESSAGE_HEADER: &str = "[New message from the operator]";

/// Operator text and file list of a batch, ready for [`build`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedBatch {
    /// Item texts joined by [`ITEM_SEPARATOR`], voice transcripts included.
    pub text: String,
    /// Non-voice attachments in arrival order.
    pub attachments: Vec<Attachment>,
}

/// Flatten a batch, transcribing voice notes into the item text.
///
/// # Errors
///
/// Returns the transcriber's error for the first voice note that cannot be
/// transcribed; nothing is submitted in that case.
pub async fn render_batch(batch: &Batch, transcriber: &dyn Transcriber) -> Result<RenderedBatch> {
    let mut texts = Vec::with_capacity(batch.len());
    let mut attachments = Vec::new();
    for item in &batch.items {
        let mut text = item.trimmed_text().unwrap_or_default().to_owned();
        for attachment in &item.attachments {
            if attachment.kind == AttachmentKind::Voice {
                let transcript = transcriber.transcribe(attachment.path.clone()).await?;
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                let _ = write!(text, "\u{1f3a4} Voice note: {transcript}");
            } else {
                attachments.push(attachment.clone());
            }
        }
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(RenderedBatch {
        text: texts.join(ITEM_SEPARATOR),
        attachments,
    })
}

/// A rendered batch plus the context it is sent with.
///
/// Kept unbuilt so a failed resume can be retried with the new-session
/// layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    context: String,
    batch: RenderedBatch,
}

impl Payload {
    /// Pair a rendered batch with the context preamble.
    #[must_use]
    pub fn new(context: impl Into<String>, batch: RenderedBatch) -> Self {
        Self {
            context: context.into(),
            batch,
        }
    }

    /// Payload text for a resumed (`resume = true`) or new session.
    #[must_use]
    pub fn render(&self, resume: bool) -> String {
        build(&self.context, &self.batch.text, &self.batch.attachments, resume)
    }
}

/// Build the full payload.
///
/// Layout: optional resume reminder, the context preamble, a separator,
/// the message header, the files section and the operator text.
#[must_use]
pub fn build(context: &str, text: &str, attachments: &[Attachment], resume: bool) -> String {
    let mut payload = String::new();
    if resume {
        payload.push_str(RESUME_REMINDER);
        payload.push('\n');
    }
    payload.push_str(context);
    payload.push_str("\n\n---\n");
    payload.push_str(MESSAGE_HEADER);
    payload.push('\n');
    payload.push_str(&files_section(attachments));
    payload.push('\n');
    let text = text.trim();
    payload.push_str(if text.is_empty() { DEFAULT_PROMPT } else { text });
    payload.push('\n');
    payload
}

/// Listing of attached files with type, name, path and size.
///
/// Empty when there are no attachments.
#[must_use]
pub fn files_section(attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n\u{1f4ce} **Attached files:**\n\n");
    for attachment in attachments {
        let _ = writeln!(section, "{}: {}", kind_label(attachment.kind), attachment.name);
        let _ = writeln!(section, "Path: {}", attachment.path.display());
        if let Some(size) = attachment.size.filter(|&size| size > 0) {
            let _ = writeln!(section, "Size: {}", human_size(size));
        }
        section.push('\n');
    }
    if attachments
        .iter()
        .any(|attachment| attachment.kind == AttachmentKind::Photo)
    {
        section.push_str("\u{1f4a1} Open the image paths with your file reading tool to view them.\n\n");
    }
    section
}

fn kind_label(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Photo => "\u{1f4f8} Photo",
        AttachmentKind::Document => "\u{1f4c4} Document",
        AttachmentKind::Video => "\u{1f3a5} Video",
        AttachmentKind::Audio => "\u{1f3b5} Audio",
        AttachmentKind::Voice => "\u{1f3a4} Voice note",
        AttachmentKind::VideoNote => "\u{2b55} Video note",
    }
}

/// Render a byte count as KB below one megabyte, MB above.
#[must_use]
#[allow(clippy::cast_precision_loss)] // Display only.
pub fn human_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let bytes = bytes as f64;
    if bytes >= MB {
        format!("{:.2} MB", bytes / MB)
    } else {
        format!("{:.2} KB", bytes / KB)
    }
}
