use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use agent_relay::models::batch::{Batch, BatchMode};
use agent_relay::models::event::{Attachment, AttachmentKind, ChatEvent};
use agent_relay::orchestrator::payload::{
    build, files_section, human_size, render_batch, Payload, RenderedBatch, DEFAULT_PROMPT,
    RESUME_REMINDER,
};
use agent_relay::transcription::{NoTranscriber, Transcriber};
use agent_relay::{AppError, Result};

struct EchoTranscriber;

impl Transcriber for EchoTranscriber {
    fn transcribe(
        &self,
        path: PathBuf,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            Ok(format!(
                "transcript of {}",
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ))
        })
    }
}

fn file(kind: AttachmentKind, name: &str, size: Option<u64>) -> Attachment {
    Attachment {
        kind,
        name: name.into(),
        path: PathBuf::from("/work/downloads").join(name),
        size,
    }
}

#[test]
fn fresh_payload_has_context_header_and_text() {
    let payload = build("CONTEXT", "  fix the build  ", &[], false);
    assert_eq!(
        payload,
        "CONTEXT\n\n---\n[New message from the operator]\n\nfix the build\n"
    );
}

#[test]
fn resume_payload_starts_with_reminder() {
    let payload = build("CONTEXT", "continue", &[], true);
    assert!(payload.starts_with(RESUME_REMINDER));
    assert!(payload.contains("\nCONTEXT\n"));
}

#[test]
fn attachment_only_payload_uses_default_prompt() {
    let attachments = [file(AttachmentKind::Document, "report.pdf", None)];
    let payload = build("CTX", "", &attachments, false);
    assert!(payload.contains("Path: /work/downloads/report.pdf"));
    assert!(payload.trim_end().ends_with(DEFAULT_PROMPT));
}

#[test]
fn files_section_lists_each_file() {
    let attachments = [
        file(AttachmentKind::Photo, "shot.png", Some(2048)),
        file(AttachmentKind::Document, "notes.txt", Some(0)),
    ];
    let section = files_section(&attachments);
    assert!(section.contains("\u{1f4f8} Photo: shot.png"));
    assert!(section.contains("Path: /work/downloads/shot.png"));
    assert!(section.contains("Size: 2.00 KB"));
    assert!(section.contains("\u{1f4c4} Document: notes.txt"));
    assert_eq!(section.matches("Size:").count(), 1, "zero sizes are omitted");
    assert!(section.contains("image paths"), "photos get a viewing hint");
}

#[test]
fn files_section_is_empty_without_attachments() {
    assert!(files_section(&[]).is_empty());
}

#[test]
fn human_size_switches_units() {
    assert_eq!(human_size(512), "0.50 KB");
    assert_eq!(human_size(2048), "2.00 KB");
    assert_eq!(human_size(1024 * 1024 * 3 / 2), "1.50 MB");
}

#[tokio::test]
async fn render_batch_joins_items_and_transcribes_voice() {
    let mut batch = Batch::new(BatchMode::Auto, "C1");
    batch.push(ChatEvent::text("C1", "first"));
    batch.push(ChatEvent::attachment(
        "C1",
        file(AttachmentKind::Voice, "memo.ogg", Some(100)),
        None,
    ));
    batch.push(ChatEvent::attachment(
        "C1",
        file(AttachmentKind::Photo, "shot.png", Some(100)),
        Some("see this".into()),
    ));

    let rendered = render_batch(&batch, &EchoTranscriber)
        .await
        .expect("batch renders");
    assert_eq!(
        rendered.text,
        "first\n\n---\n\n\u{1f3a4} Voice note: transcript of memo.ogg\n\n---\n\nsee this"
    );
    assert_eq!(rendered.attachments.len(), 1);
    assert_eq!(rendered.attachments[0].name, "shot.png");
}

#[tokio::test]
async fn render_batch_fails_when_voice_cannot_be_transcribed() {
    let batch = Batch::single(ChatEvent::attachment(
        "C1",
        file(AttachmentKind::Voice, "memo.ogg", None),
        None,
    ));
    let result = render_batch(&batch, &NoTranscriber).await;
    assert!(matches!(result, Err(AppError::Transcription(_))));
}

#[tokio::test]
async fn render_batch_skips_blank_items() {
    let mut batch = Batch::new(BatchMode::Multi, "C1");
    batch.push(ChatEvent::text("C1", "   "));
    batch.push(ChatEvent::text("C1", "real"));
    let rendered = render_batch(&batch, &NoTranscriber)
        .await
        .expect("batch renders");
    assert_eq!(rendered.text, "real");
    assert!(rendered.attachments.is_empty());
}

#[test]
fn payload_renders_for_either_session_mode() {
    let payload = Payload::new(
        "Context line.",
        RenderedBatch {
            text: "do the thing".into(),
            attachments: vec![file(AttachmentKind::Document, "notes.txt", None)],
        },
    );
    let resumed = payload.render(true);
    let fresh = payload.render(false);
    assert!(resumed.starts_with(RESUME_REMINDER));
    assert!(fresh.starts_with("Context line."));
    assert_eq!(resumed, format!("{RESUME_REMINDER}\n{fresh}"));
}
