//! Slack push-event and interaction handlers.
//!
//! Operator messages in the configured channel become [`ChatEvent`]s;
//! button presses become [`ControlAction`]s. Both are forwarded to the
//! orchestrator through its handle.
//!
//! ## Authorization
//!
//! Every message and block action is checked against
//! `authorized_user_ids`. Unauthorized attempts are silently ignored from
//! the Slack user's perspective but logged as security events. Messages
//! posted by bots (including this relay) never reach the orchestrator.
//!
//! ## Double-submission prevention
//!
//! On the first button press the buttons of the pressed message are
//! replaced with a "Processing…" marker *before* the control is
//! forwarded, so a second tap on the same message is a no-op.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector,
    SlackEventCallbackBody, SlackFile, SlackHistoryMessage, SlackInteractionEvent,
    SlackMessageEvent, SlackMessageEventType, SlackPushEventCallback,
};
use tracing::{debug, info, warn};

use crate::chat::{ChatPlatform, MessageId, OutboundMessage};
use crate::config::GlobalConfig;
use crate::models::control::ControlAction;
use crate::models::event::{Attachment, AttachmentKind, ChatEvent};
use crate::orchestrator::OrchestratorHandle;
use crate::slack::client::SlackService;

/// State shared with Socket Mode callbacks via the listener user state.
#[derive(Clone)]
pub struct SlackBridge {
    /// Orchestrator input.
    pub orchestrator: OrchestratorHandle,
    /// Web API client, for downloads and the button guard.
    pub service: Arc<SlackService>,
    /// Relay configuration; holds the authorized users.
    pub config: Arc<GlobalConfig>,
    /// The operator channel.
    pub channel_id: String,
    /// Where attachments are downloaded to.
    pub download_dir: PathBuf,
}

impl SlackBridge {
    /// Whether `user_id` may drive the agent. Logs a security event when not.
    #[must_use]
    pub fn is_authorized(&self, user_id: &str) -> bool {
        match self.config.ensure_authorized(user_id) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    user_id,
                    %err,
                    "unauthorized user attempted slack interaction (silently ignored)"
                );
                false
            }
        }
    }
}

async fn bridge_from(state: &SlackClientEventsUserState) -> Option<SlackBridge> {
    let guard = state.read().await;
    guard.get_user_state::<SlackBridge>().cloned()
}

// ── Messages ─────────────────────────────────────────────────

/// Handle push events delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged so Slack does not redeliver.
pub async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let Some(bridge) = bridge_from(&state).await else {
        warn!("bridge state not available; cannot process push event");
        return Ok(());
    };

    match event.event {
        SlackEventCallbackBody::Message(message) => handle_message(&bridge, &message).await,
        other => debug!(?other, "push event ignored"),
    }
    Ok(())
}

async fn handle_message(bridge: &SlackBridge, message: &SlackMessageEvent) {
    match &message.subtype {
        None | Some(SlackMessageEventType::FileShare) => {}
        Some(subtype) => {
            debug!(?subtype, "message subtype ignored");
            return;
        }
    }
    if message.sender.bot_id.is_some() {
        return;
    }
    let Some(user_id) = message.sender.user.as_ref().map(ToString::to_string) else {
        return;
    };
    let channel_id = message
        .origin
        .channel
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    if channel_id != bridge.channel_id {
        debug!(channel_id, "message outside the operator channel ignored");
        return;
    }
    if !bridge.is_authorized(&user_id) {
        return;
    }

    let ts = message.origin.ts.to_string();
    let text = message
        .content
        .as_ref()
        .and_then(|content| content.text.as_deref())
        .map(unescape);
    let files = message
        .content
        .as_ref()
        .and_then(|content| content.files.clone())
        .unwrap_or_default();

    let mut attachments = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        match download_file(bridge, &ts, index, file).await {
            Ok(attachment) => attachments.push(attachment),
            Err(err) => warn!(%err, ts, index, "attachment download failed"),
        }
    }
    if !files.is_empty() && attachments.is_empty() && text.is_none() {
        let notice = OutboundMessage::text("\u{274c} Could not download the attached file(s).");
        if let Err(err) = bridge.service.send_message(notice).await {
            warn!(%err, "failed to post download notice");
        }
        return;
    }

    for event in chat_events(&channel_id, &ts, text, attachments) {
        info!(chat_id = channel_id, kind = ?event.kind, "operator message received");
        if let Err(err) = bridge.orchestrator.chat_event(event).await {
            warn!(%err, "failed to forward chat event");
            return;
        }
    }
}

async fn download_file(
    bridge: &SlackBridge,
    ts: &str,
    index: usize,
    file: &SlackFile,
) -> crate::Result<Attachment> {
    let name = file
        .name
        .clone()
        .or_else(|| file.title.clone())
        .unwrap_or_else(|| file.id.to_string());
    let url = file
        .url_private_download
        .as_ref()
        .or(file.url_private.as_ref())
        .ok_or_else(|| crate::AppError::NotFound(format!("no download url for {name}")))?;
    let kind = file
        .mimetype
        .as_ref()
        .map_or(AttachmentKind::Document, |mime| {
            AttachmentKind::from_mime(&mime.0)
        });
    let path = download_path(&bridge.download_dir, ts, index, &name);
    let size = bridge.service.download(url.as_str(), &path).await?;
    debug!(name, %kind, size, path = %path.display(), "attachment downloaded");
    Ok(Attachment {
        kind,
        name,
        path,
        size: Some(size),
    })
}

/// Turn one Slack message into chat events.
///
/// A message carrying several files becomes album parts keyed by its `ts`,
/// with the text attached to the first part.
#[must_use]
pub fn chat_events(
    chat_id: &str,
    ts: &str,
    text: Option<String>,
    attachments: Vec<Attachment>,
) -> Vec<ChatEvent> {
    let text = text.filter(|text| !text.trim().is_empty());
    match attachments.len() {
        0 => text
            .map(|text| vec![ChatEvent::text(chat_id, text)])
            .unwrap_or_default(),
        1 => attachments
            .into_iter()
            .map(|attachment| ChatEvent::attachment(chat_id, attachment, text.clone()))
            .collect(),
        _ => {
            let mut caption = text;
            attachments
                .into_iter()
                .map(|attachment| ChatEvent::album_part(chat_id, ts, attachment, caption.take()))
                .collect()
        }
    }
}

/// Local path for a downloaded file: `<dir>/<ts>_<index>_<name>` with the
/// name reduced to a safe character set.
#[must_use]
pub fn download_path(dir: &Path, ts: &str, index: usize, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_start_matches('.');
    let safe = if safe.is_empty() { "file" } else { safe };
    dir.join(format!("{}_{index}_{safe}", ts.replace('.', "_")))
}

/// Undo Slack's HTML entity escaping of message text.
#[must_use]
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// ── Interactions ─────────────────────────────────────────────

/// Replace the buttons of a pressed message with a processing marker,
/// keeping its text.
async fn replace_buttons_with_processing(
    message: Option<&SlackHistoryMessage>,
    bridge: &SlackBridge,
) {
    let Some(message) = message else { return };
    let text = message.content.text.clone().unwrap_or_default();
    let marked = OutboundMessage::text(format!("{text}\n\n_\u{23f3} Processing\u{2026}_"));
    let id = MessageId(message.origin.ts.to_string());
    if let Err(err) = bridge.service.edit_message(id, marked).await {
        warn!(%err, "failed to apply double-submission guard");
    }
}

/// Handle interactive payloads (button presses) delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged.
pub async fn handle_interaction(
    event: SlackInteractionEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let SlackInteractionEvent::BlockActions(block_event) = &event else {
        info!(?event, "unhandled interaction event type");
        return Ok(());
    };

    let user_id = block_event
        .user
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_default();
    if user_id.is_empty() {
        warn!("block action with empty user ID; ignoring");
        return Ok(());
    }

    let Some(bridge) = bridge_from(&state).await else {
        warn!("bridge state not available; cannot process interaction");
        return Ok(());
    };
    if !bridge.is_authorized(&user_id) {
        return Ok(());
    }

    let Some(actions) = &block_event.actions else {
        return Ok(());
    };
    let chat_id = block_event
        .channel
        .as_ref()
        .map_or_else(|| bridge.channel_id.clone(), |channel| channel.id.to_string());

    replace_buttons_with_processing(block_event.message.as_ref(), &bridge).await;

    for action in actions {
        let action_id = action.action_id.to_string();
        let Some(control) = ControlAction::from_action_id(&action_id) else {
            warn!(action_id, "unknown action_id");
            continue;
        };
        info!(action_id, user_id, "dispatching block action");
        if let Err(err) = bridge.orchestrator.control(chat_id.clone(), control).await {
            warn!(%err, action_id, "failed to forward control");
        }
    }
    Ok(())
}
