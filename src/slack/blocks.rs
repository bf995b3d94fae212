//! Slack Block Kit message builders.
//!
//! Renders an [`OutboundMessage`] as markdown sections followed by one
//! actions block per button row.

use slack_morphism::prelude::{
    SlackActionBlockElement, SlackActionsBlock, SlackBlock, SlackBlockButtonElement, SlackBlockId,
    SlackBlockPlainTextOnly, SlackBlockText, SlackSectionBlock,
};

use crate::chat::OutboundMessage;
use crate::models::control::Control;

/// Slack rejects section text longer than this.
pub const SECTION_TEXT_LIMIT: usize = 3000;

/// Build a markdown section block.
#[must_use]
pub fn text_section(text: &str) -> SlackBlock {
    SlackBlock::Section(
        SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(text.to_owned().into())),
    )
}

/// Build an actions block with the given buttons.
#[must_use]
pub fn action_buttons(block_id: &str, buttons: &[Control]) -> SlackBlock {
    let elements: Vec<SlackActionBlockElement> = buttons
        .iter()
        .map(|control| {
            let action_id = control.action.action_id();
            SlackActionBlockElement::Button(
                SlackBlockButtonElement::new(
                    action_id.clone().into(),
                    SlackBlockPlainTextOnly::from(control.label.as_str()),
                )
                .with_value(action_id),
            )
        })
        .collect();
    SlackBlock::Actions(
        SlackActionsBlock::new(elements).with_block_id(SlackBlockId(block_id.into())),
    )
}

/// Full block list for a message: text sections, then button rows.
#[must_use]
pub fn message_blocks(message: &OutboundMessage) -> Vec<SlackBlock> {
    let mut blocks: Vec<SlackBlock> = split_text(&message.text, SECTION_TEXT_LIMIT)
        .iter()
        .map(|chunk| text_section(chunk))
        .collect();
    blocks.extend(
        message
            .controls
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.is_empty())
            .map(|(index, row)| action_buttons(&format!("controls_{index}"), row)),
    );
    blocks
}

/// Split `text` into chunks of at most `limit` characters, preferring line
/// breaks. Empty text yields one empty chunk.
#[must_use]
pub fn split_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        // A single line longer than the limit is cut on char boundaries.
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(limit) {
            if piece.len() == limit {
                chunks.push(piece.iter().collect());
            } else {
                current = piece.iter().collect();
                current_len = piece.len();
            }
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}
