//! Operator controls (buttons and slash commands) and their wire ids.

use super::tier::CapabilityTier;

/// Action triggered by a button press or slash command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Pause the Auto countdown and wait for one more message.
    AddMore,
    /// Discard the pending Auto batch.
    CancelAuto,
    /// Flip multi mode on or off.
    ToggleMulti,
    /// Submit the accumulated multi batch now.
    StartMulti,
    /// Discard the accumulated multi batch.
    CancelMulti,
    /// Interrupt the running invocation but keep the session.
    Stop,
    /// Interrupt and forget the session.
    EndSession,
    /// Acknowledge an inactivity prompt.
    ContinueSession,
    /// Pick option `n` of the pending question.
    Answer(usize),
    /// Switch the capability tier.
    SetTier(CapabilityTier),
    /// Report relay state.
    Status,
    /// Show usage.
    Help,
}

impl ControlAction {
    /// Stable id used as the Slack `action_id`.
    #[must_use]
    pub fn action_id(&self) -> String {
        match self {
            Self::AddMore => "auto_add_more".into(),
            Self::CancelAuto => "auto_cancel".into(),
            Self::ToggleMulti => "multi_toggle".into(),
            Self::StartMulti => "multi_start".into(),
            Self::CancelMulti => "multi_cancel".into(),
            Self::Stop => "run_stop".into(),
            Self::EndSession => "session_end".into(),
            Self::ContinueSession => "session_continue".into(),
            Self::Answer(index) => format!("answer_{index}"),
            Self::SetTier(tier) => format!("tier_{tier}"),
            Self::Status => "status".into(),
            Self::Help => "help".into(),
        }
    }

    /// Parse an id produced by [`ControlAction::action_id`].
    #[must_use]
    pub fn from_action_id(id: &str) -> Option<Self> {
        if let Some(index) = id.strip_prefix("answer_") {
            return index.parse().ok().map(Self::Answer);
        }
        if let Some(tier) = id.strip_prefix("tier_") {
            return tier.parse().ok().map(Self::SetTier);
        }
        match id {
            "auto_add_more" => Some(Self::AddMore),
            "auto_cancel" => Some(Self::CancelAuto),
            "multi_toggle" => Some(Self::ToggleMulti),
            "multi_start" => Some(Self::StartMulti),
            "multi_cancel" => Some(Self::CancelMulti),
            "run_stop" => Some(Self::Stop),
            "session_end" => Some(Self::EndSession),
            "session_continue" => Some(Self::ContinueSession),
            "status" => Some(Self::Status),
            "help" => Some(Self::Help),
            _ => None,
        }
    }

    /// Map a slash command (with or without the leading `/`).
    #[must_use]
    pub fn from_command(command: &str) -> Option<Self> {
        match command.trim().trim_start_matches('/') {
            "multi" => Some(Self::ToggleMulti),
            "stop" => Some(Self::Stop),
            "end" => Some(Self::EndSession),
            "fast" => Some(Self::SetTier(CapabilityTier::Fast)),
            "balanced" => Some(Self::SetTier(CapabilityTier::Balanced)),
            "deep" => Some(Self::SetTier(CapabilityTier::Deep)),
            "status" => Some(Self::Status),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

/// A labelled button bound to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    /// Button label.
    pub label: String,
    /// Action fired on press.
    pub action: ControlAction,
}

impl Control {
    /// Build a control.
    #[must_use]
    pub fn new(label: impl Into<String>, action: ControlAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}
