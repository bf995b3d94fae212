//! Slack slash command router.
//!
//! `/multi`, `/stop`, `/end`, `/fast`, `/balanced`, `/deep`, `/status` and
//! `/help` map onto orchestrator controls. The ephemeral reply only
//! acknowledges the command; results are posted to the channel.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector, SlackCommandEvent,
    SlackCommandEventResponse, SlackMessageContent, SlackMessageResponseType,
};
use tracing::{info, warn};

use crate::models::control::ControlAction;
use crate::slack::events::SlackBridge;

fn ephemeral(text: &str) -> SlackCommandEventResponse {
    SlackCommandEventResponse::new(SlackMessageContent::new().with_text(text.to_owned()))
        .with_response_type(SlackMessageResponseType::Ephemeral)
}

/// Handle incoming slash commands routed via Socket Mode.
///
/// # Errors
///
/// Returns an error if the command response cannot be constructed.
pub async fn handle_command(
    event: SlackCommandEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::AnyStdResult<SlackCommandEventResponse> {
    let command = event.command.0.clone();
    let user_id = event.user_id.to_string();
    info!(command, user_id, "received slash command");

    let bridge = {
        let guard = state.read().await;
        guard.get_user_state::<SlackBridge>().cloned()
    };
    let Some(bridge) = bridge else {
        warn!("bridge state not available; cannot process command");
        return Ok(ephemeral("The relay is starting up, try again shortly."));
    };
    if !bridge.is_authorized(&user_id) {
        return Ok(ephemeral("You are not authorized to use this relay."));
    }

    let Some(action) = ControlAction::from_command(&command) else {
        return Ok(ephemeral(&format!("Unknown command `{command}`. Try `/help`.")));
    };
    match bridge
        .orchestrator
        .control(event.channel_id.to_string(), action)
        .await
    {
        Ok(()) => Ok(ephemeral("acknowledged")),
        Err(err) => {
            warn!(%err, command, "failed to forward command");
            Ok(ephemeral("The relay is shutting down."))
        }
    }
}
