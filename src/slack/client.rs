//! Slack Web API client and Socket Mode listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use slack_morphism::prelude::{
    SlackApiChatDeleteRequest, SlackApiChatPostMessageRequest, SlackApiChatUpdateRequest,
    SlackApiFilesComplete, SlackApiFilesCompleteUploadExternalRequest,
    SlackApiFilesGetUploadUrlExternalRequest, SlackApiToken, SlackApiTokenType,
    SlackApiTokenValue, SlackChannelId, SlackClient, SlackClientEventsListenerEnvironment,
    SlackClientHyperHttpsConnector, SlackClientSession, SlackClientSocketModeConfig,
    SlackClientSocketModeListener, SlackMessageContent, SlackSocketModeListenerCallbacks, SlackTs,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::chat::{ChatFuture, ChatPlatform, MessageId, OutboundMessage};
use crate::slack::events::SlackBridge;
use crate::slack::{blocks, commands, events};
use crate::{config::SlackConfig, AppError, Result};

const MAX_POST_ATTEMPTS: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Slack Web API wrapper bound to the operator channel.
pub struct SlackService {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
    channel: SlackChannelId,
    http: reqwest::Client,
}

impl SlackService {
    /// Build the client for the configured channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chat` if the HTTPS connector cannot be created.
    pub fn new(config: &SlackConfig) -> Result<Arc<Self>> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Chat(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.bot_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let app_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.app_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::App),
        };

        Ok(Arc::new(Self {
            client,
            bot_token,
            app_token,
            channel: SlackChannelId(config.channel_id.clone()),
            http: reqwest::Client::new(),
        }))
    }

    /// Connect Socket Mode and route events into `bridge`.
    pub fn start_socket_mode(&self, bridge: SlackBridge) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(&self.client))
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::OK
                })
                .with_user_state(bridge),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "socket hello");
            })
            .with_command_events(commands::handle_command)
            .with_interaction_events(events::handle_interaction)
            .with_push_events(events::handle_push_event);

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_env,
            callbacks,
        );
        let app_token = self.app_token.clone();
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "socket mode listen failed");
                return;
            }
            info!("socket mode connected");
            listener.serve().await;
            info!("socket mode listener exited");
        })
    }

    fn http_session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.bot_token)
    }

    fn content(message: &OutboundMessage) -> SlackMessageContent {
        SlackMessageContent::new()
            .with_text(message.text.clone())
            .with_blocks(blocks::message_blocks(message))
    }

    /// Post a message, retrying on rate limits and transient failures.
    async fn post(&self, message: &OutboundMessage) -> Result<SlackTs> {
        let request =
            SlackApiChatPostMessageRequest::new(self.channel.clone(), Self::content(message));
        let session = self.http_session();
        let mut backoff = INITIAL_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match session.chat_post_message(&request).await {
                Ok(response) => {
                    debug!(ts = %response.ts, "sent slack message");
                    return Ok(response.ts);
                }
                Err(error) if attempt < MAX_POST_ATTEMPTS => {
                    let delay = match &error {
                        slack_morphism::errors::SlackClientError::RateLimitError(rate) => {
                            rate.retry_after.unwrap_or(backoff)
                        }
                        _ => backoff,
                    };
                    warn!(?error, attempt, delay = ?delay, "slack post failed; retrying");
                    sleep(delay).await;
                    backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                    attempt += 1;
                }
                Err(error) => {
                    return Err(AppError::Chat(format!("failed to post message: {error}")));
                }
            }
        }
    }

    async fn update(&self, ts: SlackTs, message: &OutboundMessage) -> Result<()> {
        let request =
            SlackApiChatUpdateRequest::new(self.channel.clone(), Self::content(message), ts);
        self.http_session()
            .chat_update(&request)
            .await
            .map_err(|err| AppError::Chat(format!("failed to update message: {err}")))?;
        Ok(())
    }

    async fn delete(&self, ts: SlackTs) -> Result<()> {
        let request = SlackApiChatDeleteRequest::new(self.channel.clone(), ts);
        self.http_session()
            .chat_delete(&request)
            .await
            .map_err(|err| AppError::Chat(format!("failed to delete message: {err}")))?;
        Ok(())
    }

    /// Upload a local file to the channel using the external upload flow.
    async fn upload(&self, path: &Path, caption: Option<String>) -> Result<()> {
        let content = tokio::fs::read(path).await.map_err(|err| {
            AppError::Io(format!("failed to read {}: {err}", path.display()))
        })?;
        let filename = path
            .file_name()
            .map_or_else(|| "file".to_owned(), |name| name.to_string_lossy().into_owned());
        let session = self.http_session();

        // Step 1: Get upload URL.
        let url_request =
            SlackApiFilesGetUploadUrlExternalRequest::new(filename.clone(), content.len());
        let url_response = session
            .get_upload_url_external(&url_request)
            .await
            .map_err(|err| AppError::Chat(format!("failed to get upload url: {err}")))?;

        // Step 2: Upload content to the URL.
        self.http
            .post(url_response.upload_url.0.to_string())
            .body(content)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| AppError::Chat(format!("failed to upload file: {err}")))?;

        // Step 3: Complete the upload.
        let file_ref = SlackApiFilesComplete {
            id: url_response.file_id,
            title: Some(filename.clone()),
        };
        let mut complete_request = SlackApiFilesCompleteUploadExternalRequest::new(vec![file_ref]);
        complete_request.channel_id = Some(self.channel.clone());
        complete_request.initial_comment = caption;
        session
            .files_complete_upload_external(&complete_request)
            .await
            .map_err(|err| AppError::Chat(format!("failed to complete upload: {err}")))?;

        info!(filename, "file uploaded");
        Ok(())
    }

    /// Download a private Slack file with the bot token.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` if the download fails or `AppError::Io` if
    /// the file cannot be written.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let bytes = self
            .http
            .get(url)
            .bearer_auth(&self.bot_token.token_value.0)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await.map_err(|err| {
            AppError::Io(format!("failed to write {}: {err}", dest.display()))
        })?;
        Ok(bytes.len() as u64)
    }
}

impl ChatPlatform for SlackService {
    fn send_message(&self, message: OutboundMessage) -> ChatFuture<'_, MessageId> {
        Box::pin(async move {
            let ts = self.post(&message).await?;
            Ok(MessageId(ts.0))
        })
    }

    fn edit_message(&self, id: MessageId, message: OutboundMessage) -> ChatFuture<'_, ()> {
        Box::pin(async move { self.update(SlackTs(id.0), &message).await })
    }

    fn delete_message(&self, id: MessageId) -> ChatFuture<'_, ()> {
        Box::pin(async move { self.delete(SlackTs(id.0)).await })
    }

    fn upload_file(&self, path: PathBuf, caption: Option<String>) -> ChatFuture<'_, ()> {
        Box::pin(async move { self.upload(&path, caption).await })
    }
}
