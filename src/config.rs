//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::models::tier::CapabilityTier;
use crate::{AppError, Result};

/// Keyring service name holding the Slack tokens.
const KEYRING_SERVICE: &str = "agent-relay";

/// Directory under the workspace root holding relay state.
const STATE_DIR: &str = ".agent-relay";

/// Nested Slack configuration for Socket Mode connectivity.
///
/// Tokens are loaded at runtime via OS keychain or environment variables,
/// not from the TOML config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SlackConfig {
    /// Channel the operator talks to the agent in.
    pub channel_id: String,
    /// App-level token used for Socket Mode (populated at runtime).
    #[serde(skip)]
    pub app_token: String,
    /// Bot user token used for posting messages (populated at runtime).
    #[serde(skip)]
    pub bot_token: String,
}

/// Model names handed to the agent CLI for each capability tier.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TierModels {
    /// Model used for [`CapabilityTier::Fast`].
    #[serde(default = "default_fast_model")]
    pub fast: String,
    /// Model used for [`CapabilityTier::Balanced`].
    #[serde(default = "default_balanced_model")]
    pub balanced: String,
    /// Model used for [`CapabilityTier::Deep`].
    #[serde(default = "default_deep_model")]
    pub deep: String,
}

impl TierModels {
    /// Model name configured for `tier`.
    #[must_use]
    pub fn model(&self, tier: CapabilityTier) -> &str {
        match tier {
            CapabilityTier::Fast => &self.fast,
            CapabilityTier::Balanced => &self.balanced,
            CapabilityTier::Deep => &self.deep,
        }
    }
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            balanced: default_balanced_model(),
            deep: default_deep_model(),
        }
    }
}

fn default_fast_model() -> String {
    "haiku".into()
}

fn default_balanced_model() -> String {
    "sonnet".into()
}

fn default_deep_model() -> String {
    "opus".into()
}

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary (e.g., `claude`).
    pub binary: String,
    /// Arguments placed before the model and resume flags.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Flag that precedes the model name.
    #[serde(default = "default_model_flag")]
    pub model_flag: String,
    /// Flag that precedes the session id when resuming.
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
    /// Tier used until the operator switches it.
    #[serde(default)]
    pub default_tier: CapabilityTier,
    /// Tier to model mapping.
    #[serde(default)]
    pub tiers: TierModels,
    /// Time between the graceful and the forced termination signal.
    #[serde(default = "default_interrupt_grace_ms")]
    pub interrupt_grace_ms: u64,
    /// Extra environment variables for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_agent_args() -> Vec<String> {
    vec![
        "-p".into(),
        "--output-format".into(),
        "json".into(),
        "--dangerously-skip-permissions".into(),
    ]
}

fn default_model_flag() -> String {
    "--model".into()
}

fn default_resume_flag() -> String {
    "--resume".into()
}

fn default_interrupt_grace_ms() -> u64 {
    2000
}

/// Optional overrides for the files the relay keeps on disk.
///
/// Relative paths resolve against the workspace root.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    /// Session id file.
    pub session_file: Option<PathBuf>,
    /// Context preamble prepended to every payload.
    pub context_file: Option<PathBuf>,
    /// Directory for temporary payload files.
    pub payload_dir: Option<PathBuf>,
    /// Directory downloaded attachments are stored in.
    pub download_dir: Option<PathBuf>,
}

/// Debounce windows for message accumulation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AccumulationConfig {
    /// Quiet period after the last message before an Auto batch is sent.
    #[serde(default = "default_auto_debounce_ms")]
    pub auto_debounce_ms: u64,
    /// Quiet period after the last album part before the album is sent.
    #[serde(default = "default_media_group_debounce_ms")]
    pub media_group_debounce_ms: u64,
    /// Edit the Auto control message with the remaining seconds.
    #[serde(default = "default_true")]
    pub countdown: bool,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            auto_debounce_ms: default_auto_debounce_ms(),
            media_group_debounce_ms: default_media_group_debounce_ms(),
            countdown: true,
        }
    }
}

fn default_auto_debounce_ms() -> u64 {
    5000
}

fn default_media_group_debounce_ms() -> u64 {
    500
}

/// Inactivity watchdog configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Whether the watchdog runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between checks.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Idle durations that each trigger one prompt.
    #[serde(default = "default_thresholds_seconds")]
    pub thresholds_seconds: Vec<u64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: default_poll_interval_seconds(),
            thresholds_seconds: default_thresholds_seconds(),
        }
    }
}

fn default_poll_interval_seconds() -> u64 {
    300
}

fn default_thresholds_seconds() -> Vec<u64> {
    vec![1800, 28800]
}

fn default_true() -> bool {
    true
}

/// External speech-to-text command for voice attachments.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptionConfig {
    /// Program invoked with the audio path as its last argument.
    pub command: Option<String>,
    /// Arguments placed before the audio path.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_http_port() -> u16 {
    8081
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace root the agent runs in.
    pub default_workspace_root: PathBuf,
    /// Slack connectivity settings.
    pub slack: SlackConfig,
    /// Slack user IDs whose messages are relayed.
    pub authorized_user_ids: Vec<String>,
    /// Local port of the agent-facing HTTP API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Agent CLI settings.
    pub agent: AgentConfig,
    /// On-disk state locations.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Accumulation debounce settings.
    #[serde(default)]
    pub accumulation: AccumulationConfig,
    /// Inactivity watchdog settings.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Voice transcription settings.
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load Slack credentials from OS keychain with env-var fallback.
    ///
    /// Tries the `agent-relay` keyring service first, then falls back to
    /// `SLACK_APP_TOKEN` / `SLACK_BOT_TOKEN` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env vars provide
    /// the required tokens.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.slack.app_token = load_credential("slack_app_token", "SLACK_APP_TOKEN").await?;
        self.slack.bot_token = load_credential("slack_bot_token", "SLACK_BOT_TOKEN").await?;
        Ok(())
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.default_workspace_root
    }

    /// Session id file.
    #[must_use]
    pub fn session_file(&self) -> PathBuf {
        self.resolve(self.paths.session_file.as_deref(), "active_session.txt")
    }

    /// Context preamble file.
    #[must_use]
    pub fn context_file(&self) -> PathBuf {
        self.resolve(self.paths.context_file.as_deref(), "context.md")
    }

    /// Directory for temporary payload files.
    #[must_use]
    pub fn payload_dir(&self) -> PathBuf {
        self.resolve(self.paths.payload_dir.as_deref(), "tmp")
    }

    /// Directory downloaded attachments land in.
    #[must_use]
    pub fn download_dir(&self) -> PathBuf {
        self.resolve(self.paths.download_dir.as_deref(), "downloads")
    }

    /// Auto-mode debounce window.
    #[must_use]
    pub fn auto_debounce(&self) -> Duration {
        Duration::from_millis(self.accumulation.auto_debounce_ms)
    }

    /// Album debounce window.
    #[must_use]
    pub fn media_group_debounce(&self) -> Duration {
        Duration::from_millis(self.accumulation.media_group_debounce_ms)
    }

    /// Grace period between the graceful and forced stop signals.
    #[must_use]
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.agent.interrupt_grace_ms)
    }

    /// Validate that a Slack user is authorized to drive the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` if the user is not in the allowed list.
    pub fn ensure_authorized(&self, user_id: &str) -> Result<()> {
        if self.authorized_user_ids.iter().any(|id| id == user_id) {
            Ok(())
        } else {
            Err(AppError::Unauthorized("user is not authorized".into()))
        }
    }

    fn resolve(&self, configured: Option<&Path>, default_name: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.default_workspace_root.join(path),
            None => self
                .default_workspace_root
                .join(STATE_DIR)
                .join(default_name),
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.authorized_user_ids.is_empty() {
            return Err(AppError::Config(
                "authorized_user_ids must not be empty".into(),
            ));
        }

        if self.agent.binary.trim().is_empty() {
            return Err(AppError::Config("agent.binary must not be empty".into()));
        }

        if self.agent.interrupt_grace_ms == 0 {
            return Err(AppError::Config(
                "agent.interrupt_grace_ms must be greater than zero".into(),
            ));
        }

        if self.accumulation.auto_debounce_ms == 0 || self.accumulation.media_group_debounce_ms == 0
        {
            return Err(AppError::Config(
                "accumulation debounce windows must be greater than zero".into(),
            ));
        }

        if self.watchdog.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "watchdog.poll_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.watchdog.thresholds_seconds.iter().any(|&secs| secs == 0) {
            return Err(AppError::Config(
                "watchdog.thresholds_seconds entries must be greater than zero".into(),
            ));
        }
        self.watchdog.thresholds_seconds.sort_unstable();
        self.watchdog.thresholds_seconds.dedup();

        let canonical_root = self
            .default_workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("default_workspace_root invalid: {err}")))?;
        self.default_workspace_root = canonical_root;

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
