//! Agent process spawner and invocation runner.
//!
//! [`CliLauncher`] starts the agent CLI with the payload file on stdin and
//! hands back a [`ProcessHandle`] plus a channel that yields the captured
//! output once the process exits. [`AgentRunner`] drives one invocation on
//! top of a launcher: it writes the payload file, attaches the handle to
//! the execution slot, classifies the exit and applies the
//! resume-failure retry policy.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, TierModels};
use crate::models::tier::CapabilityTier;
use crate::orchestrator::payload::Payload;
use crate::orchestrator::slot::{ProcessHandle, SlotGuard, StopSignal, Termination};
use crate::persistence::session_store::SessionStore;
use crate::{AppError, Result};

/// Whether an invocation starts a session or continues one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Start a fresh session.
    NewSession,
    /// Continue the session with this id.
    ResumeSession(String),
}

/// Everything a launcher needs to start the agent once.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// New or resumed session.
    pub mode: SessionMode,
    /// Capability tier for model selection.
    pub tier: CapabilityTier,
    /// File holding the payload; becomes the process stdin.
    pub payload_path: PathBuf,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    /// Full standard output.
    pub stdout: String,
    /// Full standard error.
    pub stderr: String,
}

/// A started process: a control handle plus its eventual output.
pub struct RunningProcess {
    /// Stop/exit handle to attach to the slot.
    pub handle: ProcessHandle,
    /// Resolves once the process exits and its pipes are drained.
    pub output: oneshot::Receiver<ProcessOutput>,
}

/// Starts agent processes.
pub trait ProcessLauncher: Send + Sync {
    /// Start the agent for `request`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` if the process cannot be started.
    fn launch(&self, request: &InvocationRequest) -> Result<RunningProcess>;
}

/// Launcher for the real agent CLI.
#[derive(Debug, Clone)]
pub struct CliLauncher {
    binary: String,
    args: Vec<String>,
    model_flag: String,
    resume_flag: String,
    tiers: TierModels,
    env: HashMap<String, String>,
    working_dir: PathBuf,
}

impl CliLauncher {
    /// Build a launcher from the agent section of the config.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            binary: config.agent.binary.clone(),
            args: config.agent.args.clone(),
            model_flag: config.agent.model_flag.clone(),
            resume_flag: config.agent.resume_flag.clone(),
            tiers: config.agent.tiers.clone(),
            env: config.agent.env.clone(),
            working_dir: config.workspace_root().to_path_buf(),
        }
    }

    /// Command-line arguments for `request`, excluding the binary.
    #[must_use]
    pub fn command_args(&self, request: &InvocationRequest) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(self.model_flag.clone());
        args.push(self.tiers.model(request.tier).to_owned());
        if let SessionMode::ResumeSession(id) = &request.mode {
            args.push(self.resume_flag.clone());
            args.push(id.clone());
        }
        args
    }
}

impl ProcessLauncher for CliLauncher {
    fn launch(&self, request: &InvocationRequest) -> Result<RunningProcess> {
        let stdin = std::fs::File::open(&request.payload_path).map_err(|err| {
            AppError::Agent(format!(
                "failed to open payload {}: {err}",
                request.payload_path.display()
            ))
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.command_args(request))
            .envs(&self.env)
            .current_dir(&self.working_dir)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Agent(format!("failed to spawn agent cli: {err}")))?;

        let pid = child.id();
        info!(pid = pid.unwrap_or(0), binary = self.binary, "agent process spawned");

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let (output_tx, output_rx) = oneshot::channel();
        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        tokio::spawn(
            async move {
                let exit_code = supervise(&mut child, pid, signal_rx).await;
                let _ = exit_tx.send(true);
                let output = ProcessOutput {
                    exit_code,
                    stdout: stdout.await.unwrap_or_default(),
                    stderr: stderr.await.unwrap_or_default(),
                };
                let _ = output_tx.send(output);
            }
            .instrument(info_span!("agent_process", pid = pid.unwrap_or(0))),
        );

        Ok(RunningProcess {
            handle: ProcessHandle::new(pid, signal_tx, exit_rx),
            output: output_rx,
        })
    }
}

/// Wait for the child while reacting to stop signals.
async fn supervise(
    child: &mut Child,
    pid: Option<u32>,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
) -> Option<i32> {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => match signal {
                StopSignal::Graceful => request_graceful_stop(child, pid),
                StopSignal::Force => {
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "failed to force-kill agent process");
                    }
                }
            },
        }
    };

    match status {
        Ok(status) => {
            debug!(?status, "agent process exited");
            status.code()
        }
        Err(err) => {
            warn!(%err, "error waiting for agent process");
            None
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        if let Err(err) = child.start_kill() {
            warn!(%err, "failed to stop agent process without pid");
        }
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        warn!(%err, pid = raw, "failed to send SIGTERM to agent process");
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child, _pid: Option<u32>) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to stop agent process");
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buf).await {
        warn!(%err, "failed to read agent output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Result of a single agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit 0; the id is what the agent reported, if anything.
    Completed {
        /// Session id parsed from stdout.
        session_id: Option<String>,
    },
    /// The operator interrupted the run.
    Interrupted {
        /// Session id recovered from partial output.
        salvaged: Option<String>,
    },
    /// Non-zero exit, unparsable output or launch failure.
    Failed {
        /// Exit code, when the process ran at all.
        exit_code: Option<i32>,
        /// Captured standard error or launch error.
        stderr: String,
    },
}

/// Result of an invocation after the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    /// Final outcome.
    pub outcome: RunOutcome,
    /// Whether a failed resume was retried as a new session.
    pub retried: bool,
}

#[derive(Debug, Deserialize)]
struct AgentResult {
    session_id: Option<String>,
}

/// Extract the `session_id` from agent JSON output.
///
/// Accepts a single JSON document or newline-delimited JSON, preferring
/// the last line that carries an id.
#[must_use]
pub fn parse_session_id(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(result) = serde_json::from_str::<AgentResult>(trimmed) {
        return result.session_id.filter(|id| !id.trim().is_empty());
    }
    trimmed
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<AgentResult>(line.trim()).ok())
        .find_map(|result| result.session_id.filter(|id| !id.trim().is_empty()))
}

fn classify(output: &ProcessOutput, interrupted: bool) -> RunOutcome {
    if output.exit_code == Some(0) {
        if let Ok(result) = serde_json::from_str::<AgentResult>(output.stdout.trim()) {
            return RunOutcome::Completed {
                session_id: result.session_id,
            };
        }
        if let Some(session_id) = parse_session_id(&output.stdout) {
            return RunOutcome::Completed {
                session_id: Some(session_id),
            };
        }
        if !interrupted {
            return RunOutcome::Failed {
                exit_code: Some(0),
                stderr: format!("unparsable agent output: {}", excerpt(&output.stdout)),
            };
        }
    }
    if interrupted {
        return RunOutcome::Interrupted {
            salvaged: parse_session_id(&output.stdout),
        };
    }
    RunOutcome::Failed {
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_owned(),
    }
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 200;
    let text = text.trim();
    if text.chars().count() <= MAX {
        text.to_owned()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}\u{2026}")
    }
}

/// Drives agent invocations under the execution slot.
#[derive(Clone)]
pub struct AgentRunner {
    launcher: Arc<dyn ProcessLauncher>,
    payload_dir: PathBuf,
}

impl AgentRunner {
    /// Create a runner writing payload files into `payload_dir`.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, payload_dir: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            payload_dir: payload_dir.into(),
        }
    }

    /// Directory payload files are written to.
    #[must_use]
    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    /// Run the agent once in `mode`.
    ///
    /// The payload file exists only for the duration of the run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the payload file cannot be written and
    /// `AppError::Agent` if the process cannot be started.
    pub async fn run(
        &self,
        guard: &SlotGuard,
        payload: &str,
        mode: SessionMode,
        tier: CapabilityTier,
    ) -> Result<RunOutcome> {
        if guard.is_stopping() {
            return Ok(RunOutcome::Interrupted { salvaged: None });
        }
        let payload_file = self.write_payload(payload)?;
        let request = InvocationRequest {
            mode,
            tier,
            payload_path: payload_file.path().to_path_buf(),
        };

        let RunningProcess { handle, output } = self.launcher.launch(&request)?;
        if !guard.slot().attach(guard, handle.clone()) {
            info!("interrupt arrived before the agent started, stopping it");
            match handle.terminate(guard.slot().grace()).await {
                Termination::Unconfirmed => {
                    warn!(pid = ?handle.pid(), "abandoned agent exit not confirmed");
                }
                termination => debug!(?termination, "abandoned agent stopped"),
            }
        }

        let output = output.await.unwrap_or_else(|_| ProcessOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: "agent supervisor dropped".into(),
        });
        guard.slot().detach(guard);
        drop(payload_file);

        let interrupted = handle.was_interrupted() || guard.is_stopping();
        let outcome = classify(&output, interrupted);
        debug!(?outcome, exit_code = ?output.exit_code, "agent run finished");
        Ok(outcome)
    }

    /// Run an invocation and apply the session policy.
    ///
    /// A resume that fails (and was not interrupted) clears the stored
    /// session and is retried once as a new session with the same batch,
    /// rendered without the resume reminder. Completed runs persist the
    /// reported id; an interrupted new session persists a salvaged id when
    /// one parses. Nothing is persisted once the operator ended the session
    /// under `guard`, and the store is left cleared.
    pub async fn invoke(
        &self,
        guard: &SlotGuard,
        payload: &Payload,
        resume: Option<String>,
        tier: CapabilityTier,
        store: &SessionStore,
    ) -> InvocationReport {
        let span = info_span!("invocation", resume = resume.is_some(), %tier);
        async {
            let first_mode = resume
                .clone()
                .map_or(SessionMode::NewSession, SessionMode::ResumeSession);
            let outcome = self
                .run_logged(guard, &payload.render(resume.is_some()), first_mode.clone(), tier)
                .await;

            let (mode, outcome, retried) = match (&first_mode, outcome) {
                (SessionMode::ResumeSession(id), RunOutcome::Failed { exit_code, stderr }) => {
                    warn!(
                        session_id = id,
                        ?exit_code,
                        stderr = %excerpt(&stderr),
                        "resume failed, starting a new session"
                    );
                    if let Err(err) = store.clear() {
                        warn!(%err, "failed to clear session after resume failure");
                    }
                    if guard.is_stopping() {
                        (first_mode, RunOutcome::Interrupted { salvaged: None }, false)
                    } else {
                        let retry = self
                            .run_logged(guard, &payload.render(false), SessionMode::NewSession, tier)
                            .await;
                        (SessionMode::NewSession, retry, true)
                    }
                }
                (_, outcome) => (first_mode, outcome, false),
            };

            if !guard.session_ended() {
                persist(store, &mode, &outcome);
            }
            // The operator may end the session while the id is being written.
            if guard.session_ended() {
                info!("session ended during the run, discarding its id");
                if let Err(err) = store.clear() {
                    warn!(%err, "failed to clear ended session");
                }
            }
            InvocationReport { outcome, retried }
        }
        .instrument(span)
        .await
    }

    async fn run_logged(
        &self,
        guard: &SlotGuard,
        payload: &str,
        mode: SessionMode,
        tier: CapabilityTier,
    ) -> RunOutcome {
        match self.run(guard, payload, mode, tier).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "agent run could not start");
                RunOutcome::Failed {
                    exit_code: None,
                    stderr: err.to_string(),
                }
            }
        }
    }

    fn write_payload(&self, payload: &str) -> Result<tempfile::NamedTempFile> {
        std::fs::create_dir_all(&self.payload_dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create payload dir {}: {err}",
                self.payload_dir.display()
            ))
        })?;
        let mut file = tempfile::Builder::new()
            .prefix("payload_")
            .suffix(".txt")
            .tempfile_in(&self.payload_dir)
            .map_err(|err| AppError::Io(format!("failed to create payload file: {err}")))?;
        file.write_all(payload.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| AppError::Io(format!("failed to write payload file: {err}")))?;
        Ok(file)
    }
}

fn persist(store: &SessionStore, mode: &SessionMode, outcome: &RunOutcome) {
    let id = match (mode, outcome) {
        (_, RunOutcome::Completed { session_id: Some(id) }) => id,
        (_, RunOutcome::Completed { session_id: None }) => {
            warn!("agent completed without reporting a session id");
            return;
        }
        (SessionMode::NewSession, RunOutcome::Interrupted { salvaged: Some(id) }) => {
            info!(session_id = id, "salvaged session id from interrupted run");
            id
        }
        _ => return,
    };
    if let Err(err) = store.write(id) {
        warn!(%err, "failed to persist session id");
    }
}
