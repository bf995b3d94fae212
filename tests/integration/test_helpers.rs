//! Shared fakes and fixtures for integration tests.
//!
//! [`RecordingChat`] stands in for Slack and [`FakeLauncher`] for the agent
//! CLI, so orchestrator flows run end to end without network or processes.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay::chat::{ChatFuture, ChatPlatform, MessageId, OutboundMessage};
use agent_relay::config::TierModels;
use agent_relay::models::tier::CapabilityTier;
use agent_relay::orchestrator::accumulator::WindowSettings;
use agent_relay::orchestrator::handle::ChatPhase;
use agent_relay::orchestrator::slot::{ExecutionSlot, ProcessHandle, StopSignal};
use agent_relay::orchestrator::spawner::{
    InvocationRequest, ProcessLauncher, ProcessOutput, RunningProcess, SessionMode,
};
use agent_relay::orchestrator::watchdog::{ActivityClock, WatchdogEvent};
use agent_relay::orchestrator::{Engine, EngineDeps, EngineSettings, OrchestratorHandle};
use agent_relay::persistence::context::ContextPreamble;
use agent_relay::persistence::session_store::SessionStore;
use agent_relay::transcription::NoTranscriber;
use agent_relay::Result;
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Chat used by every flow test.
pub const CHAT: &str = "C-test";

/// Upper bound for any single wait in a flow test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an async `check` until it holds or [`WAIT`] elapses.
pub async fn wait_until_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Chat ─────────────────────────────────────────────────────

/// One call made against [`RecordingChat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRecord {
    Sent(MessageId, OutboundMessage),
    Edited(MessageId, OutboundMessage),
    Deleted(MessageId),
    Uploaded(PathBuf, Option<String>),
}

/// Chat platform that records every call and hands out sequential ids.
#[derive(Default)]
pub struct RecordingChat {
    records: Mutex<Vec<ChatRecord>>,
    next_id: Mutex<u64>,
    gate: Arc<RwLock<()>>,
    blocked: AtomicUsize,
}

impl RecordingChat {
    /// Hold every `send_message` until the returned guard is dropped.
    pub async fn pause(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate).write_owned().await
    }

    /// Number of `send_message` calls waiting on [`Self::pause`].
    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<ChatRecord> {
        self.records.lock().expect("records lock").clone()
    }

    /// Every posted message, in order.
    pub fn sent(&self) -> Vec<(MessageId, OutboundMessage)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                ChatRecord::Sent(id, message) => Some((id, message)),
                _ => None,
            })
            .collect()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(_, message)| message.text)
            .collect()
    }

    pub fn count_sent(&self, needle: &str) -> usize {
        self.sent_texts()
            .iter()
            .filter(|text| text.contains(needle))
            .count()
    }

    pub fn deleted(&self) -> Vec<MessageId> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                ChatRecord::Deleted(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, Option<String>)> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                ChatRecord::Uploaded(path, caption) => Some((path, caption)),
                _ => None,
            })
            .collect()
    }

    /// Wait until a posted message contains `needle` and return the latest.
    pub async fn wait_for_sent(&self, needle: &str) -> (MessageId, OutboundMessage) {
        wait_until(&format!("a message containing {needle:?}"), || {
            self.count_sent(needle) > 0
        })
        .await;
        self.sent()
            .into_iter()
            .rev()
            .find(|(_, message)| message.text.contains(needle))
            .expect("message present")
    }

    fn record(&self, record: ChatRecord) {
        self.records.lock().expect("records lock").push(record);
    }
}

impl ChatPlatform for RecordingChat {
    fn send_message(&self, message: OutboundMessage) -> ChatFuture<'_, MessageId> {
        Box::pin(async move {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            let open = self.gate.read().await;
            self.blocked.fetch_sub(1, Ordering::SeqCst);
            drop(open);
            let id = {
                let mut next = self.next_id.lock().expect("id lock");
                *next += 1;
                MessageId(format!("m{}", *next))
            };
            self.record(ChatRecord::Sent(id.clone(), message));
            Ok(id)
        })
    }

    fn edit_message(&self, id: MessageId, message: OutboundMessage) -> ChatFuture<'_, ()> {
        Box::pin(async move {
            self.record(ChatRecord::Edited(id, message));
            Ok(())
        })
    }

    fn delete_message(&self, id: MessageId) -> ChatFuture<'_, ()> {
        Box::pin(async move {
            self.record(ChatRecord::Deleted(id));
            Ok(())
        })
    }

    fn upload_file(&self, path: PathBuf, caption: Option<String>) -> ChatFuture<'_, ()> {
        Box::pin(async move {
            self.record(ChatRecord::Uploaded(path, caption));
            Ok(())
        })
    }
}

// ── Agent ────────────────────────────────────────────────────

/// Scripted behaviour for one fake agent run.
#[derive(Debug, Clone)]
pub struct Script {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    hold: bool,
    stubborn: bool,
}

impl Script {
    /// Exit 0 reporting `session_id`.
    pub fn complete(session_id: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: format!(r#"{{"type":"result","session_id":"{session_id}"}}"#),
            stderr: String::new(),
            hold: false,
            stubborn: false,
        }
    }

    /// Exit with `code` and `stderr`.
    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
            hold: false,
            stubborn: false,
        }
    }

    /// Keep running until stopped or released.
    ///
    /// `stdout` is what the agent has printed so far; a release exits 0
    /// with it, a stop signal kills the process with it.
    pub fn hold(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            hold: true,
            stubborn: false,
        }
    }

    /// Like [`Script::hold`], but only a forced stop ends the run.
    pub fn stubborn(stdout: &str) -> Self {
        Self {
            stubborn: true,
            ..Self::hold(stdout)
        }
    }
}

/// A recorded launch.
#[derive(Debug, Clone)]
pub struct Launch {
    pub request: InvocationRequest,
    pub payload: String,
}

/// Process launcher that follows [`Script`]s instead of spawning.
///
/// With no script queued a run completes, echoing the resumed id or
/// reporting `sess-<n>` for new sessions.
#[derive(Default)]
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<Script>>,
    launches: Mutex<Vec<Launch>>,
    gate: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn push(&self, script: Script) {
        self.scripts.lock().expect("scripts lock").push_back(script);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().expect("launches lock").clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().expect("launches lock").len()
    }

    /// Let a held run exit normally.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Most runs ever alive at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_launches(&self, count: usize) {
        wait_until(&format!("{count} launch(es)"), || self.launch_count() >= count).await;
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, request: &InvocationRequest) -> Result<RunningProcess> {
        let payload = std::fs::read_to_string(&request.payload_path)?;
        let number = {
            let mut launches = self.launches.lock().expect("launches lock");
            launches.push(Launch {
                request: request.clone(),
                payload,
            });
            launches.len()
        };
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| match &request.mode {
                SessionMode::ResumeSession(id) => Script::complete(id),
                SessionMode::NewSession => Script::complete(&format!("sess-{number}")),
            });

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let (output_tx, output_rx) = oneshot::channel();
        let gate = Arc::clone(&self.gate);
        let in_flight = Arc::clone(&self.in_flight);
        let alive = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(alive, Ordering::SeqCst);
        tokio::spawn(async move {
            let stopped = ProcessOutput {
                exit_code: None,
                stdout: script.stdout.clone(),
                stderr: String::new(),
            };
            let finished = ProcessOutput {
                exit_code: script.exit_code,
                stdout: script.stdout,
                stderr: script.stderr,
            };
            let output = if script.hold {
                loop {
                    tokio::select! {
                        signal = signal_rx.recv() => match signal {
                            Some(StopSignal::Graceful) if script.stubborn => {}
                            _ => break stopped,
                        },
                        () = gate.notified() => break finished,
                    }
                }
            } else {
                finished
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = exit_tx.send(true);
            let _ = output_tx.send(output);
        });

        Ok(RunningProcess {
            handle: ProcessHandle::new(None, signal_tx, exit_rx),
            output: output_rx,
        })
    }
}

// ── Engine ───────────────────────────────────────────────────

/// A running orchestrator wired to fakes.
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub chat: Arc<RecordingChat>,
    pub launcher: Arc<FakeLauncher>,
    pub slot: Arc<ExecutionSlot>,
    pub store: SessionStore,
    pub workspace: PathBuf,
    pub watchdog: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _temp: tempfile::TempDir,
}

impl Harness {
    /// Start an engine with a short debounce and no countdown.
    pub fn start() -> Self {
        Self::start_with(Duration::from_millis(80))
    }

    pub fn start_with(auto_debounce: Duration) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().to_path_buf();
        let context = workspace.join("context.md");
        std::fs::write(&context, "You relay for the operator.").expect("write context");

        let chat = Arc::new(RecordingChat::default());
        let launcher = Arc::new(FakeLauncher::default());
        let slot = ExecutionSlot::new(Duration::from_millis(200));
        let store = SessionStore::new(workspace.join("active_session.txt"));

        let settings = EngineSettings {
            window: WindowSettings {
                auto_debounce,
                media_debounce: Duration::from_millis(40),
                countdown: false,
            },
            default_tier: CapabilityTier::Deep,
            tiers: TierModels::default(),
            payload_dir: workspace.join("tmp"),
        };
        let deps = EngineDeps {
            chat: chat.clone(),
            launcher: launcher.clone(),
            transcriber: Arc::new(NoTranscriber),
            slot: Arc::clone(&slot),
            store: store.clone(),
            context: ContextPreamble::new(context),
            clock: ActivityClock::new(2),
        };
        let (engine, handle) = Engine::new(settings, deps);
        let watchdog = engine.watchdog_sender();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        Self {
            handle,
            chat,
            launcher,
            slot,
            store,
            workspace,
            watchdog,
            cancel,
            task,
            _temp: temp,
        }
    }

    /// Wait until `runs` invocations have finished and the actor has
    /// processed the last completion.
    pub async fn wait_runs(&self, runs: u64) {
        wait_until_async(&format!("{runs} finished run(s)"), || async {
            self.handle
                .status(Some(CHAT.into()))
                .await
                .is_ok_and(|status| {
                    status.runs >= runs
                        && status.slot == "idle"
                        && !matches!(
                            status.phase,
                            ChatPhase::Submitting | ChatPhase::Running | ChatPhase::Interrupting
                        )
                })
        })
        .await;
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.task.await.expect("engine task");
    }
}
