//! Orchestrator actor.
//!
//! The [`Engine`] is the single logical task that owns every piece of
//! mutable relay state except the execution slot: the accumulation
//! window, the pending question, intermediate messages, control message
//! ids and the current tier. Chat events, controls, timer reports,
//! watchdog events, API requests and run completions are processed one at
//! a time in arrival order.
//!
//! Long operations never run on the actor itself. Invocations run on a
//! spawned task that owns the [`SlotGuard`] and reports back with
//! [`Input::RunFinished`] after the slot is released; interrupts run on
//! their own task so the actor keeps draining input while the agent stops.
//!
//! Another batch may take the slot before that report is handled, so the
//! report carries the slot generation and anything tied to the current
//! run (the progress indicator) is only touched when it matches. Session
//! decisions that must hold before the slot frees up, like ending the
//! session, are recorded on the slot itself.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::chat::{ChatPlatform, MessageId, OutboundMessage};
use crate::config::{GlobalConfig, TierModels};
use crate::models::batch::{Batch, BatchMode};
use crate::models::control::{Control, ControlAction};
use crate::models::event::ChatEvent;
use crate::models::question::PendingQuestion;
use crate::models::tier::CapabilityTier;
use crate::orchestrator::accumulator::{
    AccumulationWindow, MultiToggle, Offer, TimerEvent, TimerOutcome, WindowSettings,
};
use crate::orchestrator::handle::{ChatPhase, Input, OrchestratorHandle, RunReport, StatusSnapshot};
use crate::orchestrator::intermediate::IntermediateMessages;
use crate::orchestrator::payload::{self, Payload};
use crate::orchestrator::slot::{ExecutionSlot, InterruptOutcome, SlotGuard};
use crate::orchestrator::spawner::{AgentRunner, InvocationReport, ProcessLauncher, RunOutcome};
use crate::orchestrator::watchdog::{ActivityClock, WatchdogEvent};
use crate::persistence::context::ContextPreamble;
use crate::persistence::session_store::SessionStore;
use crate::transcription::Transcriber;
use crate::Result;

const INPUT_CAPACITY: usize = 256;
const WATCHDOG_CAPACITY: usize = 8;
const PREVIEW_CHARS: usize = 80;
const PROGRESS_INDICATOR: &str = "\u{23f3}";

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Accumulation debounce settings.
    pub window: WindowSettings,
    /// Tier used until the operator switches it.
    pub default_tier: CapabilityTier,
    /// Tier to model mapping, for status reports.
    pub tiers: TierModels,
    /// Directory for temporary payload files.
    pub payload_dir: PathBuf,
}

impl EngineSettings {
    /// Derive settings from the global config.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            window: WindowSettings {
                auto_debounce: config.auto_debounce(),
                media_debounce: config.media_group_debounce(),
                countdown: config.accumulation.countdown,
            },
            default_tier: config.agent.default_tier,
            tiers: config.agent.tiers.clone(),
            payload_dir: config.payload_dir(),
        }
    }
}

/// Collaborators the orchestrator drives.
pub struct EngineDeps {
    /// Operator conversation.
    pub chat: Arc<dyn ChatPlatform>,
    /// Agent process launcher.
    pub launcher: Arc<dyn ProcessLauncher>,
    /// Voice-note transcriber.
    pub transcriber: Arc<dyn Transcriber>,
    /// The single execution slot.
    pub slot: Arc<ExecutionSlot>,
    /// Session id file.
    pub store: SessionStore,
    /// Context preamble file.
    pub context: ContextPreamble,
    /// Activity clock shared with the watchdog.
    pub clock: Arc<ActivityClock>,
}

/// Origin of a submission, for operator notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Batch,
    Answer,
}

struct AutoControl {
    id: MessageId,
    header: String,
    preview: String,
}

/// The orchestrator actor. Build with [`Engine::new`], then drive with
/// [`Engine::run`].
pub struct Engine {
    settings: EngineSettings,
    chat: Arc<dyn ChatPlatform>,
    transcriber: Arc<dyn Transcriber>,
    slot: Arc<ExecutionSlot>,
    store: SessionStore,
    context: ContextPreamble,
    clock: Arc<ActivityClock>,
    runner: AgentRunner,
    window: AccumulationWindow,
    tier: CapabilityTier,
    pending_question: Option<PendingQuestion>,
    intermediate: IntermediateMessages,
    phases: HashMap<String, ChatPhase>,
    auto_controls: HashMap<String, AutoControl>,
    multi_controls: HashMap<String, Vec<MessageId>>,
    parked_answers: VecDeque<Batch>,
    active_run: Option<u64>,
    inputs: mpsc::Receiver<Input>,
    self_tx: mpsc::Sender<Input>,
    timers: mpsc::UnboundedReceiver<TimerEvent>,
    watchdog_rx: mpsc::Receiver<WatchdogEvent>,
    watchdog_tx: mpsc::Sender<WatchdogEvent>,
}

impl Engine {
    /// Build the actor and the handle used to feed it.
    #[must_use]
    pub fn new(settings: EngineSettings, deps: EngineDeps) -> (Self, OrchestratorHandle) {
        let (self_tx, inputs) = mpsc::channel(INPUT_CAPACITY);
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (watchdog_tx, watchdog_rx) = mpsc::channel(WATCHDOG_CAPACITY);
        let runner = AgentRunner::new(deps.launcher, settings.payload_dir.clone());
        let engine = Self {
            window: AccumulationWindow::new(settings.window, timer_tx),
            tier: settings.default_tier,
            settings,
            chat: deps.chat,
            transcriber: deps.transcriber,
            slot: deps.slot,
            store: deps.store,
            context: deps.context,
            clock: deps.clock,
            runner,
            pending_question: None,
            intermediate: IntermediateMessages::default(),
            phases: HashMap::new(),
            auto_controls: HashMap::new(),
            multi_controls: HashMap::new(),
            parked_answers: VecDeque::new(),
            active_run: None,
            inputs,
            self_tx: self_tx.clone(),
            timers,
            watchdog_rx,
            watchdog_tx,
        };
        (engine, OrchestratorHandle::new(self_tx))
    }

    /// Sender the inactivity watchdog reports on.
    #[must_use]
    pub fn watchdog_sender(&self) -> mpsc::Sender<WatchdogEvent> {
        self.watchdog_tx.clone()
    }

    /// Process inputs until `cancel` fires, then stop any running agent.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(tier = %self.tier, "orchestrator started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(input) = self.inputs.recv() => self.handle_input(input).await,
                Some(timer) = self.timers.recv() => self.handle_timer(timer).await,
                Some(event) = self.watchdog_rx.recv() => self.handle_watchdog(event).await,
                else => break,
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("orchestrator shutting down");
        self.window.clear();
        if self.slot.interrupt().await == InterruptOutcome::Interrupted {
            info!("running agent stopped for shutdown");
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Chat(event) => self.on_chat_event(event).await,
            Input::Control { chat_id, action } => self.on_control(&chat_id, action).await,
            Input::Outbound { text, reply } => {
                let result = self.on_outbound(text).await;
                let _ = reply.send(result);
            }
            Input::Ask { question, reply } => {
                let result = self.on_ask(question).await;
                let _ = reply.send(result);
            }
            Input::SendFile {
                path,
                caption,
                reply,
            } => {
                let result = self.chat.upload_file(path, caption).await;
                if result.is_ok() {
                    self.clock.record();
                }
                let _ = reply.send(result);
            }
            Input::Status { chat_id, reply } => {
                let _ = reply.send(self.snapshot(chat_id.as_deref()));
            }
            Input::RunFinished {
                chat_id,
                generation,
                report,
            } => self.on_run_finished(&chat_id, generation, report).await,
        }
    }

    // ── Inbound events ───────────────────────────────────────

    async fn on_chat_event(&mut self, event: ChatEvent) {
        if !event.is_qualifying() {
            debug!(chat_id = event.chat_id, "ignoring empty event");
            return;
        }

        if self.pending_question.is_some() && event.group_key.is_none() && event.trimmed_text().is_some() {
            info!(chat_id = event.chat_id, "operator answered the open question");
            self.pending_question = None;
            self.submit_answer(Batch::single(event)).await;
            return;
        }

        let chat_id = event.chat_id.clone();
        let preview = event.preview(PREVIEW_CHARS);
        let resumed = self.window.auto_paused(&chat_id);
        match self.window.offer(event) {
            Offer::Auto { count } => {
                self.set_phase(&chat_id, ChatPhase::Accumulating);
                self.show_auto_control(&chat_id, count, preview, resumed).await;
            }
            Offer::Multi { count } => {
                self.set_phase(&chat_id, ChatPhase::Accumulating);
                let message = OutboundMessage::text(format!(
                    "\u{1f4dd} *Message #{count} added*\n\n{preview}\n\nQueued: *{count}*"
                ))
                .with_controls(vec![vec![
                    Control::new("\u{25b6}\u{fe0f} Start", ControlAction::StartMulti),
                    Control::new("\u{274c} Cancel", ControlAction::CancelMulti),
                ]]);
                if let Some(id) = self.notify_message(message).await {
                    self.multi_controls.entry(chat_id).or_default().push(id);
                }
            }
            Offer::MediaGroup { key, parts } => {
                self.set_phase(&chat_id, ChatPhase::Accumulating);
                debug!(group_key = key, parts, "album part queued");
            }
        }
    }

    async fn show_auto_control(&mut self, chat_id: &str, count: usize, preview: String, resumed: bool) {
        if let Some(previous) = self.auto_controls.remove(chat_id) {
            self.delete_quietly(previous.id).await;
        }
        let header = if resumed {
            "One more message added".to_owned()
        } else if count > 1 {
            format!("Request received ({count} messages)")
        } else {
            "Request received".to_owned()
        };
        let secs = self.settings.window.auto_debounce.as_secs().max(1);
        let message = auto_control_message(&header, &preview, secs);
        if let Some(id) = self.notify_message(message).await {
            self.auto_controls.insert(
                chat_id.to_owned(),
                AutoControl {
                    id,
                    header,
                    preview,
                },
            );
        }
    }

    // ── Timers ───────────────────────────────────────────────

    async fn handle_timer(&mut self, event: TimerEvent) {
        match self.window.on_timer(&event) {
            TimerOutcome::Tick {
                chat_id,
                remaining_secs,
            } => {
                if let Some(control) = self.auto_controls.get(&chat_id) {
                    let message =
                        auto_control_message(&control.header, &control.preview, remaining_secs);
                    if let Err(err) = self.chat.edit_message(control.id.clone(), message).await {
                        debug!(%err, "countdown edit failed");
                    }
                }
            }
            TimerOutcome::AutoReady(batch) => {
                if let Some(control) = self.auto_controls.remove(&batch.chat_id) {
                    self.delete_quietly(control.id).await;
                }
                info!(chat_id = batch.chat_id, items = batch.len(), "auto batch ready");
                self.submit_batch(batch).await;
            }
            TimerOutcome::MediaReady(key) => self.submit_media(&key).await,
            TimerOutcome::Stale => {}
        }
    }

    // ── Submission ───────────────────────────────────────────

    async fn submit_batch(&mut self, batch: Batch) {
        let Some(guard) = self.slot.try_acquire() else {
            warn!(chat_id = batch.chat_id, items = batch.len(), "agent busy, batch dropped");
            self.refresh_phase(&batch.chat_id);
            self.notify(
                "\u{23f3} *Hold on*\n\nStill working on the previous request. This batch was not sent.",
            )
            .await;
            return;
        };
        self.dispatch(guard, batch, Origin::Batch).await;
    }

    async fn submit_media(&mut self, key: &str) {
        let Some(guard) = self.slot.try_acquire() else {
            info!(group_key = key, "agent busy, album parked");
            return;
        };
        match self.window.take_media(key) {
            Some(batch) => self.dispatch(guard, batch, Origin::Batch).await,
            None => drop(guard),
        }
    }

    async fn submit_answer(&mut self, batch: Batch) {
        let Some(guard) = self.slot.try_acquire() else {
            info!(chat_id = batch.chat_id, "agent still stopping, answer parked");
            self.parked_answers.push_back(batch);
            return;
        };
        self.dispatch(guard, batch, Origin::Answer).await;
    }

    async fn drain_parked(&mut self) {
        let next_media = self.window.ready_media().into_iter().next();
        if self.parked_answers.is_empty() && next_media.is_none() {
            return;
        }
        if !self.slot.is_idle() {
            return;
        }
        if let Some(batch) = self.parked_answers.pop_front() {
            self.submit_answer(batch).await;
        } else if let Some(key) = next_media {
            self.submit_media(&key).await;
        }
    }

    async fn dispatch(&mut self, guard: SlotGuard, batch: Batch, origin: Origin) {
        let chat_id = batch.chat_id.clone();
        self.set_phase(&chat_id, ChatPhase::Submitting);
        self.cleanup_intermediate().await;

        let session = self.store.read();
        if origin == Origin::Answer {
            let notice = if session.is_some() {
                "\u{2705} Answer accepted, passing it to the agent\u{2026}"
            } else {
                "\u{274c} Session lost, starting a new one\u{2026}"
            };
            self.notify(notice).await;
        }

        let status = status_line(&batch, session.is_some(), origin);
        if let Some(id) = self.notify(&status).await {
            self.intermediate.push_status(id);
        }
        if let Some(id) = self.notify(PROGRESS_INDICATOR).await {
            self.intermediate.set_progress(id);
        }
        self.clock.record();

        let task = InvocationTask {
            runner: self.runner.clone(),
            transcriber: Arc::clone(&self.transcriber),
            context: self.context.clone(),
            store: self.store.clone(),
            tier: self.tier,
            chat_id: chat_id.clone(),
            batch,
            session,
            tx: self.self_tx.clone(),
        };
        let run_id = Uuid::new_v4();
        self.active_run = Some(guard.generation());
        info!(
            %run_id,
            generation = guard.generation(),
            chat_id,
            items = task.batch.len(),
            resume = task.session.is_some(),
            tier = %self.tier,
            "submitting batch"
        );
        tokio::spawn(task.run(guard).instrument(info_span!(
            "invocation_task",
            %run_id,
            chat_id = chat_id.as_str()
        )));
        self.set_phase(&chat_id, ChatPhase::Running);
    }

    async fn on_run_finished(&mut self, chat_id: &str, generation: u64, report: RunReport) {
        if self.active_run == Some(generation) {
            self.active_run = None;
            if let Some(progress) = self.intermediate.take_progress() {
                self.delete_quietly(progress).await;
            }
        } else {
            debug!(
                chat_id,
                generation,
                active = ?self.active_run,
                "late completion of a superseded run"
            );
        }

        match report {
            RunReport::Invocation(InvocationReport { outcome, retried }) => match outcome {
                RunOutcome::Completed { session_id } => {
                    self.clock.record();
                    info!(chat_id, ?session_id, retried, "invocation completed");
                }
                RunOutcome::Interrupted { salvaged } => {
                    info!(chat_id, ?salvaged, "invocation interrupted");
                }
                RunOutcome::Failed { exit_code, stderr } => {
                    warn!(chat_id, ?exit_code, retried, "invocation failed");
                    self.notify(&failure_notice(exit_code, &stderr)).await;
                }
            },
            RunReport::InputFailed(reason) => {
                warn!(chat_id, reason, "invocation aborted before start");
                self.notify(&format!(
                    "\u{274c} *Could not prepare the request*\n\n{reason}"
                ))
                .await;
            }
        }

        self.refresh_phase(chat_id);
        self.drain_parked().await;
    }

    async fn cleanup_intermediate(&mut self) {
        for id in self.intermediate.take_for_cleanup() {
            self.delete_quietly(id).await;
        }
    }

    // ── Controls ─────────────────────────────────────────────

    #[allow(clippy::too_many_lines)] // One arm per control.
    async fn on_control(&mut self, chat_id: &str, action: ControlAction) {
        info!(chat_id, action = action.action_id(), "control received");
        match action {
            ControlAction::AddMore => {
                if let Some(control) = self.auto_controls.remove(chat_id) {
                    self.delete_quietly(control.id).await;
                }
                if self.window.add_more(chat_id) {
                    let secs = self.settings.window.auto_debounce.as_secs().max(1);
                    self.notify(&format!(
                        "\u{1f4dd} *Send the next message*\n\nThe {secs}s countdown starts again after it arrives."
                    ))
                    .await;
                } else {
                    self.notify("Nothing is waiting to be sent.").await;
                }
            }
            ControlAction::CancelAuto => {
                if let Some(control) = self.auto_controls.remove(chat_id) {
                    self.delete_quietly(control.id).await;
                }
                let dropped = self.window.cancel_auto(chat_id);
                self.refresh_phase(chat_id);
                self.notify(&format!("\u{274c} Request cancelled ({dropped} message(s) discarded)"))
                    .await;
            }
            ControlAction::ToggleMulti => match self.window.toggle_multi(chat_id) {
                MultiToggle::Enabled { discarded_auto } => {
                    if let Some(control) = self.auto_controls.remove(chat_id) {
                        self.delete_quietly(control.id).await;
                    }
                    let mut text = String::from(
                        "\u{1f4da} *Multi mode on*\n\nEvery message is queued until you press Start.",
                    );
                    if discarded_auto > 0 {
                        text.push_str(&format!(
                            "\n{discarded_auto} pending message(s) were discarded."
                        ));
                    }
                    self.refresh_phase(chat_id);
                    self.notify(&text).await;
                }
                MultiToggle::Disabled { discarded } => {
                    self.clear_multi_controls(chat_id).await;
                    self.refresh_phase(chat_id);
                    self.notify(&format!(
                        "\u{1f4d6} *Multi mode off* ({discarded} message(s) discarded)"
                    ))
                    .await;
                }
            },
            ControlAction::StartMulti => {
                let Some(batch) = self.window.start_multi(chat_id) else {
                    self.notify("\u{274c} Nothing accumulated yet.").await;
                    return;
                };
                let Some(guard) = self.slot.try_acquire() else {
                    self.window.restore_multi(batch);
                    self.notify(
                        "\u{23f3} *Hold on*\n\nStill working on the previous request. Press Start again once it finishes.",
                    )
                    .await;
                    return;
                };
                self.clear_multi_controls(chat_id).await;
                info!(chat_id, items = batch.len(), "multi batch started");
                self.dispatch(guard, batch, Origin::Batch).await;
            }
            ControlAction::CancelMulti => {
                let dropped = self.window.cancel_multi(chat_id);
                self.clear_multi_controls(chat_id).await;
                self.refresh_phase(chat_id);
                self.notify(&format!("\u{274c} Cancelled ({dropped} message(s) discarded)"))
                    .await;
            }
            ControlAction::Stop => self.spawn_interrupt(chat_id, false),
            ControlAction::EndSession => {
                self.pending_question = None;
                self.parked_answers.clear();
                if self.slot.end_session() {
                    debug!(chat_id, "running invocation will not keep its session");
                }
                if let Err(err) = self.store.clear() {
                    warn!(%err, "failed to clear session");
                }
                self.spawn_interrupt(chat_id, true);
            }
            ControlAction::ContinueSession => {
                self.clock.record();
                self.notify("\u{2705} Idle timer reset").await;
            }
            ControlAction::Answer(index) => self.on_answer_button(chat_id, index).await,
            ControlAction::SetTier(tier) => {
                self.tier = tier;
                info!(%tier, "tier changed");
                self.notify(&format!(
                    "{} tier selected (`{}`). It applies from the next request.",
                    tier.label(),
                    self.settings.tiers.model(tier)
                ))
                .await;
            }
            ControlAction::Status => {
                let text = status_report(&self.snapshot(Some(chat_id)));
                self.notify(&text).await;
            }
            ControlAction::Help => {
                self.notify(HELP_TEXT).await;
            }
        }
    }

    async fn on_answer_button(&mut self, chat_id: &str, index: usize) {
        let Some(question) = self.pending_question.take() else {
            self.notify("\u{274c} There is no open question.").await;
            return;
        };
        let Some(answer) = question.option(index).map(str::to_owned) else {
            warn!(index, "answer index out of range");
            self.pending_question = Some(question);
            self.notify("\u{274c} That option does not exist.").await;
            return;
        };
        info!(chat_id, answer, "operator picked an answer");
        self.notify(&format!("\u{2705} You chose: *{answer}*")).await;
        self.submit_answer(Batch::single(ChatEvent::text(chat_id, answer)))
            .await;
    }

    fn spawn_interrupt(&mut self, chat_id: &str, ended: bool) {
        if !self.slot.is_idle() {
            self.set_phase(chat_id, ChatPhase::Interrupting);
        }
        let slot = Arc::clone(&self.slot);
        let chat = Arc::clone(&self.chat);
        tokio::spawn(
            async move {
                let outcome = slot.interrupt().await;
                let text = match (ended, outcome) {
                    (true, InterruptOutcome::Interrupted) => "\u{2705} Session ended (agent stopped)",
                    (true, InterruptOutcome::NoOp) => "\u{2705} Session ended",
                    (false, InterruptOutcome::Interrupted) => {
                        "\u{23f8} *Stopped*\n\nThe next message resumes the session."
                    }
                    (false, InterruptOutcome::NoOp) => "\u{23f8} Nothing is running.",
                };
                if let Err(err) = chat.send_message(OutboundMessage::text(text)).await {
                    warn!(%err, "failed to acknowledge interrupt");
                }
            }
            .instrument(info_span!("interrupt", ended)),
        );
    }

    async fn clear_multi_controls(&mut self, chat_id: &str) {
        for id in self.multi_controls.remove(chat_id).unwrap_or_default() {
            self.delete_quietly(id).await;
        }
    }

    // ── Agent-originated requests ────────────────────────────

    async fn on_outbound(&mut self, text: String) -> Result<()> {
        let controls = if self.store.read().is_some() {
            vec![vec![
                Control::new("\u{23f8} Stop", ControlAction::Stop),
                Control::new("\u{274c} End session", ControlAction::EndSession),
            ]]
        } else {
            Vec::new()
        };
        self.chat
            .send_message(OutboundMessage::text(text).with_controls(controls))
            .await?;
        self.clock.record();

        if !self.slot.is_idle() {
            if let Some(previous) = self.intermediate.take_progress() {
                self.delete_quietly(previous).await;
            }
            if let Some(id) = self.notify(PROGRESS_INDICATOR).await {
                self.intermediate.set_progress(id);
            }
        }
        Ok(())
    }

    async fn on_ask(&mut self, question: PendingQuestion) -> Result<()> {
        let message = OutboundMessage::text(format!(
            "\u{2753} *{}*\n\nChoose an option or type your own answer:",
            question.prompt
        ))
        .with_controls(question_rows(&question));
        self.chat.send_message(message).await?;
        info!(options = question.options.len(), "question posted, interrupting agent");
        self.pending_question = Some(question);

        let slot = Arc::clone(&self.slot);
        tokio::spawn(
            async move {
                let outcome = slot.interrupt().await;
                debug!(?outcome, "agent stopped for question");
            }
            .instrument(info_span!("interrupt", reason = "question")),
        );
        Ok(())
    }

    async fn handle_watchdog(&mut self, event: WatchdogEvent) {
        let WatchdogEvent::Idle { threshold, .. } = event;
        let message = OutboundMessage::text(format!(
            "\u{23f0} *Session idle for {}*\n\nKeep the session or end it?",
            human_duration(threshold)
        ))
        .with_controls(vec![
            vec![Control::new(
                "\u{2705} Keep working",
                ControlAction::ContinueSession,
            )],
            vec![Control::new("\u{274c} End session", ControlAction::EndSession)],
        ]);
        self.notify_message(message).await;
    }

    // ── Helpers ──────────────────────────────────────────────

    fn snapshot(&self, chat_id: Option<&str>) -> StatusSnapshot {
        let (phase, multi_mode, queued) = chat_id.map_or((ChatPhase::Idle, false, 0), |chat| {
            (
                self.phases.get(chat).copied().unwrap_or(ChatPhase::Idle),
                self.window.is_multi(chat),
                self.window.auto_len(chat) + self.window.multi_len(chat),
            )
        });
        StatusSnapshot {
            tier: self.tier,
            model: self.settings.tiers.model(self.tier).to_owned(),
            session_id: self.store.read(),
            slot: self.slot.state().as_str(),
            runs: self.slot.releases(),
            phase,
            multi_mode,
            queued,
            parked: self.parked_answers.len() + self.window.ready_media().len(),
            question_open: self.pending_question.is_some(),
        }
    }

    fn set_phase(&mut self, chat_id: &str, phase: ChatPhase) {
        let previous = self.phases.insert(chat_id.to_owned(), phase);
        if previous != Some(phase) {
            debug!(chat_id, ?previous, ?phase, "chat phase changed");
        }
    }

    fn refresh_phase(&mut self, chat_id: &str) {
        let phase = if !self.slot.is_idle() {
            self.phases
                .get(chat_id)
                .copied()
                .filter(|phase| matches!(phase, ChatPhase::Running | ChatPhase::Interrupting))
                .unwrap_or(ChatPhase::Accumulating)
        } else if self.window.auto_len(chat_id) + self.window.multi_len(chat_id) > 0
            || self.window.pending_media() > 0
        {
            ChatPhase::Accumulating
        } else {
            ChatPhase::Idle
        };
        self.set_phase(chat_id, phase);
    }

    async fn notify(&self, text: &str) -> Option<MessageId> {
        self.notify_message(OutboundMessage::text(text)).await
    }

    async fn notify_message(&self, message: OutboundMessage) -> Option<MessageId> {
        match self.chat.send_message(message).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(%err, "failed to post notice");
                None
            }
        }
    }

    async fn delete_quietly(&self, id: MessageId) {
        if let Err(err) = self.chat.delete_message(id.clone()).await {
            warn!(%err, message_id = %id, "failed to delete message");
        }
    }
}

/// Work carried into the spawned invocation task.
struct InvocationTask {
    runner: AgentRunner,
    transcriber: Arc<dyn Transcriber>,
    context: ContextPreamble,
    store: SessionStore,
    tier: CapabilityTier,
    chat_id: String,
    batch: Batch,
    session: Option<String>,
    tx: mpsc::Sender<Input>,
}

impl InvocationTask {
    async fn run(self, guard: SlotGuard) {
        let generation = guard.generation();
        let report = match payload::render_batch(&self.batch, self.transcriber.as_ref()).await {
            Ok(rendered) => {
                let payload = Payload::new(self.context.load(), rendered);
                RunReport::Invocation(
                    self.runner
                        .invoke(&guard, &payload, self.session, self.tier, &self.store)
                        .await,
                )
            }
            Err(err) => RunReport::InputFailed(err.to_string()),
        };
        drop(guard);

        let finished = Input::RunFinished {
            chat_id: self.chat_id,
            generation,
            report,
        };
        if self.tx.send(finished).await.is_err() {
            debug!("orchestrator gone before run completion was reported");
        }
    }
}

const HELP_TEXT: &str = "\u{2139}\u{fe0f} *How this works*\n\n\
Messages are collected for a few seconds and then sent to the agent together. \
Use the buttons under each notice to add more or cancel.\n\n\
*Commands*\n\
`/multi` toggle multi mode (queue messages until you press Start)\n\
`/stop` stop the agent and keep the session\n\
`/end` stop the agent and forget the session\n\
`/fast` `/balanced` `/deep` pick the capability tier\n\
`/status` show the relay state\n\
`/help` this message";

fn auto_control_message(header: &str, preview: &str, remaining_secs: u64) -> OutboundMessage {
    OutboundMessage::text(format!(
        "\u{2705} *{header}*\n\n{preview}\n\nSending to the agent in {remaining_secs}s, or choose an action:"
    ))
    .with_controls(vec![vec![
        Control::new("\u{2795} Add message", ControlAction::AddMore),
        Control::new("\u{1f6ab} Cancel", ControlAction::CancelAuto),
    ]])
}

fn status_line(batch: &Batch, resume: bool, origin: Origin) -> String {
    let files = batch.attachments().count();
    let session = if resume {
        "continuing session"
    } else {
        "new session"
    };
    let mut line = match (origin, &batch.mode) {
        (Origin::Answer, _) => format!("\u{23f3} Processing the answer ({session})\u{2026}"),
        (Origin::Batch, BatchMode::MediaGroup(_)) => {
            format!("\u{1f4ce} Processing album ({session})\u{2026}")
        }
        (Origin::Batch, _) => {
            let emoji = if files > 0 { "\u{1f4ce}" } else { "\u{1f4ac}" };
            format!(
                "{emoji} Processing {} message(s) ({session})\u{2026}",
                batch.len()
            )
        }
    };
    if files > 0 {
        line.push_str(&format!("\n\u{1f4ce} {files} file(s)"));
    }
    line
}

fn failure_notice(exit_code: Option<i32>, stderr: &str) -> String {
    const MAX: usize = 1500;
    let code = exit_code.map_or_else(|| "killed".to_owned(), |code| format!("exit code {code}"));
    let detail: String = stderr.chars().take(MAX).collect();
    if detail.trim().is_empty() {
        format!("\u{274c} *Agent run failed* ({code})")
    } else {
        format!("\u{274c} *Agent run failed* ({code})\n```{detail}```")
    }
}

fn question_rows(question: &PendingQuestion) -> Vec<Vec<Control>> {
    question
        .options
        .chunks(2)
        .enumerate()
        .map(|(row, options)| {
            options
                .iter()
                .enumerate()
                .map(|(col, option)| Control::new(option.clone(), ControlAction::Answer(row * 2 + col)))
                .collect()
        })
        .collect()
}

fn status_report(snapshot: &StatusSnapshot) -> String {
    let session = snapshot.session_id.as_deref().map_or_else(
        || "none".to_owned(),
        |id| format!("`{}\u{2026}`", id.chars().take(8).collect::<String>()),
    );
    format!(
        "\u{1f4ca} *Relay status*\n\
         \u{2022} Tier: {} (`{}`)\n\
         \u{2022} Session: {session}\n\
         \u{2022} Agent: {} ({} run(s) so far)\n\
         \u{2022} Multi mode: {}\n\
         \u{2022} Queued: {} \u{2022} Parked: {}\n\
         \u{2022} Open question: {}",
        snapshot.tier.label(),
        snapshot.model,
        snapshot.slot,
        snapshot.runs,
        if snapshot.multi_mode { "on" } else { "off" },
        snapshot.queued,
        snapshot.parked,
        if snapshot.question_open { "yes" } else { "no" },
    )
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{} h", secs / 3600)
    } else if secs >= 60 {
        format!("{} min", secs / 60)
    } else {
        format!("{secs} s")
    }
}
