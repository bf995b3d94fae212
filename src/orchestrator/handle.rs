//! Cloneable front door to the orchestrator actor.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::models::control::ControlAction;
use crate::models::event::ChatEvent;
use crate::models::question::PendingQuestion;
use crate::models::tier::CapabilityTier;
use crate::orchestrator::spawner::InvocationReport;
use crate::{AppError, Result};

/// Where a chat stands in the submission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    /// Nothing pending.
    Idle,
    /// Events are being collected.
    Accumulating,
    /// A batch is being handed to the agent.
    Submitting,
    /// The agent is working on a batch.
    Running,
    /// An interrupt is in flight.
    Interrupting,
}

/// Point-in-time view of the relay, for `/status` and `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Tier used for the next invocation.
    pub tier: CapabilityTier,
    /// Model the tier maps to.
    pub model: String,
    /// Stored session id.
    pub session_id: Option<String>,
    /// Execution slot state name.
    pub slot: &'static str,
    /// Completed slot acquisitions.
    pub runs: u64,
    /// Phase of the requested chat.
    pub phase: ChatPhase,
    /// Whether multi mode is on for the requested chat.
    pub multi_mode: bool,
    /// Items waiting in the chat's Auto and Multi batches.
    pub queued: usize,
    /// Albums and answers waiting for the slot.
    pub parked: usize,
    /// Whether the agent is waiting on an answer.
    pub question_open: bool,
}

/// How an invocation task ended, as reported back to the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// The agent ran.
    Invocation(InvocationReport),
    /// The batch could not be turned into a payload.
    InputFailed(String),
}

/// Messages processed by the orchestrator actor.
#[derive(Debug)]
pub enum Input {
    /// Inbound chat event from the operator.
    Chat(ChatEvent),
    /// Button press or slash command.
    Control {
        /// Chat the control came from.
        chat_id: String,
        /// Requested action.
        action: ControlAction,
    },
    /// Agent message for the operator.
    Outbound {
        /// Message text.
        text: String,
        /// Delivery result.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Agent question for the operator; interrupts the run.
    Ask {
        /// Validated question.
        question: PendingQuestion,
        /// Delivery result.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Agent file for the operator.
    SendFile {
        /// Local file.
        path: PathBuf,
        /// Optional caption.
        caption: Option<String>,
        /// Upload result.
        reply: oneshot::Sender<Result<()>>,
    },
    /// State query.
    Status {
        /// Chat whose phase and batches to report.
        chat_id: Option<String>,
        /// Snapshot.
        reply: oneshot::Sender<StatusSnapshot>,
    },
    /// An invocation task finished and released the slot.
    RunFinished {
        /// Chat the batch came from.
        chat_id: String,
        /// Slot generation the run held.
        generation: u64,
        /// Final result.
        report: RunReport,
    },
}

/// Sender side of the orchestrator input channel.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Input>,
}

impl OrchestratorHandle {
    pub(crate) fn new(tx: mpsc::Sender<Input>) -> Self {
        Self { tx }
    }

    async fn send(&self, input: Input) -> Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| AppError::Closed("orchestrator is not running".into()))
    }

    async fn request<T>(&self, input: Input, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(input).await?;
        rx.await
            .map_err(|_| AppError::Closed("orchestrator dropped the request".into()))
    }

    /// Deliver an operator chat event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Closed` if the orchestrator has stopped.
    pub async fn chat_event(&self, event: ChatEvent) -> Result<()> {
        self.send(Input::Chat(event)).await
    }

    /// Deliver a button press or slash command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Closed` if the orchestrator has stopped.
    pub async fn control(&self, chat_id: impl Into<String>, action: ControlAction) -> Result<()> {
        self.send(Input::Control {
            chat_id: chat_id.into(),
            action,
        })
        .await
    }

    /// Post an agent message to the operator.
    ///
    /// # Errors
    ///
    /// Returns the chat platform error, or `AppError::Closed`.
    pub async fn send_outbound(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Input::Outbound {
                text: text.into(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Ask the operator a question and interrupt the running agent.
    ///
    /// # Errors
    ///
    /// Returns the chat platform error, or `AppError::Closed`.
    pub async fn ask(&self, question: PendingQuestion) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Input::Ask { question, reply }, rx).await?
    }

    /// Upload a local file to the operator.
    ///
    /// # Errors
    ///
    /// Returns the upload error, or `AppError::Closed`.
    pub async fn send_file(&self, path: PathBuf, caption: Option<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Input::SendFile {
                path,
                caption,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Snapshot of the relay state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Closed` if the orchestrator has stopped.
    pub async fn status(&self, chat_id: Option<String>) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.request(Input::Status { chat_id, reply }, rx).await
    }
}
