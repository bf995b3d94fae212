//! Single-flight execution slot guarding the agent process.
//!
//! Exactly one [`ExecutionSlot`] exists per relay. It is acquired before
//! an invocation starts and released when the returned [`SlotGuard`] is
//! dropped, so every exit path (success, failure, interruption, panic)
//! frees it exactly once.
//!
//! State and the attached [`ProcessHandle`] change together under a
//! synchronous mutex that is never held across an `.await`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Lifecycle state of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing running; the slot can be acquired.
    Idle,
    /// An invocation owns the slot.
    Running,
    /// The running invocation is being interrupted.
    Stopping,
}

impl SlotState {
    /// Lower-case name for status reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Result of [`ExecutionSlot::interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// A running process was signalled.
    Interrupted,
    /// Nothing was running.
    NoOp,
}

/// Stop request delivered to the task supervising a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to exit (`SIGTERM`).
    Graceful,
    /// Kill the process (`SIGKILL`).
    Force,
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited.
    AlreadyExited,
    /// The process exited after the graceful signal.
    Graceful,
    /// The process exited after the forced signal.
    Forced,
    /// No exit was observed within the bounded wait.
    Unconfirmed,
}

struct HandleInner {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<StopSignal>,
    exited: watch::Receiver<bool>,
    interrupted: AtomicBool,
}

/// Cloneable reference to a running agent process.
///
/// The supervising task owns the child; this handle only sends stop
/// signals and observes exit.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("interrupted", &self.was_interrupted())
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessHandle {
    /// Build a handle from the supervisor's signal sender and exit flag.
    #[must_use]
    pub fn new(
        pid: Option<u32>,
        signals: mpsc::UnboundedSender<StopSignal>,
        exited: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                signals,
                exited,
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// OS process id, when known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Whether an operator interrupt targeted this process.
    #[must_use]
    pub fn was_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Whether the process has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        *self.inner.exited.borrow()
    }

    fn mark_interrupted(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for exit. A dropped supervisor counts as exited.
    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.inner.exited.clone();
        let done = tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok();
        done
    }

    /// Graceful signal, wait `grace`, forced signal, wait `grace` again.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        if self.has_exited() {
            return Termination::AlreadyExited;
        }
        if self.inner.signals.send(StopSignal::Graceful).is_err() {
            debug!(pid = ?self.pid(), "supervisor gone before graceful stop");
        }
        if self.wait_exit(grace).await {
            return Termination::Graceful;
        }

        warn!(pid = ?self.pid(), "agent did not exit within grace period, forcing kill");
        if self.inner.signals.send(StopSignal::Force).is_err() {
            debug!(pid = ?self.pid(), "supervisor gone before forced stop");
        }
        if self.wait_exit(grace).await {
            Termination::Forced
        } else {
            warn!(pid = ?self.pid(), "agent exit not confirmed after forced kill");
            Termination::Unconfirmed
        }
    }
}

struct SlotInner {
    state: SlotState,
    process: Option<ProcessHandle>,
    generation: u64,
    releases: u64,
    session_ended: bool,
}

/// The single-flight guard around agent execution.
pub struct ExecutionSlot {
    inner: Mutex<SlotInner>,
    grace: Duration,
}

impl ExecutionSlot {
    /// Create an idle slot. `grace` bounds each termination wait.
    #[must_use]
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Idle,
                process: None,
                generation: 0,
                releases: 0,
                session_ended: false,
            }),
            grace,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bound on each termination wait.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Claim the slot if it is idle.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut inner = self.lock();
        if inner.state != SlotState::Idle {
            return None;
        }
        inner.state = SlotState::Running;
        inner.generation += 1;
        inner.session_ended = false;
        let generation = inner.generation;
        drop(inner);

        debug!(generation, "execution slot acquired");
        Some(SlotGuard {
            slot: Arc::clone(self),
            generation,
        })
    }

    /// Record the process started under `guard`.
    ///
    /// Returns `false` when the slot is no longer running for this
    /// acquisition (an interrupt already arrived); the caller must stop the
    /// process itself.
    pub fn attach(&self, guard: &SlotGuard, handle: ProcessHandle) -> bool {
        let mut inner = self.lock();
        if inner.generation != guard.generation || inner.state != SlotState::Running {
            return false;
        }
        inner.process = Some(handle);
        true
    }

    /// Drop the handle recorded under `guard` once its process has exited.
    pub fn detach(&self, guard: &SlotGuard) {
        let mut inner = self.lock();
        if inner.generation == guard.generation {
            inner.process = None;
        }
    }

    /// Stop the running process, if any.
    ///
    /// An interrupt that lands before the process is attached still moves
    /// the slot to stopping so the launch is abandoned. Takes at most twice
    /// the grace period. The slot itself is released
    /// by the owning invocation, not here.
    pub async fn interrupt(&self) -> InterruptOutcome {
        let handle = {
            let mut inner = self.lock();
            if inner.state != SlotState::Running {
                return InterruptOutcome::NoOp;
            }
            inner.state = SlotState::Stopping;
            let Some(handle) = inner.process.take() else {
                info!("interrupt arrived before the agent started");
                return InterruptOutcome::Interrupted;
            };
            handle.mark_interrupted();
            handle
        };

        info!(pid = ?handle.pid(), "interrupting agent process");
        let termination = handle.terminate(self.grace).await;
        info!(pid = ?handle.pid(), ?termination, "agent interrupt finished");
        InterruptOutcome::Interrupted
    }

    /// Mark the current acquisition's session as ended by the operator.
    ///
    /// The owning invocation must not persist a session id once this is
    /// set. Returns `false` when the slot is idle.
    pub fn end_session(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == SlotState::Idle {
            return false;
        }
        inner.session_ended = true;
        true
    }

    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state == SlotState::Idle {
            return;
        }
        inner.state = SlotState::Idle;
        inner.process = None;
        inner.releases += 1;
        debug!(generation, "execution slot released");
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.lock().state
    }

    /// Whether the slot is idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state() == SlotState::Idle
    }

    /// Whether a process handle is attached.
    #[must_use]
    pub fn has_process(&self) -> bool {
        self.lock().process.is_some()
    }

    /// Number of completed acquisitions.
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.lock().releases
    }
}

/// Scoped ownership of the [`ExecutionSlot`]; releases it on drop.
pub struct SlotGuard {
    slot: Arc<ExecutionSlot>,
    generation: u64,
}

impl SlotGuard {
    /// Slot this guard belongs to.
    #[must_use]
    pub fn slot(&self) -> &Arc<ExecutionSlot> {
        &self.slot
    }

    /// Acquisition number.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the operator ended the session during this acquisition.
    #[must_use]
    pub fn session_ended(&self) -> bool {
        let inner = self.slot.lock();
        inner.generation == self.generation && inner.session_ended
    }

    /// Whether the slot has moved to [`SlotState::Stopping`] for this guard.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        let inner = self.slot.lock();
        inner.generation == self.generation && inner.state == SlotState::Stopping
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.release(self.generation);
    }
}
