//! Inactivity watchdog for the active agent session.
//!
//! A polling task compares the time since the last recorded activity with a
//! list of thresholds. Each threshold fires at most once per quiet period;
//! any recorded activity re-arms all of them. Nothing is evaluated while no
//! session is stored.
//!
//! Events are delivered via a `tokio::sync::mpsc` channel so the
//! orchestrator can post the prompt.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::persistence::session_store::SessionStore;

/// Events emitted by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// The session has been quiet past `threshold`.
    Idle {
        /// Threshold that was crossed.
        threshold: Duration,
        /// Actual quiet time when the check ran.
        idle: Duration,
    },
}

struct ActivityState {
    last: Instant,
    fired: Vec<bool>,
}

/// Last-activity timestamp plus one-shot flags per threshold.
pub struct ActivityClock {
    inner: Mutex<ActivityState>,
}

impl ActivityClock {
    /// Start the clock now with `thresholds` unfired flags.
    #[must_use]
    pub fn new(thresholds: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ActivityState {
                last: Instant::now(),
                fired: vec![false; thresholds],
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record activity: reset the timestamp and re-arm every threshold.
    pub fn record(&self) {
        let mut state = self.lock();
        state.last = Instant::now();
        state.fired.iter_mut().for_each(|fired| *fired = false);
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.lock().last.elapsed()
    }

    fn is_fired(&self, index: usize) -> bool {
        self.lock().fired.get(index).copied().unwrap_or(true)
    }

    fn mark_fired(&self, index: usize) {
        if let Some(fired) = self.lock().fired.get_mut(index) {
            *fired = true;
        }
    }
}

/// Builder for the watchdog task.
///
/// Call [`spawn`](Self::spawn) to start polling.
pub struct Watchdog {
    clock: Arc<ActivityClock>,
    store: SessionStore,
    thresholds: Vec<Duration>,
    poll_interval: Duration,
    event_tx: mpsc::Sender<WatchdogEvent>,
    cancel: CancellationToken,
}

impl Watchdog {
    /// Construct a watchdog (does not start polling yet).
    #[must_use]
    pub fn new(
        clock: Arc<ActivityClock>,
        store: SessionStore,
        thresholds: Vec<Duration>,
        poll_interval: Duration,
        event_tx: mpsc::Sender<WatchdogEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            clock,
            store,
            thresholds,
            poll_interval,
            event_tx,
            cancel,
        }
    }

    /// Spawn the polling task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(info_span!("watchdog")))
    }

    async fn run(self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("watchdog cancelled");
                    return;
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
            self.check().await;
        }
    }

    /// Run one evaluation pass and return how many events were delivered.
    pub async fn check(&self) -> usize {
        if self.store.read().is_none() {
            return 0;
        }
        let idle = self.clock.idle();
        let mut delivered = 0;
        for (index, &threshold) in self.thresholds.iter().enumerate() {
            if idle < threshold || self.clock.is_fired(index) {
                continue;
            }
            info!(idle_secs = idle.as_secs(), threshold_secs = threshold.as_secs(), "session idle");
            if self
                .event_tx
                .send(WatchdogEvent::Idle { threshold, idle })
                .await
                .is_ok()
            {
                self.clock.mark_fired(index);
                delivered += 1;
            }
        }
        delivered
    }
}
