//! Accumulation window: turns a stream of chat events into ready batches.
//!
//! Three policies share the window:
//!
//! - **Auto** (default): every event restarts a debounce timer; when it
//!   lapses the batch is ready. `add_more` pauses the timer until the next
//!   event arrives.
//! - **Multi**: events pile up with no timer until the operator starts or
//!   cancels the batch. Turning it on discards a live Auto batch.
//! - **Media group**: album parts sharing a group key restart a short
//!   debounce. A ready album stays parked until the orchestrator takes it.
//!
//! The window owns no chat-platform state. Timers run as small tasks that
//! report back through an unbounded channel; every report carries the
//! generation it was started under so cancelled or superseded timers have
//! no effect.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::batch::{Batch, BatchMode};
use crate::models::event::ChatEvent;

/// What a timer belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerScope {
    /// Auto batch of a chat.
    Auto(String),
    /// Album with this group key.
    MediaGroup(String),
}

/// Timer report kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    /// Whole seconds left before expiry (Auto countdown only).
    Tick {
        /// Seconds remaining.
        remaining_secs: u64,
    },
    /// The debounce window lapsed.
    Expired,
}

/// Message a timer sends back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    /// Owner of the timer.
    pub scope: TimerScope,
    /// Generation the timer was started under.
    pub generation: u64,
    /// Tick or expiry.
    pub signal: TimerSignal,
}

/// How an event was absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Added to the chat's Auto batch; the countdown restarted.
    Auto {
        /// Items now in the batch.
        count: usize,
    },
    /// Added to the chat's Multi batch.
    Multi {
        /// Items now in the batch.
        count: usize,
    },
    /// Added to an album.
    MediaGroup {
        /// Album key.
        key: String,
        /// Parts collected so far.
        parts: usize,
    },
}

/// Effect of a timer report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Countdown progress for a live Auto batch.
    Tick {
        /// Chat the batch belongs to.
        chat_id: String,
        /// Seconds remaining.
        remaining_secs: u64,
    },
    /// An Auto batch is ready and has been removed from the window.
    AutoReady(Batch),
    /// An album is ready and parked until taken.
    MediaReady(String),
    /// The timer was cancelled or superseded.
    Stale,
}

/// Result of flipping multi mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiToggle {
    /// Multi mode is now on.
    Enabled {
        /// Items dropped from a live Auto batch.
        discarded_auto: usize,
    },
    /// Multi mode is now off.
    Disabled {
        /// Items dropped from the Multi batch.
        discarded: usize,
    },
}

/// Debounce settings.
#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    /// Auto quiet period.
    pub auto_debounce: Duration,
    /// Album quiet period.
    pub media_debounce: Duration,
    /// Emit per-second ticks for Auto timers.
    pub countdown: bool,
}

struct AutoState {
    batch: Batch,
    generation: u64,
    timer: Option<CancellationToken>,
}

struct MediaState {
    batch: Batch,
    generation: u64,
    timer: Option<CancellationToken>,
    ready: bool,
    order: u64,
}

/// Holds every batch that has not been submitted yet.
pub struct AccumulationWindow {
    settings: WindowSettings,
    timers: mpsc::UnboundedSender<TimerEvent>,
    auto: HashMap<String, AutoState>,
    multi: HashMap<String, Batch>,
    media: HashMap<String, MediaState>,
    next_generation: u64,
    next_order: u64,
}

impl AccumulationWindow {
    /// Create an empty window reporting timers on `timers`.
    #[must_use]
    pub fn new(settings: WindowSettings, timers: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            settings,
            timers,
            auto: HashMap::new(),
            multi: HashMap::new(),
            media: HashMap::new(),
            next_generation: 0,
            next_order: 0,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Absorb an event under the policy [`BatchMode::select`] picks.
    pub fn offer(&mut self, event: ChatEvent) -> Offer {
        let chat_id = event.chat_id.clone();
        match BatchMode::select(&event, self.is_multi(&chat_id)) {
            BatchMode::MediaGroup(key) => self.offer_media(key, event),
            BatchMode::Multi => {
                let batch = self
                    .multi
                    .entry(chat_id)
                    .or_insert_with_key(|chat| Batch::new(BatchMode::Multi, chat.clone()));
                batch.push(event);
                Offer::Multi { count: batch.len() }
            }
            BatchMode::Auto => self.offer_auto(chat_id, event),
        }
    }

    fn offer_auto(&mut self, chat_id: String, event: ChatEvent) -> Offer {
        let generation = self.bump();
        let token = spawn_timer(
            self.timers.clone(),
            TimerScope::Auto(chat_id.clone()),
            generation,
            self.settings.auto_debounce,
            self.settings.countdown,
        );
        let state = self.auto.entry(chat_id).or_insert_with_key(|chat| AutoState {
            batch: Batch::new(BatchMode::Auto, chat.clone()),
            generation,
            timer: None,
        });
        if let Some(previous) = state.timer.replace(token) {
            previous.cancel();
        }
        state.generation = generation;
        state.batch.push(event);
        Offer::Auto {
            count: state.batch.len(),
        }
    }

    fn offer_media(&mut self, key: String, event: ChatEvent) -> Offer {
        let generation = self.bump();
        let token = spawn_timer(
            self.timers.clone(),
            TimerScope::MediaGroup(key.clone()),
            generation,
            self.settings.media_debounce,
            false,
        );
        let order = self.next_order;
        let state = self.media.entry(key.clone()).or_insert_with(|| MediaState {
            batch: Batch::new(BatchMode::MediaGroup(key.clone()), event.chat_id.clone()),
            generation,
            timer: None,
            ready: false,
            order,
        });
        if state.order == order {
            self.next_order += 1;
        }
        if let Some(previous) = state.timer.replace(token) {
            previous.cancel();
        }
        state.generation = generation;
        state.ready = false;
        state.batch.push(event);
        let parts = state.batch.len();
        debug!(group_key = key, parts, "album part buffered");
        Offer::MediaGroup { key, parts }
    }

    /// Stop the Auto countdown and wait for the next event with no timeout.
    ///
    /// Returns `false` when the chat has no live Auto batch.
    pub fn add_more(&mut self, chat_id: &str) -> bool {
        let generation = self.bump();
        let Some(state) = self.auto.get_mut(chat_id) else {
            return false;
        };
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.generation = generation;
        true
    }

    /// Discard the chat's Auto batch. Returns the number of dropped items.
    pub fn cancel_auto(&mut self, chat_id: &str) -> usize {
        self.auto.remove(chat_id).map_or(0, |state| {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
            state.batch.len()
        })
    }

    /// Whether multi mode is on for the chat.
    #[must_use]
    pub fn is_multi(&self, chat_id: &str) -> bool {
        self.multi.contains_key(chat_id)
    }

    /// Flip multi mode.
    pub fn toggle_multi(&mut self, chat_id: &str) -> MultiToggle {
        if let Some(batch) = self.multi.remove(chat_id) {
            info!(chat_id, discarded = batch.len(), "multi mode disabled");
            return MultiToggle::Disabled {
                discarded: batch.len(),
            };
        }
        let discarded_auto = self.cancel_auto(chat_id);
        self.multi
            .insert(chat_id.to_owned(), Batch::new(BatchMode::Multi, chat_id));
        info!(chat_id, discarded_auto, "multi mode enabled");
        MultiToggle::Enabled { discarded_auto }
    }

    /// Take the Multi batch for submission. Multi mode stays on.
    ///
    /// Returns `None` when multi mode is off or nothing was collected.
    pub fn start_multi(&mut self, chat_id: &str) -> Option<Batch> {
        let batch = self.multi.get_mut(chat_id)?;
        if batch.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            batch,
            Batch::new(BatchMode::Multi, chat_id),
        ))
    }

    /// Put a Multi batch back in front of anything collected since.
    pub fn restore_multi(&mut self, mut batch: Batch) {
        let chat_id = batch.chat_id.clone();
        let current = self
            .multi
            .entry(chat_id)
            .or_insert_with_key(|chat| Batch::new(BatchMode::Multi, chat.clone()));
        batch.items.append(&mut current.items);
        current.items = batch.items;
    }

    /// Discard the Multi batch, keeping multi mode on.
    pub fn cancel_multi(&mut self, chat_id: &str) -> usize {
        self.multi.get_mut(chat_id).map_or(0, |batch| {
            let count = batch.len();
            batch.items.clear();
            count
        })
    }

    /// Items in the chat's Auto batch.
    #[must_use]
    pub fn auto_len(&self, chat_id: &str) -> usize {
        self.auto.get(chat_id).map_or(0, |state| state.batch.len())
    }

    /// Items in the chat's Multi batch.
    #[must_use]
    pub fn multi_len(&self, chat_id: &str) -> usize {
        self.multi.get(chat_id).map_or(0, Batch::len)
    }

    /// Whether the chat's Auto batch is waiting on `add_more`.
    #[must_use]
    pub fn auto_paused(&self, chat_id: &str) -> bool {
        self.auto
            .get(chat_id)
            .is_some_and(|state| state.timer.is_none())
    }

    /// Apply a timer report.
    pub fn on_timer(&mut self, event: &TimerEvent) -> TimerOutcome {
        match (&event.scope, event.signal) {
            (TimerScope::Auto(chat_id), signal) => {
                let live = self.auto.get(chat_id).is_some_and(|state| {
                    state.generation == event.generation && state.timer.is_some()
                });
                if !live {
                    return TimerOutcome::Stale;
                }
                match signal {
                    TimerSignal::Tick { remaining_secs } => TimerOutcome::Tick {
                        chat_id: chat_id.clone(),
                        remaining_secs,
                    },
                    TimerSignal::Expired => self
                        .auto
                        .remove(chat_id)
                        .map_or(TimerOutcome::Stale, |state| {
                            TimerOutcome::AutoReady(state.batch)
                        }),
                }
            }
            (TimerScope::MediaGroup(key), TimerSignal::Expired) => {
                match self.media.get_mut(key) {
                    Some(state) if state.generation == event.generation => {
                        state.timer = None;
                        state.ready = true;
                        TimerOutcome::MediaReady(key.clone())
                    }
                    _ => TimerOutcome::Stale,
                }
            }
            (TimerScope::MediaGroup(_), TimerSignal::Tick { .. }) => TimerOutcome::Stale,
        }
    }

    /// Remove a ready album for submission.
    pub fn take_media(&mut self, key: &str) -> Option<Batch> {
        if !self.media.get(key).is_some_and(|state| state.ready) {
            return None;
        }
        self.media.remove(key).map(|state| state.batch)
    }

    /// Keys of ready albums, oldest first.
    #[must_use]
    pub fn ready_media(&self) -> Vec<String> {
        let mut ready: Vec<(u64, &String)> = self
            .media
            .iter()
            .filter(|(_, state)| state.ready)
            .map(|(key, state)| (state.order, key))
            .collect();
        ready.sort_unstable();
        ready.into_iter().map(|(_, key)| key.clone()).collect()
    }

    /// Number of albums still buffering or parked.
    #[must_use]
    pub fn pending_media(&self) -> usize {
        self.media.len()
    }

    /// Cancel every timer and drop every batch.
    pub fn clear(&mut self) {
        for state in self.auto.values() {
            if let Some(timer) = &state.timer {
                timer.cancel();
            }
        }
        for state in self.media.values() {
            if let Some(timer) = &state.timer {
                timer.cancel();
            }
        }
        self.auto.clear();
        self.multi.clear();
        self.media.clear();
    }
}

impl Drop for AccumulationWindow {
    fn drop(&mut self) {
        self.clear();
    }
}

fn spawn_timer(
    tx: mpsc::UnboundedSender<TimerEvent>,
    scope: TimerScope,
    generation: u64,
    duration: Duration,
    countdown: bool,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let steps = if countdown {
            duration.as_secs().max(1)
        } else {
            1
        };
        let step = duration / u32::try_from(steps).unwrap_or(u32::MAX);
        for elapsed in 1..=steps {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(step) => {}
            }
            let remaining_secs = steps - elapsed;
            if remaining_secs > 0 {
                let tick = TimerEvent {
                    scope: scope.clone(),
                    generation,
                    signal: TimerSignal::Tick { remaining_secs },
                };
                if tx.send(tick).is_err() {
                    return;
                }
            }
        }
        if !cancel.is_cancelled() {
            let _ = tx.send(TimerEvent {
                scope,
                generation,
                signal: TimerSignal::Expired,
            });
        }
    });
    token
}
