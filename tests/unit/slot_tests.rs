use std::sync::Arc;
use std::time::Duration;

use agent_relay::orchestrator::slot::{
    ExecutionSlot, InterruptOutcome, ProcessHandle, SlotState, StopSignal, Termination,
};
use tokio::sync::{mpsc, watch};

const GRACE: Duration = Duration::from_millis(200);

/// Fake supervisor that exits on the first signal it accepts.
///
/// `exit_on` picks which signal ends the process; `None` never exits.
fn fake_process(exit_on: Option<StopSignal>) -> (ProcessHandle, watch::Sender<bool>) {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(false);
    let handle = ProcessHandle::new(Some(4242), signal_tx, exit_rx);
    let exit = exit_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            match exit_on {
                Some(StopSignal::Force) if signal == StopSignal::Force => {
                    let _ = exit.send(true);
                }
                Some(StopSignal::Graceful) => {
                    let _ = exit.send(true);
                }
                _ => {}
            }
        }
        // Keep the watch sender alive so an unanswered kill stays unconfirmed.
        std::future::pending::<()>().await;
    });
    (handle, exit_tx)
}

#[test]
fn only_one_guard_at_a_time() {
    let slot = ExecutionSlot::new(GRACE);
    let guard = slot.try_acquire().expect("idle slot acquires");
    assert_eq!(slot.state(), SlotState::Running);
    assert!(slot.try_acquire().is_none(), "second acquire must fail");

    drop(guard);
    assert!(slot.is_idle());
    assert!(slot.try_acquire().is_some());
}

#[test]
fn release_happens_exactly_once_per_acquisition() {
    let slot = ExecutionSlot::new(GRACE);
    for _ in 0..3 {
        let guard = slot.try_acquire().expect("acquire");
        drop(guard);
    }
    assert_eq!(slot.releases(), 3);
}

#[test]
fn ended_session_belongs_to_one_acquisition() {
    let slot = ExecutionSlot::new(GRACE);
    assert!(!slot.end_session(), "nothing to end while idle");

    let first = slot.try_acquire().expect("acquire");
    assert!(!first.session_ended());
    assert!(slot.end_session());
    assert!(first.session_ended());
    let first_generation = first.generation();
    drop(first);

    let second = slot.try_acquire().expect("acquire again");
    assert!(second.generation() > first_generation);
    assert!(!second.session_ended(), "flag resets on the next acquisition");
}

#[test]
fn attach_and_detach_track_the_process() {
    let slot = ExecutionSlot::new(GRACE);
    let (signal_tx, _signal_rx) = mpsc::unbounded_channel();
    let (_exit_tx, exit_rx) = watch::channel(false);
    let handle = ProcessHandle::new(None, signal_tx, exit_rx);

    let guard = slot.try_acquire().expect("acquire");
    assert!(slot.attach(&guard, handle.clone()));
    assert!(slot.has_process());
    slot.detach(&guard);
    assert!(!slot.has_process());
    drop(guard);
    assert!(!slot.has_process());
}

#[tokio::test]
async fn interrupt_on_idle_slot_is_noop() {
    let slot = ExecutionSlot::new(GRACE);
    assert_eq!(slot.interrupt().await, InterruptOutcome::NoOp);
    assert!(slot.is_idle());
}

#[tokio::test]
async fn interrupt_before_attach_abandons_launch() {
    let slot = ExecutionSlot::new(GRACE);
    let guard = slot.try_acquire().expect("acquire");

    assert_eq!(slot.interrupt().await, InterruptOutcome::Interrupted);
    assert!(guard.is_stopping());
    assert_eq!(slot.state(), SlotState::Stopping);

    let (handle, _exit) = fake_process(Some(StopSignal::Graceful));
    assert!(
        !slot.attach(&guard, handle),
        "attach after an interrupt must be refused"
    );
    drop(guard);
    assert!(slot.is_idle());
}

#[tokio::test]
async fn interrupt_stops_attached_process_gracefully() {
    let slot = ExecutionSlot::new(GRACE);
    let guard = slot.try_acquire().expect("acquire");
    let (handle, _exit) = fake_process(Some(StopSignal::Graceful));
    assert!(slot.attach(&guard, handle.clone()));

    assert_eq!(slot.interrupt().await, InterruptOutcome::Interrupted);
    assert!(handle.was_interrupted());
    assert!(handle.has_exited());
    assert_eq!(slot.state(), SlotState::Stopping, "release belongs to the guard");

    drop(guard);
    assert!(slot.is_idle());
    assert_eq!(slot.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn stubborn_process_is_force_killed() {
    let (handle, _exit) = fake_process(Some(StopSignal::Force));
    assert_eq!(handle.terminate(GRACE).await, Termination::Forced);
}

#[tokio::test(start_paused = true)]
async fn unkillable_process_is_unconfirmed() {
    let (handle, _exit) = fake_process(None);
    assert_eq!(handle.terminate(GRACE).await, Termination::Unconfirmed);
}

#[tokio::test]
async fn exited_process_needs_no_signal() {
    let (handle, exit) = fake_process(None);
    exit.send(true).expect("send exit");
    assert_eq!(handle.terminate(GRACE).await, Termination::AlreadyExited);
}

#[tokio::test]
async fn interrupt_racing_natural_completion_releases_once() {
    let slot = ExecutionSlot::new(GRACE);
    let guard = slot.try_acquire().expect("acquire");
    let (handle, exit) = fake_process(None);
    assert!(slot.attach(&guard, handle));

    // The process finishes on its own while the interrupt is in flight.
    exit.send(true).expect("send exit");
    let interrupter = {
        let slot = Arc::clone(&slot);
        tokio::spawn(async move { slot.interrupt().await })
    };
    drop(guard);
    let outcome = interrupter.await.expect("interrupt task");

    assert!(matches!(
        outcome,
        InterruptOutcome::Interrupted | InterruptOutcome::NoOp
    ));
    assert!(slot.is_idle());
    assert_eq!(slot.releases(), 1);
    assert!(slot.try_acquire().is_some());
}
