use std::time::Duration;

use agent_relay::orchestrator::watchdog::{ActivityClock, Watchdog, WatchdogEvent};
use agent_relay::persistence::session_store::SessionStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const THIRTY_MIN: Duration = Duration::from_secs(1800);
const EIGHT_HOURS: Duration = Duration::from_secs(28800);

struct Fixture {
    _temp: tempfile::TempDir,
    store: SessionStore,
    clock: std::sync::Arc<ActivityClock>,
    watchdog: Watchdog,
    events: mpsc::Receiver<WatchdogEvent>,
}

fn fixture(with_session: bool) -> Fixture {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(temp.path().join("session.txt"));
    if with_session {
        store.write("sess-1").expect("seed session");
    }
    let clock = ActivityClock::new(2);
    let (tx, events) = mpsc::channel(8);
    let watchdog = Watchdog::new(
        clock.clone(),
        store.clone(),
        vec![THIRTY_MIN, EIGHT_HOURS],
        Duration::from_secs(300),
        tx,
        CancellationToken::new(),
    );
    Fixture {
        _temp: temp,
        store,
        clock,
        watchdog,
        events,
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_fires_before_first_threshold() {
    let mut fx = fixture(true);
    tokio::time::advance(THIRTY_MIN - Duration::from_secs(1)).await;
    assert_eq!(fx.watchdog.check().await, 0);
    assert!(fx.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn threshold_fires_once_per_quiet_period() {
    let mut fx = fixture(true);
    tokio::time::advance(THIRTY_MIN + Duration::from_secs(5)).await;

    assert_eq!(fx.watchdog.check().await, 1);
    let WatchdogEvent::Idle { threshold, idle } = fx.events.recv().await.expect("event");
    assert_eq!(threshold, THIRTY_MIN);
    assert!(idle >= THIRTY_MIN);

    assert_eq!(fx.watchdog.check().await, 0, "already fired");

    tokio::time::advance(EIGHT_HOURS).await;
    assert_eq!(fx.watchdog.check().await, 1, "second threshold fires");
    let WatchdogEvent::Idle { threshold, .. } = fx.events.recv().await.expect("event");
    assert_eq!(threshold, EIGHT_HOURS);
}

#[tokio::test(start_paused = true)]
async fn activity_rearms_thresholds() {
    let fx = fixture(true);
    tokio::time::advance(THIRTY_MIN).await;
    assert_eq!(fx.watchdog.check().await, 1);

    fx.clock.record();
    assert!(fx.clock.idle() < Duration::from_secs(1));
    assert_eq!(fx.watchdog.check().await, 0);

    tokio::time::advance(THIRTY_MIN).await;
    assert_eq!(fx.watchdog.check().await, 1);
}

#[tokio::test(start_paused = true)]
async fn no_session_means_no_prompt() {
    let fx = fixture(false);
    tokio::time::advance(EIGHT_HOURS * 2).await;
    assert_eq!(fx.watchdog.check().await, 0);

    fx.store.write("sess-2").expect("write session");
    assert_eq!(fx.watchdog.check().await, 2);
}

#[tokio::test(start_paused = true)]
async fn spawned_watchdog_polls_and_stops_on_cancel() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(temp.path().join("session.txt"));
    store.write("sess-1").expect("seed session");
    let clock = ActivityClock::new(1);
    let (tx, mut events) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = Watchdog::new(
        clock,
        store,
        vec![Duration::from_secs(60)],
        Duration::from_secs(30),
        tx,
        cancel.clone(),
    )
    .spawn();

    let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("watchdog fires")
        .expect("channel open");
    assert!(matches!(event, WatchdogEvent::Idle { threshold, .. } if threshold == Duration::from_secs(60)));

    cancel.cancel();
    task.await.expect("watchdog task exits");
}
