use std::path::PathBuf;
use std::time::Duration;

use agent_relay::models::batch::BatchMode;
use agent_relay::models::event::{Attachment, AttachmentKind, ChatEvent};
use agent_relay::orchestrator::accumulator::{
    AccumulationWindow, MultiToggle, Offer, TimerEvent, TimerOutcome, TimerScope, TimerSignal,
    WindowSettings,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

const CHAT: &str = "C1";

fn window(countdown: bool) -> (AccumulationWindow, mpsc::UnboundedReceiver<TimerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let settings = WindowSettings {
        auto_debounce: Duration::from_secs(5),
        media_debounce: Duration::from_millis(500),
        countdown,
    };
    (AccumulationWindow::new(settings, tx), rx)
}

fn photo(name: &str) -> Attachment {
    Attachment {
        kind: AttachmentKind::Photo,
        name: name.into(),
        path: PathBuf::from("/tmp").join(name),
        size: None,
    }
}

fn texts(items: &[ChatEvent]) -> Vec<&str> {
    items.iter().filter_map(|item| item.text.as_deref()).collect()
}

/// Apply timer reports until one produces a batch or album.
async fn next_ready(
    window: &mut AccumulationWindow,
    rx: &mut mpsc::UnboundedReceiver<TimerEvent>,
) -> TimerOutcome {
    loop {
        let event = rx.recv().await.expect("timer channel open");
        match window.on_timer(&event) {
            TimerOutcome::Tick { .. } | TimerOutcome::Stale => {}
            other => return other,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn single_message_is_ready_after_debounce() {
    let (mut window, mut rx) = window(false);
    let started = Instant::now();
    assert_eq!(window.offer(ChatEvent::text(CHAT, "A")), Offer::Auto { count: 1 });

    let TimerOutcome::AutoReady(batch) = next_ready(&mut window, &mut rx).await else {
        panic!("expected an auto batch");
    };
    assert_eq!(texts(&batch.items), vec!["A"]);
    assert_eq!(batch.mode, BatchMode::Auto);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(window.auto_len(CHAT), 0);
}

#[tokio::test(start_paused = true)]
async fn every_message_restarts_the_debounce() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "A"));
    tokio::time::advance(Duration::from_secs(2)).await;
    let second = Instant::now();
    assert_eq!(window.offer(ChatEvent::text(CHAT, "B")), Offer::Auto { count: 2 });

    let TimerOutcome::AutoReady(batch) = next_ready(&mut window, &mut rx).await else {
        panic!("expected an auto batch");
    };
    assert_eq!(texts(&batch.items), vec!["A", "B"]);
    assert!(second.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn countdown_ticks_every_second() {
    let (mut window, mut rx) = window(true);
    window.offer(ChatEvent::text(CHAT, "A"));

    let mut ticks = Vec::new();
    loop {
        let event = rx.recv().await.expect("timer channel open");
        match window.on_timer(&event) {
            TimerOutcome::Tick { remaining_secs, .. } => ticks.push(remaining_secs),
            TimerOutcome::AutoReady(_) => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(ticks, vec![4, 3, 2, 1]);
}

#[tokio::test(start_paused = true)]
async fn add_more_waits_for_the_next_message() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "A"));
    assert!(window.add_more(CHAT));
    assert!(window.auto_paused(CHAT));

    let waited =
        tokio::time::timeout(Duration::from_secs(60), next_ready(&mut window, &mut rx)).await;
    assert!(waited.is_err(), "paused batch must not expire");
    assert_eq!(window.auto_len(CHAT), 1);

    window.offer(ChatEvent::text(CHAT, "B"));
    assert!(!window.auto_paused(CHAT));
    let TimerOutcome::AutoReady(batch) = next_ready(&mut window, &mut rx).await else {
        panic!("expected an auto batch");
    };
    assert_eq!(texts(&batch.items), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn add_more_without_batch_is_rejected() {
    let (mut window, _rx) = window(false);
    assert!(!window.add_more(CHAT));
}

#[tokio::test(start_paused = true)]
async fn cancel_auto_drops_batch_and_timer() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "A"));
    window.offer(ChatEvent::text(CHAT, "B"));
    assert_eq!(window.cancel_auto(CHAT), 2);

    let waited =
        tokio::time::timeout(Duration::from_secs(30), next_ready(&mut window, &mut rx)).await;
    assert!(waited.is_err());
    assert_eq!(window.cancel_auto(CHAT), 0);
}

#[tokio::test(start_paused = true)]
async fn multi_mode_collects_until_started() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "pending"));
    assert_eq!(
        window.toggle_multi(CHAT),
        MultiToggle::Enabled { discarded_auto: 1 }
    );
    assert!(window.is_multi(CHAT));

    assert_eq!(window.offer(ChatEvent::text(CHAT, "A")), Offer::Multi { count: 1 });
    assert_eq!(window.offer(ChatEvent::text(CHAT, "B")), Offer::Multi { count: 2 });
    let waited =
        tokio::time::timeout(Duration::from_secs(30), next_ready(&mut window, &mut rx)).await;
    assert!(waited.is_err(), "multi batches have no timer");

    let batch = window.start_multi(CHAT).expect("multi batch");
    assert_eq!(texts(&batch.items), vec!["A", "B"]);
    assert!(window.is_multi(CHAT), "multi mode stays on after start");
    assert!(window.start_multi(CHAT).is_none(), "nothing left to start");
}

#[tokio::test(start_paused = true)]
async fn restored_multi_batch_goes_first() {
    let (mut window, _rx) = window(false);
    window.toggle_multi(CHAT);
    window.offer(ChatEvent::text(CHAT, "A"));
    window.offer(ChatEvent::text(CHAT, "B"));
    let batch = window.start_multi(CHAT).expect("multi batch");

    window.offer(ChatEvent::text(CHAT, "C"));
    window.restore_multi(batch);
    let batch = window.start_multi(CHAT).expect("multi batch");
    assert_eq!(texts(&batch.items), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn disabling_multi_discards_its_batch() {
    let (mut window, _rx) = window(false);
    window.toggle_multi(CHAT);
    window.offer(ChatEvent::text(CHAT, "A"));
    assert_eq!(
        window.toggle_multi(CHAT),
        MultiToggle::Disabled { discarded: 1 }
    );
    assert!(!window.is_multi(CHAT));
    assert_eq!(window.offer(ChatEvent::text(CHAT, "B")), Offer::Auto { count: 1 });
}

#[tokio::test(start_paused = true)]
async fn cancel_multi_keeps_mode_on() {
    let (mut window, _rx) = window(false);
    window.toggle_multi(CHAT);
    window.offer(ChatEvent::text(CHAT, "A"));
    assert_eq!(window.cancel_multi(CHAT), 1);
    assert!(window.is_multi(CHAT));
    assert_eq!(window.multi_len(CHAT), 0);
}

#[tokio::test(start_paused = true)]
async fn album_is_parked_until_taken_once() {
    let (mut window, mut rx) = window(false);
    let first = ChatEvent::album_part(CHAT, "k1", photo("a.png"), Some("both".into()));
    let second = ChatEvent::album_part(CHAT, "k1", photo("b.png"), None);
    assert_eq!(
        window.offer(first),
        Offer::MediaGroup {
            key: "k1".into(),
            parts: 1
        }
    );
    window.offer(second);
    assert!(window.take_media("k1").is_none(), "album still buffering");

    assert_eq!(
        next_ready(&mut window, &mut rx).await,
        TimerOutcome::MediaReady("k1".into())
    );
    assert_eq!(window.ready_media(), vec!["k1".to_owned()]);

    let album = window.take_media("k1").expect("ready album");
    assert_eq!(album.len(), 2);
    assert_eq!(album.mode, BatchMode::MediaGroup("k1".into()));
    assert!(window.take_media("k1").is_none(), "album is taken once");
    assert_eq!(window.pending_media(), 0);
}

#[tokio::test(start_paused = true)]
async fn ready_albums_are_listed_oldest_first() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::album_part(CHAT, "old", photo("a.png"), None));
    tokio::time::advance(Duration::from_millis(100)).await;
    window.offer(ChatEvent::album_part(CHAT, "new", photo("b.png"), None));

    next_ready(&mut window, &mut rx).await;
    next_ready(&mut window, &mut rx).await;
    assert_eq!(window.ready_media(), vec!["old".to_owned(), "new".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn album_parts_bypass_multi_mode() {
    let (mut window, _rx) = window(false);
    window.toggle_multi(CHAT);
    let offer = window.offer(ChatEvent::album_part(CHAT, "k", photo("a.png"), None));
    assert!(matches!(offer, Offer::MediaGroup { .. }));
    assert_eq!(window.multi_len(CHAT), 0);
}

#[tokio::test(start_paused = true)]
async fn superseded_timers_are_stale() {
    let (mut window, _rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "A"));
    let stale = TimerEvent {
        scope: TimerScope::Auto(CHAT.into()),
        generation: 999,
        signal: TimerSignal::Expired,
    };
    assert_eq!(window.on_timer(&stale), TimerOutcome::Stale);

    let unknown = TimerEvent {
        scope: TimerScope::MediaGroup("missing".into()),
        generation: 1,
        signal: TimerSignal::Expired,
    };
    assert_eq!(window.on_timer(&unknown), TimerOutcome::Stale);
    assert_eq!(window.auto_len(CHAT), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_drops_everything() {
    let (mut window, mut rx) = window(false);
    window.offer(ChatEvent::text(CHAT, "A"));
    window.offer(ChatEvent::album_part("C2", "k", photo("a.png"), None));
    window.toggle_multi("C3");
    window.clear();

    assert_eq!(window.auto_len(CHAT), 0);
    assert_eq!(window.pending_media(), 0);
    assert!(!window.is_multi("C3"));
    let waited =
        tokio::time::timeout(Duration::from_secs(30), next_ready(&mut window, &mut rx)).await;
    assert!(waited.is_err());
}
