use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TryRecvError;
use tungstenite::protocol::Message as WsMessage;

use super::{Hub, HubConfig, TopicPoller};
use crate::client::{OUTBOUND_CAPACITY, Subscriber, Username};
use crate::source::{Track, TrackSource};
use crate::test_support::{ScriptedSource, eventually, parse_track, recv_within, track, user};
use crate::utils::error::{HubError, SourceError};

fn hub_with(source: Arc<ScriptedSource>, max_pollers: usize, poll_ms: u64) -> Hub {
    Hub::new(
        source,
        HubConfig {
            max_pollers,
            poll_interval: Duration::from_millis(poll_ms),
        },
    )
}

// Long enough that only the immediate first poll happens during a test.
const NO_TICK: u64 = 3_600_000;

#[test]
fn test_hub_config_defaults() {
    let config = HubConfig::default();
    assert_eq!(config.max_pollers, 1000);
    assert_eq!(config.poll_interval, Duration::from_secs(5));
}

#[tokio::test]
async fn test_first_subscriber_gets_immediate_poll() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (sub, mut rx) = Subscriber::channel(user("grant"));

    hub.subscribe(sub).unwrap();
    assert!(hub.contains(&user("grant")));

    let msg = recv_within(&mut rx, 1000).await.expect("first message");
    assert_eq!(parse_track(&msg), track("Grant", "Wishes", true));
    assert_eq!(source.calls_for("grant"), 1);
}

#[tokio::test]
async fn test_shared_key_polls_once() {
    let source =
        ScriptedSource::with_delay(Some(track("Grant", "Wishes", true)), Duration::from_millis(100));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (a, mut rx_a) = Subscriber::channel(user("grant"));
    let (b, mut rx_b) = Subscriber::channel(user("grant"));

    hub.subscribe(a).unwrap();
    hub.subscribe(b).unwrap();

    let msg_a = recv_within(&mut rx_a, 1000).await.expect("a receives");
    let msg_b = recv_within(&mut rx_b, 1000).await.expect("b receives");
    assert_eq!(msg_a, msg_b);
    assert_eq!(source.calls(), 1);
    assert_eq!(hub.topic_count(), 1);
    assert_eq!(hub.subscriber_count(&user("grant")), 2);
}

#[tokio::test]
async fn test_usernames_are_case_insensitive_topics() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (a, _rx_a) = Subscriber::channel(user("Alice"));
    let (b, _rx_b) = Subscriber::channel(user("alice"));

    hub.subscribe(a).unwrap();
    hub.subscribe(b).unwrap();

    assert_eq!(hub.topic_count(), 1);
    assert_eq!(hub.subscriber_count(&user("ALICE")), 2);
}

#[tokio::test]
async fn test_late_joiner_gets_cached_track_immediately() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (first, mut rx_first) = Subscriber::channel(user("grant"));
    hub.subscribe(first).unwrap();
    let original = recv_within(&mut rx_first, 1000).await.unwrap();

    let (late, mut rx_late) = Subscriber::channel(user("grant"));
    hub.subscribe(late).unwrap();

    // Replay happens inside subscribe, no poll needed.
    assert_eq!(rx_late.try_recv().unwrap(), original);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_unchanged_track_is_broadcast_once() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();

    assert!(recv_within(&mut rx, 1000).await.is_some());
    assert!(eventually(2000, || source.calls() >= 5).await);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_now_playing_flip_is_a_change() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();
    let first = parse_track(&recv_within(&mut rx, 1000).await.unwrap());
    assert!(first.is_now_playing);

    source.set_track(Some(track("Grant", "Wishes", false)));
    let second = parse_track(&recv_within(&mut rx, 1000).await.unwrap());
    assert_eq!(second.track, "Wishes");
    assert!(!second.is_now_playing);
    assert_eq!(second.date_uts, 1_700_000_000);
}

#[tokio::test]
async fn test_changes_arrive_in_poll_order() {
    let source = ScriptedSource::new(Some(track("A", "one", true)));
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();

    assert_eq!(parse_track(&recv_within(&mut rx, 1000).await.unwrap()).track, "one");
    source.set_track(Some(track("A", "two", true)));
    assert_eq!(parse_track(&recv_within(&mut rx, 1000).await.unwrap()).track, "two");
    source.set_track(Some(track("A", "three", true)));
    assert_eq!(parse_track(&recv_within(&mut rx, 1000).await.unwrap()).track, "three");
}

#[tokio::test]
async fn test_blank_track_is_still_broadcast_first_time() {
    let source = ScriptedSource::new(Some(Track::default()));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();

    let msg = recv_within(&mut rx, 1000).await.expect("blank track delivered");
    assert_eq!(parse_track(&msg), Track::default());
}

#[tokio::test]
async fn test_no_data_means_no_broadcast() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();

    assert!(eventually(1000, || source.calls() >= 3).await);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    assert!(hub.poller(&user("grant")).unwrap().last_payload().is_none());
}

#[tokio::test]
async fn test_upstream_errors_do_not_stop_poller() {
    let source = ScriptedSource::new(None);
    source.fail();
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();

    assert!(eventually(1000, || source.calls() >= 3).await);
    assert!(hub.contains(&user("grant")));
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    source.set_track(Some(track("Grant", "Wishes", true)));
    let msg = recv_within(&mut rx, 1000).await.expect("recovers after errors");
    assert_eq!(parse_track(&msg).artist, "Grant");
}

#[tokio::test]
async fn test_errors_keep_last_known_track() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    hub.subscribe(sub).unwrap();
    let original = recv_within(&mut rx, 1000).await.unwrap();

    source.fail();
    let calls = source.calls();
    assert!(eventually(1000, || source.calls() >= calls + 3).await);

    let (late, mut rx_late) = Subscriber::channel(user("grant"));
    hub.subscribe(late).unwrap();
    assert_eq!(rx_late.try_recv().unwrap(), original);
}

#[tokio::test]
async fn test_capacity_limit_rejects_new_usernames() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 1, NO_TICK);
    let (a, _rx_a) = Subscriber::channel(user("alice"));
    let a_id = a.id.clone();
    hub.subscribe(a).unwrap();

    let (b, mut rx_b) = Subscriber::channel(user("bob"));
    assert_eq!(hub.subscribe(b), Err(HubError::CapacityExceeded { limit: 1 }));
    assert!(!hub.contains(&user("bob")));
    assert_eq!(hub.topic_count(), 1);
    // Rejected subscriber's queue is closed, nothing was sent.
    assert_eq!(rx_b.recv().await, None);

    // Joining an existing username is not limited.
    let (a2, _rx_a2) = Subscriber::channel(user("alice"));
    hub.subscribe(a2).unwrap();
    assert_eq!(hub.subscriber_count(&user("alice")), 2);

    assert!(hub.unsubscribe(&user("alice"), &a_id));
    assert!(hub.contains(&user("alice")));
}

#[tokio::test]
async fn test_capacity_frees_when_topic_empties() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 1, NO_TICK);
    let (a, _rx_a) = Subscriber::channel(user("alice"));
    let a_id = a.id.clone();
    hub.subscribe(a).unwrap();

    let (b, _rx_b) = Subscriber::channel(user("bob"));
    assert!(hub.subscribe(b).is_err());

    assert!(hub.unsubscribe(&user("alice"), &a_id));
    let (b, _rx_b) = Subscriber::channel(user("bob"));
    hub.subscribe(b).unwrap();
    assert!(hub.contains(&user("bob")));
    assert!(!hub.contains(&user("alice")));
}

#[tokio::test]
async fn test_last_unsubscribe_removes_topic_and_closes_queue() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    let id = sub.id.clone();
    hub.subscribe(sub).unwrap();
    assert!(recv_within(&mut rx, 1000).await.is_some());
    let poller = hub.poller(&user("grant")).unwrap();

    assert!(hub.unsubscribe(&user("grant"), &id));
    assert!(!hub.contains(&user("grant")));
    assert_eq!(hub.topic_count(), 0);
    assert!(poller.is_stopped());
    assert_eq!(rx.recv().await, None);

    // Second unsubscribe is a no-op.
    assert!(!hub.unsubscribe(&user("grant"), &id));
}

#[tokio::test]
async fn test_unsubscribe_keeps_topic_while_others_remain() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (a, mut rx_a) = Subscriber::channel(user("grant"));
    let (b, _rx_b) = Subscriber::channel(user("grant"));
    let a_id = a.id.clone();
    hub.subscribe(a).unwrap();
    hub.subscribe(b).unwrap();

    assert!(hub.unsubscribe(&user("grant"), &a_id));
    assert!(hub.contains(&user("grant")));
    assert_eq!(hub.subscriber_count(&user("grant")), 1);
    assert!(!hub.poller(&user("grant")).unwrap().is_stopped());
    // The departed subscriber's queue is closed regardless.
    assert_eq!(rx_a.recv().await, None);
}

#[tokio::test]
async fn test_resubscribe_starts_fresh_poll() {
    let source = ScriptedSource::new(Some(track("Grant", "Wishes", true)));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (sub, mut rx) = Subscriber::channel(user("grant"));
    let id = sub.id.clone();
    hub.subscribe(sub).unwrap();
    assert!(recv_within(&mut rx, 1000).await.is_some());
    hub.unsubscribe(&user("grant"), &id);

    let (again, mut rx_again) = Subscriber::channel(user("grant"));
    hub.subscribe(again).unwrap();
    let msg = recv_within(&mut rx_again, 1000).await.expect("fresh poll");
    assert_eq!(parse_track(&msg).track, "Wishes");
    assert_eq!(source.calls_for("grant"), 2);
}

#[tokio::test]
async fn test_poller_stops_polling_after_teardown() {
    let source = ScriptedSource::new(None);
    let hub = hub_with(source.clone(), 10, 10);
    let (sub, _rx) = Subscriber::channel(user("grant"));
    let id = sub.id.clone();
    hub.subscribe(sub).unwrap();
    assert!(eventually(1000, || source.calls() >= 2).await);

    hub.unsubscribe(&user("grant"), &id);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let settled = source.calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.calls(), settled);
}

#[tokio::test]
async fn test_in_flight_result_discarded_after_cancel() {
    let source =
        ScriptedSource::with_delay(Some(track("Grant", "Wishes", true)), Duration::from_millis(100));
    let hub = hub_with(source.clone(), 10, NO_TICK);
    let (sub, _rx) = Subscriber::channel(user("grant"));
    let id = sub.id.clone();
    hub.subscribe(sub).unwrap();
    let poller = hub.poller(&user("grant")).unwrap();

    assert!(eventually(1000, || source.calls() == 1).await);
    hub.unsubscribe(&user("grant"), &id);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(poller.last_payload().is_none());
}

#[tokio::test]
async fn test_single_flight_per_username() {
    let source =
        ScriptedSource::with_delay(Some(track("Grant", "Wishes", true)), Duration::from_millis(30));
    let hub = hub_with(source.clone(), 10, 5);
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (sub, rx) = Subscriber::channel(user("grant"));
        hub.subscribe(sub).unwrap();
        receivers.push(rx);
    }
    let (other, _rx_other) = Subscriber::channel(user("other"));
    hub.subscribe(other).unwrap();

    assert!(eventually(2000, || source.calls_for("grant") >= 4).await);
    assert_eq!(source.max_in_flight(), 1);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_others() {
    let poller = TopicPoller::new(user("grant"));
    let (slow, _slow_rx) = Subscriber::channel(user("grant"));
    poller.add_subscriber(slow);

    let mut fast = Vec::new();
    for _ in 0..3 {
        let (sub, rx) = Subscriber::channel(user("grant"));
        poller.add_subscriber(sub);
        fast.push(rx);
    }

    let total = OUTBOUND_CAPACITY * 3;
    for i in 0..total {
        let queued = poller.broadcast(WsMessage::text(format!("msg-{i}")));
        let expected = if i < OUTBOUND_CAPACITY { 4 } else { 3 };
        assert_eq!(queued, expected, "broadcast {i}");

        for rx in fast.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), WsMessage::text(format!("msg-{i}")));
        }
    }
    assert_eq!(
        poller.last_payload(),
        Some(WsMessage::text(format!("msg-{}", total - 1)))
    );
}

#[tokio::test]
async fn test_broadcast_skips_closed_queues() {
    let poller = TopicPoller::new(user("grant"));
    let (gone, gone_rx) = Subscriber::channel(user("grant"));
    let (live, mut live_rx) = Subscriber::channel(user("grant"));
    poller.add_subscriber(gone);
    poller.add_subscriber(live);
    drop(gone_rx);

    assert_eq!(poller.broadcast(WsMessage::text("hello")), 1);
    assert_eq!(live_rx.recv().await.unwrap(), WsMessage::text("hello"));
}

/// Panics on its first fetch, then behaves.
#[derive(Debug, Default)]
struct PanicOnceSource {
    calls: AtomicUsize,
}

#[async_trait]
impl TrackSource for PanicOnceSource {
    async fn latest_track(&self, _username: &Username) -> Result<Option<Track>, SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("source blew up");
        }
        Ok(Some(track("Grant", "Wishes", true)))
    }
}

#[tokio::test]
async fn test_panicked_poller_drops_subscribers_and_is_replaced() {
    let source = Arc::new(PanicOnceSource::default());
    let hub = Hub::new(
        source.clone(),
        HubConfig {
            max_pollers: 1,
            poll_interval: Duration::from_millis(NO_TICK),
        },
    );
    let (first, mut first_rx) = Subscriber::channel(user("grant"));
    hub.subscribe(first).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(1), first_rx.recv())
        .await
        .expect("queue should close after the poller dies");
    assert_eq!(closed, None);
    let dead = hub.poller(&user("grant")).expect("entry stays until unsubscribe");
    assert!(dead.is_stopped());
    assert_eq!(dead.subscriber_count(), 0);

    // Replacing a dead poller does not count against capacity.
    let (second, mut second_rx) = Subscriber::channel(user("grant"));
    hub.subscribe(second).unwrap();
    let msg = recv_within(&mut second_rx, 1000).await.expect("fresh poller delivers");
    assert_eq!(parse_track(&msg), track("Grant", "Wishes", true));
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(hub.topic_count(), 1);
}
