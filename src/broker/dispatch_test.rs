//! Dispatcher tests: routing rules, session stamping, replay ordering,
//! deferred-queue drainage and write-failure cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::broker::{build, Broker, BrokerState, ClientHandle};
use crate::constants::CLUSTER_KIND;
use crate::logs::LogSessionOptions;
use crate::message::{ClusterEvent, Frame, Message};
use crate::test_support::{platform_event, FakePlatform};

fn event(cluster: &str, seq: usize) -> ClusterEvent {
    ClusterEvent {
        cluster_name: cluster.to_string(),
        name: format!("ev-{seq}"),
        message: format!("message {seq}"),
        kind: "Pod".to_string(),
        object_name: format!("{cluster}-{seq:04}"),
    }
}

fn test_broker() -> (Broker, Arc<BrokerState>, Arc<FakePlatform>) {
    let platform = Arc::new(FakePlatform::new());
    let (broker, state) = build(platform.clone(), "observed".to_string());
    (broker, state, platform)
}

/// Registers a client and configures its session synchronously, without
/// spawning replay tasks.
fn connected_client(
    state: &Arc<BrokerState>,
    session_id: &str,
    clusters: &[&str],
) -> (Arc<ClientHandle>, mpsc::Receiver<Frame>) {
    let (handle, outbound_rx, _close_rx) = state.register_client();
    {
        let mut st = handle.state();
        st.event_session_id = session_id.to_string();
        st.watch_set = clusters.iter().map(|c| c.to_string()).collect();
    }
    (handle, outbound_rx)
}

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound queue closed")
}

#[tokio::test]
async fn snapshot_frames_reach_every_client() {
    let (broker, state, _platform) = test_broker();
    let (_a, mut rx_a) = connected_client(&state, "sa", &[]);
    let (_b, mut rx_b) = connected_client(&state, "sb", &[]);

    broker.dispatch(Message::ClustersList {
        clusters: vec!["alpha".to_string()],
    });

    for rx in [&mut rx_a, &mut rx_b] {
        match recv_frame(rx).await {
            Frame::Clusters { clusters } => assert_eq!(clusters, vec!["alpha"]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn live_event_is_cached_and_stamped_per_client() {
    let (broker, state, _platform) = test_broker();
    // Cache entry as left behind by the cluster's watcher startup
    state.cache().seed("alpha", Vec::new());
    let (_a, mut rx_a) = connected_client(&state, "session-a", &["alpha"]);
    let (_b, mut rx_b) = connected_client(&state, "session-b", &["alpha"]);
    let (_c, mut rx_c) = connected_client(&state, "session-c", &["beta"]);

    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });

    match recv_frame(&mut rx_a).await {
        Frame::Event { session_id, .. } => assert_eq!(session_id, "session-a"),
        other => panic!("unexpected frame: {other:?}"),
    }
    match recv_frame(&mut rx_b).await {
        Frame::Event { session_id, .. } => assert_eq!(session_id, "session-b"),
        other => panic!("unexpected frame: {other:?}"),
    }
    // Client c does not watch alpha
    assert!(timeout(Duration::from_millis(50), rx_c.recv()).await.is_err());

    // The event also landed in the cache, for later replays
    assert_eq!(state.cache().len("alpha"), 1);
}

#[tokio::test]
async fn live_event_during_replay_is_deferred_not_written() {
    let (broker, state, _platform) = test_broker();
    let (handle, mut rx) = connected_client(&state, "s1", &["alpha"]);
    handle.state().replaying = true;

    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });

    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    assert!(state.is_pending(handle.id()));
    assert_eq!(handle.state().deferred.len(), 1);
}

#[tokio::test]
async fn drain_skips_clients_still_replaying() {
    let (broker, state, _platform) = test_broker();
    let (handle, mut rx) = connected_client(&state, "s1", &["alpha"]);
    handle.state().replaying = true;

    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });
    broker.drain_pending();

    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    assert!(state.is_pending(handle.id()));
}

#[tokio::test]
async fn cached_then_deferred_then_live_ordering() {
    let (broker, state, _platform) = test_broker();
    let (handle, mut rx) = connected_client(&state, "s1", &["alpha"]);

    // Replay in flight: live events defer, cached events pass through
    handle.state().replaying = true;
    broker.dispatch(Message::Event {
        event: event("alpha", 10),
    });
    broker.dispatch(Message::Event {
        event: event("alpha", 11),
    });
    broker.dispatch(Message::CachedEvent {
        event: event("alpha", 0),
        session_id: "s1".to_string(),
    });

    // Replay done: the next iteration drains, then handles live traffic
    handle.state().replaying = false;
    broker.drain_pending();
    broker.dispatch(Message::Event {
        event: event("alpha", 12),
    });

    let mut names = Vec::new();
    for _ in 0..4 {
        match recv_frame(&mut rx).await {
            Frame::CachedEvent { event, .. } | Frame::Event { event, .. } => {
                names.push(event.name)
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(names, vec!["ev-0", "ev-10", "ev-11", "ev-12"]);
    assert!(!state.is_pending(handle.id()));
}

#[tokio::test]
async fn cached_event_requires_matching_session_and_watch_set() {
    let (broker, state, _platform) = test_broker();
    let (_watching, mut rx_watching) = connected_client(&state, "s1", &["alpha"]);
    let (_stale, mut rx_stale) = connected_client(&state, "s2", &["alpha"]);
    let (_other, mut rx_other) = connected_client(&state, "s1", &["beta"]);

    broker.dispatch(Message::CachedEvent {
        event: event("alpha", 0),
        session_id: "s1".to_string(),
    });

    match recv_frame(&mut rx_watching).await {
        Frame::CachedEvent { session_id, .. } => assert_eq!(session_id, "s1"),
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(timeout(Duration::from_millis(50), rx_stale.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(50), rx_other.recv()).await.is_err());
}

#[tokio::test]
async fn log_lines_route_by_log_session_id() {
    let (broker, state, _platform) = test_broker();
    let (listening, mut rx_listening) = connected_client(&state, "", &[]);
    listening.state().log_session_id = "L1".to_string();
    let (_silent, mut rx_silent) = connected_client(&state, "", &[]);

    broker.dispatch(Message::Log {
        session_id: "L1".to_string(),
        line: "a log line\n".to_string(),
    });

    match recv_frame(&mut rx_listening).await {
        Frame::Log { session_id, message } => {
            assert_eq!(session_id, "L1");
            assert_eq!(message, "a log line\n");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert!(timeout(Duration::from_millis(50), rx_silent.recv()).await.is_err());
}

#[tokio::test]
async fn write_failure_removes_client_everywhere() {
    let (broker, state, _platform) = test_broker();
    let (handle, rx) = connected_client(&state, "s1", &["alpha"]);
    state.pool().start_for("alpha").await;
    assert!(state.pool().has_watcher("alpha"));

    // Connection task gone: every write fails
    drop(rx);
    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });

    assert_eq!(state.client_count(), 0);
    assert!(!state.is_pending(handle.id()));
    // Last subscriber left, so reconciliation stopped the watcher
    assert!(!state.pool().has_watcher("alpha"));
}

#[tokio::test]
async fn failed_drain_terminates_client_without_remaining_messages() {
    let (broker, state, _platform) = test_broker();
    let (handle, rx) = connected_client(&state, "s1", &["alpha"]);
    handle.state().replaying = true;

    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });
    broker.dispatch(Message::Event {
        event: event("alpha", 1),
    });

    handle.state().replaying = false;
    drop(rx);
    broker.drain_pending();

    assert_eq!(state.client_count(), 0);
}

#[tokio::test]
async fn remove_client_cancels_its_log_task() {
    let (_broker, state, _platform) = test_broker();
    let (handle, _rx, _close_rx) = state.register_client();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    {
        let mut st = handle.state();
        st.log_session_id = "L1".to_string();
        st.log_shutdown = Some(shutdown_tx);
    }

    state.remove_client(handle.id());

    // Dropping the sender wakes the log task with a closed-channel error
    assert!(shutdown_rx.changed().await.is_err());
}

#[tokio::test]
async fn in_flight_event_after_reconcile_leaves_no_orphan_cache() {
    let platform = Arc::new(FakePlatform::new());
    let (broker, state) = build(platform.clone(), "observed".to_string());
    let (handle, _rx, _close_rx) = state.register_client();

    state
        .subscribe_events(&handle, "s1".to_string(), vec!["alpha".to_string()])
        .await;
    assert!(state.cache().contains("alpha"));

    // Last subscriber leaves; reconciliation frees watcher and cache while
    // an event for alpha is still on its way to the dispatcher
    state
        .subscribe_events(&handle, "s2".to_string(), Vec::new())
        .await;
    broker.dispatch(Message::Event {
        event: event("alpha", 0),
    });

    assert!(!state.cache().contains("alpha"));
}

#[tokio::test]
async fn at_most_one_log_session_per_client() {
    let (_broker, state, _platform) = test_broker();
    let (handle, _rx, _close_rx) = state.register_client();

    state.start_log_session(&handle, "L1".to_string(), LogSessionOptions::default());
    assert_eq!(handle.state().log_session_id, "L1");
    assert!(handle.state().log_shutdown.is_some());

    // A second request replaces the first task outright
    state.start_log_session(&handle, "L2".to_string(), LogSessionOptions::default());
    assert_eq!(handle.state().log_session_id, "L2");
    assert!(handle.state().log_shutdown.is_some());

    state.stop_log_session(&handle);
    assert!(handle.state().log_session_id.is_empty());
    assert!(handle.state().log_shutdown.is_none());
}

#[tokio::test]
async fn first_subscriber_triggers_watcher_and_replay() {
    let platform = Arc::new(FakePlatform::new());
    platform.set_initial_events(vec![platform_event(CLUSTER_KIND, "alpha", "observed")]);
    let (broker, state) = build(platform.clone(), "observed".to_string());

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(broker.run(shutdown_rx));

    let (handle, mut rx, _close_rx) = state.register_client();
    state
        .subscribe_events(&handle, "s1".to_string(), vec!["alpha".to_string()])
        .await;

    assert!(state.pool().has_watcher("alpha"));
    match recv_frame(&mut rx).await {
        Frame::CachedEvent { event, session_id } => {
            assert_eq!(session_id, "s1");
            assert_eq!(event.cluster_name, "alpha");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // A live event published after the replay arrives as a live frame
    platform
        .emit_event(platform_event(CLUSTER_KIND, "alpha", "observed"))
        .await;
    match recv_frame(&mut rx).await {
        Frame::Event { session_id, .. } => assert_eq!(session_id, "s1"),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn unsubscribing_releases_the_watcher_and_cache() {
    let platform = Arc::new(FakePlatform::new());
    let (broker, state) = build(platform.clone(), "observed".to_string());
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(broker.run(shutdown_rx));

    let (handle, _rx, _close_rx) = state.register_client();
    state
        .subscribe_events(&handle, "s1".to_string(), vec!["alpha".to_string()])
        .await;
    assert!(state.pool().has_watcher("alpha"));
    assert!(state.cache().contains("alpha"));

    state
        .subscribe_events(&handle, "s2".to_string(), Vec::new())
        .await;

    assert!(!state.pool().has_watcher("alpha"));
    assert!(!state.cache().contains("alpha"));
}

#[tokio::test]
async fn resubscribe_mid_replay_drops_stale_session_messages() {
    let platform = Arc::new(FakePlatform::new());
    // A sizeable initial list so the first replay has real work
    platform.set_initial_events(
        (0..20)
            .map(|seq| crate::platform::PlatformEvent {
                name: format!("ev-{seq}"),
                message: format!("message {seq}"),
                involved_kind: CLUSTER_KIND.to_string(),
                involved_name: "gamma".to_string(),
                involved_namespace: "observed".to_string(),
            })
            .collect(),
    );
    let (broker, state) = build(platform.clone(), "observed".to_string());
    let (handle, mut rx, _close_rx) = state.register_client();

    // Two subscriptions back to back; replay tasks for both sessions race,
    // but only "b"-stamped messages may reach the client.
    state
        .subscribe_events(&handle, "a".to_string(), vec!["gamma".to_string()])
        .await;
    state
        .subscribe_events(&handle, "b".to_string(), vec!["gamma".to_string()])
        .await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(broker.run(shutdown_rx));

    let mut received = 0;
    while received < 20 {
        match recv_frame(&mut rx).await {
            Frame::CachedEvent { session_id, .. } => {
                assert_eq!(session_id, "b", "stale session id leaked to client");
                received += 1;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
