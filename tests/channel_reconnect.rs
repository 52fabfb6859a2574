//! Channel lifecycle: backoff retries, attempt exhaustion, idempotent
//! subscribe, cancellation, and connectivity awareness.

mod common;

use std::sync::Arc;
use std::time::Duration;

use driftline::model::EntityKind;
use driftline::protocol::ChannelScope;
use driftline::transport::mock::MockBackend;
use driftline::{ChannelEvent, ChannelState, NetworkMonitor, SyncConfig, SyncEngine, SyncError};

use common::{init_tracing, wait_until};

fn fast_config() -> SyncConfig {
    SyncConfig {
        base_reconnect_delay: Duration::from_millis(100),
        max_reconnect_delay: Duration::from_secs(2),
        max_reconnect_attempts: 5,
        ..SyncConfig::default()
    }
}

async fn wait_for_state(handle: &driftline::ChannelHandle, want: ChannelState) {
    let mut rx = handle.watch_state();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        if *rx.borrow() == want {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for channel state {want:?}");
        }
        if rx.changed().await.is_err() {
            panic!("state channel dropped before reaching {want:?}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn retries_with_backoff_until_subscribed() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::new(EntityKind::Message);
    backend.fail_next_subscribes(&scope, 3);

    let engine = SyncEngine::new(backend.clone(), NetworkMonitor::online(), fast_config());
    let handle = engine.subscribe(scope.clone());

    wait_for_state(&handle, ChannelState::Subscribed).await;
    // Counter resets to zero on the successful transition.
    assert_eq!(handle.reconnect_attempts(), 0);
    assert_eq!(backend.subscriber_count(&scope), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_park_the_channel_failed() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::new(EntityKind::Alert);
    // Initial connect plus two retries, exactly the budget below.
    backend.fail_next_subscribes(&scope, 3);

    let config = SyncConfig {
        max_reconnect_attempts: 2,
        ..fast_config()
    };
    let network = NetworkMonitor::online();
    let engine = SyncEngine::new(backend.clone(), network.clone(), config);
    let handle = engine.subscribe(scope.clone());
    let mut events = handle.events();

    wait_for_state(&handle, ChannelState::Failed).await;
    assert!(handle.last_error().is_some());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let ChannelEvent::Error(SyncError::ChannelFailed { attempts }) = event {
            assert_eq!(attempts, 2);
            saw_failure = true;
        }
    }
    assert!(saw_failure, "terminal failure must surface to subscribers");

    // A connectivity cycle is the implicit re-subscribe: the channel gets a
    // fresh attempt budget and comes up.
    network.set_online(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    network.set_online(true);
    wait_for_state(&handle, ChannelState::Subscribed).await;
    assert_eq!(handle.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_a_scope_does_not_duplicate_transport() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::filtered(EntityKind::Message, "T1");

    let engine = SyncEngine::new(backend.clone(), NetworkMonitor::online(), fast_config());
    let first = engine.subscribe(scope.clone());
    let second = engine.subscribe(scope.clone());

    wait_for_state(&first, ChannelState::Subscribed).await;
    assert!(second.is_live());
    assert_eq!(engine.channels().active_count(), 1);
    assert_eq!(backend.subscriber_count(&scope), 1);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_a_pending_retry() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::new(EntityKind::Document);
    backend.fail_next_subscribes(&scope, 1);

    let engine = SyncEngine::new(backend.clone(), NetworkMonitor::online(), fast_config());
    let handle = engine.subscribe(scope.clone());
    let mut events = handle.events();

    wait_for_state(&handle, ChannelState::Error).await;

    // A retry timer is now scheduled; tearing down must cancel it.
    engine.unsubscribe(&handle);
    assert_eq!(handle.state(), ChannelState::Closed);

    // Give a cancelled retry every chance to fire.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(backend.subscriber_count(&scope), 0);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ChannelEvent::State(ChannelState::Subscribed)),
            "no callback may fire after unsubscribe returns"
        );
    }

    // Repeat calls are no-ops.
    engine.unsubscribe(&handle);
    assert_eq!(handle.state(), ChannelState::Closed);
}

#[tokio::test(start_paused = true)]
async fn offline_suspends_retries_and_online_reconnects() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::new(EntityKind::Message);
    let network = NetworkMonitor::online();

    let engine = SyncEngine::new(backend.clone(), network.clone(), fast_config());
    let handle = engine.subscribe(scope.clone());
    wait_for_state(&handle, ChannelState::Subscribed).await;

    network.set_online(false);
    wait_until("transport teardown while offline", || {
        backend.subscriber_count(&scope) == 0
    })
    .await;
    assert_ne!(handle.state(), ChannelState::Subscribed);

    // No reconnection attempts accumulate while offline.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.subscriber_count(&scope), 0);

    network.set_online(true);
    wait_for_state(&handle, ChannelState::Subscribed).await;
    assert_eq!(handle.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_drop_mid_subscription_triggers_reconnect() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let scope = ChannelScope::new(EntityKind::Message);

    let engine = SyncEngine::new(backend.clone(), NetworkMonitor::online(), fast_config());
    let handle = engine.subscribe(scope.clone());
    wait_for_state(&handle, ChannelState::Subscribed).await;

    backend.drop_feeds(&scope);
    wait_until("channel re-subscribed after transport drop", || {
        backend.subscriber_count(&scope) == 1
    })
    .await;
    wait_for_state(&handle, ChannelState::Subscribed).await;
    assert_eq!(handle.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_all_closes_every_channel() {
    init_tracing();
    let backend = Arc::new(MockBackend::new());
    let engine = SyncEngine::new(backend.clone(), NetworkMonitor::online(), fast_config());

    let messages = engine.subscribe(ChannelScope::new(EntityKind::Message));
    let alerts = engine.subscribe(ChannelScope::new(EntityKind::Alert));
    wait_for_state(&messages, ChannelState::Subscribed).await;
    wait_for_state(&alerts, ChannelState::Subscribed).await;

    engine.unsubscribe_all();
    assert_eq!(messages.state(), ChannelState::Closed);
    assert_eq!(alerts.state(), ChannelState::Closed);
    assert_eq!(engine.channels().active_count(), 0);
}
