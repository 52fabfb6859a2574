//! Live subscription channels.
//!
//! `ChannelManager` owns one logical channel per scope. Each channel runs a
//! driver task that walks the connection state machine: `Connecting ->
//! Subscribed` on handshake success, `Subscribed -> Error` on transport
//! failure, `Error -> Connecting` on a scheduled retry, and `Closed` on
//! explicit unsubscribe. Retries follow `BackoffPolicy`; exhausting the
//! attempt budget parks the channel in the terminal `Failed` state until a
//! fresh offline-to-online edge or a new `subscribe` call restarts the cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{BackendError, SyncError};
use crate::network::NetworkMonitor;
use crate::protocol::{ChangeEvent, ChannelScope, PresenceRecord};
use crate::transport::{Backend, FeedItem};

pub mod backoff;

use backoff::BackoffPolicy;

const EVENT_BUFFER: usize = 256;
const FEED_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    Error,
    /// Reconnect attempts exhausted. Terminal until re-subscribed or until
    /// connectivity cycles.
    Failed,
    /// Explicitly unsubscribed. Terminal.
    Closed,
}

/// Notification observed on a channel's event stream.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Change(ChangeEvent),
    Presence(PresenceRecord),
    State(ChannelState),
    Error(SyncError),
}

struct ChannelInner {
    scope: ChannelScope,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    attempts: AtomicU32,
    last_error: Mutex<Option<BackendError>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ChannelInner {
    fn set_state(&self, next: ChannelState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let previous = self.state.send_replace(next);
        if previous != next {
            let _ = self.events.send(ChannelEvent::State(next));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    fn record_error(&self, err: BackendError) {
        *self.last_error.lock() = Some(err);
    }
}

/// Shared handle to one logical channel. Cloning does not open a second
/// transport subscription.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl ChannelHandle {
    pub fn scope(&self) -> &ChannelScope {
        &self.inner.scope
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions without consuming events.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// A fresh stream of channel notifications. Multiple consumers may each
    /// hold their own receiver.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<BackendError> {
        self.inner.last_error.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        self.state() == ChannelState::Subscribed
    }

    fn ptr_eq(a: &ChannelHandle, b: &ChannelHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
        self.inner.state.send_replace(ChannelState::Closed);
    }
}

/// Owns the scope-to-channel registry. One instance per session; drop (or
/// `unsubscribe_all`) on logout.
pub struct ChannelManager {
    backend: Arc<dyn Backend>,
    network: NetworkMonitor,
    backoff: BackoffPolicy,
    reconcile_feed: mpsc::Sender<ChangeEvent>,
    channels: Mutex<HashMap<ChannelScope, ChannelHandle>>,
}

impl ChannelManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        network: NetworkMonitor,
        config: &SyncConfig,
        reconcile_feed: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            backend,
            network,
            backoff: config.backoff(),
            reconcile_feed,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `scope`. Idempotent: re-subscribing a scope whose
    /// channel is still live returns the existing handle rather than opening
    /// a duplicate transport subscription. A channel parked in `Failed` (or
    /// already `Closed`) is replaced with a fresh one, restarting the retry
    /// cycle.
    pub fn subscribe(&self, scope: ChannelScope) -> ChannelHandle {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(&scope) {
            match existing.state() {
                ChannelState::Failed | ChannelState::Closed => {}
                _ => return existing.clone(),
            }
        }
        let handle = self.spawn_channel(scope.clone());
        channels.insert(scope, handle.clone());
        handle
    }

    /// Tear down the channel behind `handle`, cancelling any scheduled
    /// reconnection. No further events are observed once this returns.
    /// Calling it again is a no-op.
    pub fn unsubscribe(&self, handle: &ChannelHandle) {
        {
            let mut channels = self.channels.lock();
            if let Some(existing) = channels.get(handle.scope()) {
                if ChannelHandle::ptr_eq(existing, handle) {
                    channels.remove(handle.scope());
                }
            }
        }
        handle.close();
        debug!(scope = %handle.scope(), "channel unsubscribed");
    }

    /// Tear down every channel. Used on logout/session end.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<_> = self.channels.lock().drain().collect();
        for (_, handle) in drained {
            handle.close();
        }
    }

    pub fn active_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn handle(&self, scope: &ChannelScope) -> Option<ChannelHandle> {
        self.channels.lock().get(scope).cloned()
    }

    fn spawn_channel(&self, scope: ChannelScope) -> ChannelHandle {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let inner = Arc::new(ChannelInner {
            scope,
            state: state_tx,
            events: events_tx,
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
            driver: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let driver = tokio::spawn(drive(
            inner.clone(),
            self.backend.clone(),
            self.network.clone(),
            self.backoff,
            self.reconcile_feed.clone(),
        ));
        *inner.driver.lock() = Some(driver);

        ChannelHandle { inner }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Per-channel connection loop. Aborted wholesale on unsubscribe, which is
/// what cancels a pending retry timer.
async fn drive(
    inner: Arc<ChannelInner>,
    backend: Arc<dyn Backend>,
    network: NetworkMonitor,
    backoff: BackoffPolicy,
    reconcile_feed: mpsc::Sender<ChangeEvent>,
) {
    let mut net = network.watch();

    loop {
        // Offline suspends connection attempts entirely.
        while !*net.borrow() {
            if net.changed().await.is_err() {
                return;
            }
        }

        inner.set_state(ChannelState::Connecting);
        let (feed_tx, mut feed_rx) = mpsc::channel(FEED_BUFFER);

        match backend.open_subscription(&inner.scope, feed_tx).await {
            Ok(guard) => {
                inner.attempts.store(0, Ordering::SeqCst);
                inner.set_state(ChannelState::Subscribed);
                info!(scope = %inner.scope, "channel subscribed");

                let mut offline_teardown = false;
                loop {
                    tokio::select! {
                        item = feed_rx.recv() => match item {
                            Some(FeedItem::Change(event)) => {
                                let _ = reconcile_feed.send(event.clone()).await;
                                inner.emit(ChannelEvent::Change(event));
                            }
                            Some(FeedItem::Presence(record)) => {
                                inner.emit(ChannelEvent::Presence(record));
                            }
                            None => break,
                        },
                        changed = net.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !*net.borrow() {
                                offline_teardown = true;
                                break;
                            }
                        }
                    }
                }
                drop(guard);

                if offline_teardown {
                    // Not a failure: reconnect as soon as connectivity
                    // returns, without consuming the attempt budget.
                    debug!(scope = %inner.scope, "channel suspended while offline");
                    inner.set_state(ChannelState::Connecting);
                    continue;
                }

                inner.record_error(BackendError::Transport(
                    "subscription stream ended".into(),
                ));
                inner.set_state(ChannelState::Error);
            }
            Err(err) => {
                debug!(scope = %inner.scope, error = %err, "subscription handshake failed");
                inner.record_error(err);
                inner.set_state(ChannelState::Error);
            }
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match backoff.delay(attempt) {
            Some(delay) => {
                debug!(
                    scope = %inner.scope,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = net.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Offline pauses the retry (handled at the top of the
                        // loop); a fresh online signal retries immediately.
                    }
                }
            }
            None => {
                warn!(scope = %inner.scope, attempts = backoff.max_attempts(), "reconnect attempts exhausted");
                inner.emit(ChannelEvent::Error(SyncError::ChannelFailed {
                    attempts: backoff.max_attempts(),
                }));
                inner.set_state(ChannelState::Failed);

                // Park until connectivity cycles offline -> online, the one
                // signal that restarts a failed channel without an explicit
                // re-subscribe.
                let mut was_online = *net.borrow();
                loop {
                    if net.changed().await.is_err() {
                        return;
                    }
                    let now_online = *net.borrow();
                    if now_online && !was_online {
                        inner.attempts.store(0, Ordering::SeqCst);
                        break;
                    }
                    was_online = now_online;
                }
            }
        }
    }
}
