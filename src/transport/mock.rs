//! Scriptable in-memory backend for tests.
//!
//! Holds an authoritative record map, assigns server ids, echoes committed
//! mutations back to subscribers as change events, and can be scripted to
//! fail subscription handshakes, reject mutations, or stall applies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::error::BackendError;
use crate::model::{Record, RecordId};
use crate::protocol::{
    ChangeEvent, ChangeOp, ChannelScope, MutationAck, MutationRequest, PresenceRecord,
};

use super::{Backend, FeedItem, SubscriptionGuard};

#[derive(Default)]
struct MockState {
    records: Mutex<HashMap<String, Record>>,
    feeds: Mutex<HashMap<ChannelScope, Vec<(u64, mpsc::Sender<FeedItem>)>>>,
    fail_subscribes: Mutex<HashMap<ChannelScope, u32>>,
    reject_reasons: Mutex<VecDeque<String>>,
    applied: Mutex<Vec<MutationRequest>>,
    apply_gate: Mutex<Option<Arc<Notify>>>,
    next_timestamp: Mutex<Option<DateTime<Utc>>>,
    fail_presence: AtomicBool,
    next_server_id: AtomicU64,
    next_feed_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` subscription handshakes for `scope`.
    pub fn fail_next_subscribes(&self, scope: &ChannelScope, count: u32) {
        self.state
            .fail_subscribes
            .lock()
            .insert(scope.clone(), count);
    }

    /// Reject the next apply with `reason` instead of committing it.
    pub fn reject_next_apply(&self, reason: impl Into<String>) {
        self.state.reject_reasons.lock().push_back(reason.into());
    }

    /// Stall every apply until the returned gate is notified (one permit per
    /// apply).
    pub fn hold_applies(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.state.apply_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn release_applies(&self) {
        *self.state.apply_gate.lock() = None;
    }

    /// Pin the commit timestamp used for the next acks and echoes.
    pub fn pin_timestamp(&self, timestamp: DateTime<Utc>) {
        *self.state.next_timestamp.lock() = Some(timestamp);
    }

    pub fn fail_presence(&self, fail: bool) {
        self.state.fail_presence.store(fail, Ordering::SeqCst);
    }

    /// Requests committed so far, in receipt order.
    pub fn applied_requests(&self) -> Vec<MutationRequest> {
        self.state.applied.lock().clone()
    }

    pub fn record(&self, id: &str) -> Option<Record> {
        self.state.records.lock().get(id).cloned()
    }

    /// Drop every live feed for `scope`, simulating a transport failure.
    pub fn drop_feeds(&self, scope: &ChannelScope) {
        self.state.feeds.lock().remove(scope);
    }

    pub fn subscriber_count(&self, scope: &ChannelScope) -> usize {
        self.state
            .feeds
            .lock()
            .get(scope)
            .map(|feeds| feeds.len())
            .unwrap_or(0)
    }

    /// Emit a server-originated change event at the current commit timestamp.
    pub fn emit(&self, op: ChangeOp, record: Record) {
        self.emit_at(op, record, self.timestamp());
    }

    /// Emit a server-originated change event with an explicit timestamp.
    pub fn emit_at(&self, op: ChangeOp, record: Record, timestamp: DateTime<Utc>) {
        {
            let mut records = self.state.records.lock();
            let key = record.id().to_string();
            match op {
                ChangeOp::Insert | ChangeOp::Update => {
                    records.insert(key, record.clone());
                }
                ChangeOp::Delete => {
                    records.remove(&key);
                }
            }
        }
        self.broadcast(&record, FeedItem::Change(ChangeEvent::new(op, record.clone(), timestamp)));
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.state.next_timestamp.lock().take().unwrap_or_else(Utc::now)
    }

    fn assign_server_id(&self) -> String {
        let n = self.state.next_server_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("srv-{n}")
    }

    fn scope_matches(scope: &ChannelScope, record: &Record) -> bool {
        if scope.entity != record.kind() {
            return false;
        }
        match (&scope.filter, record) {
            (None, _) => true,
            (Some(filter), Record::Message(message)) => message.thread_id == *filter,
            (Some(filter), other) => other.id().to_string() == *filter,
        }
    }

    fn broadcast(&self, record: &Record, item: FeedItem) {
        let feeds = self.state.feeds.lock();
        for (scope, senders) in feeds.iter() {
            if !Self::scope_matches(scope, record) {
                continue;
            }
            for (_, sender) in senders {
                // Feed backpressure is a test-configuration problem, not a
                // correctness path worth modeling here.
                let _ = sender.try_send(item.clone());
            }
        }
    }

    fn broadcast_presence(&self, scope: &ChannelScope, record: &PresenceRecord) {
        let feeds = self.state.feeds.lock();
        if let Some(senders) = feeds.get(scope) {
            for (_, sender) in senders {
                let _ = sender.try_send(FeedItem::Presence(record.clone()));
            }
        }
    }

    async fn wait_gate(&self) {
        let gate = self.state.apply_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn open_subscription(
        &self,
        scope: &ChannelScope,
        feed: mpsc::Sender<FeedItem>,
    ) -> Result<SubscriptionGuard, BackendError> {
        {
            let mut failures = self.state.fail_subscribes.lock();
            if let Some(remaining) = failures.get_mut(scope) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Transport("handshake refused".into()));
                }
            }
        }

        let feed_id = self.state.next_feed_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .feeds
            .lock()
            .entry(scope.clone())
            .or_default()
            .push((feed_id, feed));

        let state = self.state.clone();
        let scope = scope.clone();
        Ok(SubscriptionGuard::new(move || {
            let mut feeds = state.feeds.lock();
            if let Some(senders) = feeds.get_mut(&scope) {
                senders.retain(|(id, _)| *id != feed_id);
                if senders.is_empty() {
                    feeds.remove(&scope);
                }
            }
        }))
    }

    async fn apply(&self, request: &MutationRequest) -> Result<MutationAck, BackendError> {
        self.wait_gate().await;

        if let Some(reason) = self.state.reject_reasons.lock().pop_front() {
            return Err(BackendError::Rejected(reason));
        }

        let timestamp = self.timestamp();
        let ack = match request {
            MutationRequest::Create { record } => {
                let server_id = self.assign_server_id();
                let mut committed = record.clone();
                committed.set_id(RecordId::server(server_id.clone()));
                self.state
                    .records
                    .lock()
                    .insert(server_id.clone(), committed.clone());
                self.broadcast(
                    &committed,
                    FeedItem::Change(ChangeEvent::new(
                        ChangeOp::Insert,
                        committed.clone(),
                        timestamp,
                    )),
                );
                MutationAck {
                    server_id,
                    record: committed,
                    server_timestamp: timestamp,
                }
            }
            MutationRequest::Update { id, patch } => {
                let key = id.to_string();
                let mut committed = self
                    .state
                    .records
                    .lock()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| BackendError::Rejected(format!("unknown record {key}")))?;
                if !patch.apply_to(&mut committed) {
                    return Err(BackendError::Rejected(format!(
                        "patch entity mismatch for {key}"
                    )));
                }
                self.state
                    .records
                    .lock()
                    .insert(key.clone(), committed.clone());
                self.broadcast(
                    &committed,
                    FeedItem::Change(ChangeEvent::new(
                        ChangeOp::Update,
                        committed.clone(),
                        timestamp,
                    )),
                );
                MutationAck {
                    server_id: key,
                    record: committed,
                    server_timestamp: timestamp,
                }
            }
            MutationRequest::Delete { id, .. } => {
                let key = id.to_string();
                let removed = self
                    .state
                    .records
                    .lock()
                    .remove(&key)
                    .ok_or_else(|| BackendError::Rejected(format!("unknown record {key}")))?;
                self.broadcast(
                    &removed,
                    FeedItem::Change(ChangeEvent::new(ChangeOp::Delete, removed.clone(), timestamp)),
                );
                MutationAck {
                    server_id: key,
                    record: removed,
                    server_timestamp: timestamp,
                }
            }
        };

        self.state.applied.lock().push(request.clone());
        Ok(ack)
    }

    async fn publish_presence(
        &self,
        scope: &ChannelScope,
        record: &PresenceRecord,
    ) -> Result<(), BackendError> {
        if self.state.fail_presence.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("presence relay unreachable".into()));
        }
        self.broadcast_presence(scope, record);
        Ok(())
    }
}
