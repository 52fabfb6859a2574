//! FIFO buffer for mutation intents issued while offline.
//!
//! Operations are replayed strictly in enqueue order, one at a time, each
//! awaited before the next so causal order within an entity scope is
//! preserved. A rejected operation is dropped after its outcome is delivered
//! to the original issuer; it is never silently retried. Replayed operation
//! ids are remembered so an interrupted-and-resumed flush (or a re-restored
//! snapshot) never applies the same intent twice.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BackendError;
use crate::network::NetworkMonitor;
use crate::protocol::{MutationAck, MutationRequest};
use crate::store::reconciler::Reconciler;
use crate::transport::Backend;

pub type MutationOutcome = Result<MutationAck, BackendError>;

/// Persisted shape of one queued intent:
/// `{"opId": ..., "type": ..., "payload": ..., "enqueuedAt": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub op_id: Uuid,
    #[serde(flatten)]
    pub request: MutationRequest,
    pub enqueued_at: DateTime<Utc>,
}

struct QueueEntry {
    op: QueuedOperation,
    /// Optimistic mutation to resolve when the replay settles.
    local_id: Option<Uuid>,
    responder: Option<oneshot::Sender<MutationOutcome>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub rejected: usize,
    pub remaining: usize,
}

#[derive(Default)]
pub struct OfflineQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    replayed: Mutex<HashSet<Uuid>>,
    /// Serializes overlapping flush calls; a second caller waits and then
    /// finds the queue already drained.
    flush_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intent. The receiver resolves with the replay outcome.
    pub fn enqueue(&self, request: MutationRequest) -> (Uuid, oneshot::Receiver<MutationOutcome>) {
        self.push(request, None)
    }

    pub(crate) fn enqueue_linked(
        &self,
        request: MutationRequest,
        local_id: Uuid,
    ) -> oneshot::Receiver<MutationOutcome> {
        self.push(request, Some(local_id)).1
    }

    fn push(
        &self,
        request: MutationRequest,
        local_id: Option<Uuid>,
    ) -> (Uuid, oneshot::Receiver<MutationOutcome>) {
        let (tx, rx) = oneshot::channel();
        let op = QueuedOperation {
            op_id: Uuid::new_v4(),
            request,
            enqueued_at: Utc::now(),
        };
        let op_id = op.op_id;
        debug!(%op_id, "queued offline operation");
        self.entries.lock().push_back(QueueEntry {
            op,
            local_id,
            responder: Some(tx),
        });
        (op_id, rx)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The queued intents in order, for persistence across restarts.
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.entries.lock().iter().map(|e| e.op.clone()).collect()
    }

    /// Re-append previously persisted intents, preserving their order.
    /// Intents already replayed this session are skipped.
    pub fn restore(&self, ops: Vec<QueuedOperation>) {
        let replayed = self.replayed.lock();
        let mut entries = self.entries.lock();
        for op in ops {
            if replayed.contains(&op.op_id) {
                continue;
            }
            if entries.iter().any(|e| e.op.op_id == op.op_id) {
                continue;
            }
            entries.push_back(QueueEntry {
                op,
                local_id: None,
                responder: None,
            });
        }
    }

    /// Replay the queue in enqueue order. Stops early (keeping the
    /// remainder) if connectivity drops again mid-flush; per-operation
    /// failures are surfaced to their issuers and do not halt the flush.
    pub async fn flush(
        &self,
        backend: &Arc<dyn Backend>,
        reconciler: &Reconciler,
        network: &NetworkMonitor,
    ) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        loop {
            if !network.is_online() {
                debug!("went offline during flush; holding remaining operations");
                break;
            }
            let front = self.entries.lock().front().map(|e| e.op.clone());
            let Some(op) = front else { break };

            let outcome = if self.replayed.lock().contains(&op.op_id) {
                debug!(op_id = %op.op_id, "skipping already-replayed operation");
                None
            } else {
                // Replay under the canonical id: a create earlier in the
                // queue may have confirmed and re-keyed this operation's
                // target since it was captured.
                let request = reconciler.resolve_request(&op.request);
                let outcome = backend.apply(&request).await;
                self.replayed.lock().insert(op.op_id);
                Some(outcome)
            };

            // The entry leaves the queue only once its replay has settled.
            let entry = self.entries.lock().pop_front();
            let Some(mut entry) = entry else { break };
            let Some(outcome) = outcome else { continue };

            if let Some(local_id) = entry.local_id {
                reconciler.resolve(local_id, &outcome);
            }
            match &outcome {
                Ok(_) => report.applied += 1,
                Err(err) => {
                    warn!(op_id = %op.op_id, error = %err, "queued operation failed; dropping");
                    report.rejected += 1;
                }
            }
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(outcome);
            }
        }

        report.remaining = self.len();
        info!(
            applied = report.applied,
            rejected = report.rejected,
            remaining = report.remaining,
            "offline queue flush finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, RecordId};
    use crate::protocol::RecordPatch;

    fn update_request(id: &str) -> MutationRequest {
        MutationRequest::Update {
            id: RecordId::server(id),
            patch: RecordPatch::Message {
                body: Some("x".into()),
            },
        }
    }

    #[test]
    fn snapshot_preserves_enqueue_order() {
        let queue = OfflineQueue::new();
        let (a, _rx) = queue.enqueue(update_request("m1"));
        let (b, _rx) = queue.enqueue(update_request("m2"));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].op_id, a);
        assert_eq!(snapshot[1].op_id, b);
    }

    #[test]
    fn restore_is_idempotent() {
        let queue = OfflineQueue::new();
        queue.enqueue(update_request("m1"));
        let snapshot = queue.snapshot();

        let restored = OfflineQueue::new();
        restored.restore(snapshot.clone());
        restored.restore(snapshot);
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn persisted_shape_is_flat() {
        let queue = OfflineQueue::new();
        queue.enqueue(MutationRequest::Delete {
            entity: EntityKind::Message,
            id: RecordId::server("m9"),
        });
        let snapshot = queue.snapshot();
        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["payload"]["id"], "m9");
        assert!(json["enqueuedAt"].is_string());

        let back: QueuedOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot[0]);
    }
}
