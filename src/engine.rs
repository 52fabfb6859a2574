//! Public surface: wires channels, queue, reconciler, and presence into one
//! session-scoped engine.
//!
//! One `SyncEngine` per authenticated session, injected with its backend and
//! connectivity monitor; drop it (or call `shutdown`) on logout.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::channel::{ChannelHandle, ChannelManager};
use crate::config::SyncConfig;
use crate::error::{BackendError, SyncError};
use crate::model::{Record, RecordId};
use crate::network::NetworkMonitor;
use crate::presence::PresenceTracker;
use crate::protocol::{ChannelScope, MutationAck, MutationRequest, RecordPatch};
use crate::queue::{FlushReport, MutationOutcome, OfflineQueue, QueuedOperation};
use crate::store::reconciler::Reconciler;
use crate::store::{CanonicalStore, OptimisticMutation};
use crate::transport::Backend;

const RECONCILE_FEED_BUFFER: usize = 256;

/// Resolves with the mutation's confirmation or rejection. Dropping the
/// ticket detaches from the outcome without cancelling the mutation.
#[derive(Debug)]
pub struct MutationTicket {
    rx: oneshot::Receiver<MutationOutcome>,
}

impl MutationTicket {
    pub async fn outcome(self) -> Result<MutationAck, SyncError> {
        match self.rx.await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(BackendError::Rejected(reason))) => Err(SyncError::MutationRejected(reason)),
            Ok(Err(err)) => Err(SyncError::Backend(err)),
            Err(_) => Err(SyncError::OutcomeLost),
        }
    }
}

pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    network: NetworkMonitor,
    config: SyncConfig,
    channels: ChannelManager,
    queue: Arc<OfflineQueue>,
    reconciler: Arc<Reconciler>,
    store: CanonicalStore,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn Backend>, network: NetworkMonitor, config: SyncConfig) -> Self {
        let reconciler = Arc::new(Reconciler::new());
        let store = reconciler.store();
        let queue = Arc::new(OfflineQueue::new());

        let (feed_tx, mut feed_rx) = mpsc::channel(RECONCILE_FEED_BUFFER);
        let channels = ChannelManager::new(backend.clone(), network.clone(), &config, feed_tx);

        // Single consumer of the channel feeds; authoritative events reach
        // canonical state only through the reconciler.
        let pump_reconciler = reconciler.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = feed_rx.recv().await {
                pump_reconciler.apply_change(event);
            }
        });

        // Subscribe and read the starting flag before spawning: a receiver
        // created inside the task would mark whatever value it finds as
        // already seen, so an offline-to-online edge racing engine
        // construction could pass unobserved.
        let mut connectivity = network.watch();
        let initially_online = *connectivity.borrow_and_update();
        let watcher = tokio::spawn(flush_on_reconnect(
            connectivity,
            initially_online,
            network.clone(),
            backend.clone(),
            queue.clone(),
            reconciler.clone(),
        ));

        Self {
            backend,
            network,
            config,
            channels,
            queue,
            reconciler,
            store,
            session_tasks: Mutex::new(vec![pump, watcher]),
        }
    }

    // --- subscriptions -----------------------------------------------------

    pub fn subscribe(&self, scope: ChannelScope) -> ChannelHandle {
        self.channels.subscribe(scope)
    }

    pub fn unsubscribe(&self, handle: &ChannelHandle) {
        self.channels.unsubscribe(handle);
    }

    pub fn unsubscribe_all(&self) {
        self.channels.unsubscribe_all();
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    // --- mutations ---------------------------------------------------------

    /// Create a record optimistically. Returns immediately; the record is
    /// already visible in `data()` under a temporary local id.
    pub fn create_item(&self, record: Record) -> (OptimisticMutation, MutationTicket) {
        let mut record = record;
        record.set_id(RecordId::local());
        let mutation = self.reconciler.optimistic_create(record.clone());
        let ticket = self.dispatch(mutation.local_id, MutationRequest::Create { record });
        (mutation, ticket)
    }

    /// Patch an existing canonical record optimistically.
    pub fn update_item(
        &self,
        id: &RecordId,
        patch: RecordPatch,
    ) -> Result<(OptimisticMutation, MutationTicket), SyncError> {
        let mutation = self.reconciler.optimistic_update(id, &patch)?;
        let target = mutation.target.clone().unwrap_or_else(|| id.clone());
        let ticket = self.dispatch(mutation.local_id, MutationRequest::Update { id: target, patch });
        Ok((mutation, ticket))
    }

    /// Delete an existing canonical record optimistically.
    pub fn delete_item(
        &self,
        id: &RecordId,
    ) -> Result<(OptimisticMutation, MutationTicket), SyncError> {
        let mutation = self.reconciler.optimistic_delete(id)?;
        let target = mutation.target.clone().unwrap_or_else(|| id.clone());
        let ticket = self.dispatch(
            mutation.local_id,
            MutationRequest::Delete {
                entity: mutation.entity,
                id: target,
            },
        );
        Ok((mutation, ticket))
    }

    fn dispatch(&self, local_id: Uuid, request: MutationRequest) -> MutationTicket {
        if self.network.is_online() {
            let (tx, rx) = oneshot::channel();
            let backend = self.backend.clone();
            let reconciler = self.reconciler.clone();
            tokio::spawn(async move {
                let outcome = backend.apply(&request).await;
                reconciler.resolve(local_id, &outcome);
                let _ = tx.send(outcome);
            });
            MutationTicket { rx }
        } else {
            let rx = self.queue.enqueue_linked(request, local_id);
            MutationTicket { rx }
        }
    }

    // --- queries -----------------------------------------------------------

    /// The merged, UI-consumable canonical view.
    pub fn data(&self) -> Vec<Record> {
        self.store.data()
    }

    pub fn store(&self) -> CanonicalStore {
        self.store.clone()
    }

    pub fn is_optimistic(&self, id: &RecordId) -> bool {
        self.store.is_optimistic(id)
    }

    pub fn is_pending(&self, id: &RecordId) -> bool {
        self.store.is_pending(id)
    }

    /// Mutations issued but not yet confirmed or rolled back.
    pub fn pending_mutations(&self) -> usize {
        self.reconciler.pending_count()
    }

    // --- offline queue -----------------------------------------------------

    pub fn queued_operations(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_snapshot(&self) -> Vec<QueuedOperation> {
        self.queue.snapshot()
    }

    pub fn queue_restore(&self, ops: Vec<QueuedOperation>) {
        self.queue.restore(ops);
    }

    /// Replay the offline queue now, outside the automatic online-edge
    /// trigger.
    pub async fn flush_queue(&self) -> FlushReport {
        self.queue
            .flush(&self.backend, &self.reconciler, &self.network)
            .await
    }

    // --- presence ----------------------------------------------------------

    /// Track presence for `scope`, subscribing the channel if needed.
    pub fn track_presence(
        &self,
        scope: ChannelScope,
        participant_id: impl Into<String>,
        label: impl Into<String>,
    ) -> Arc<PresenceTracker> {
        let handle = self.channels.subscribe(scope.clone());
        let tracker = Arc::new(PresenceTracker::new(
            self.backend.clone(),
            scope,
            participant_id,
            label,
            self.config.presence_staleness,
        ));
        tracker.attach(&handle);
        tracker
    }

    /// Tear down every channel and background task. Used on logout.
    pub fn shutdown(&self) {
        info!("sync engine shutting down");
        self.channels.unsubscribe_all();
        for task in self.session_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.session_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Flush the offline queue on every offline-to-online edge. The receiver and
/// the starting flag are captured at engine construction, not at first poll.
async fn flush_on_reconnect(
    mut connectivity: watch::Receiver<bool>,
    mut was_online: bool,
    network: NetworkMonitor,
    backend: Arc<dyn Backend>,
    queue: Arc<OfflineQueue>,
    reconciler: Arc<Reconciler>,
) {
    loop {
        if connectivity.changed().await.is_err() {
            return;
        }
        let now_online = *connectivity.borrow();
        if now_online && !was_online && !queue.is_empty() {
            info!(queued = queue.len(), "connectivity restored; flushing offline queue");
            queue.flush(&backend, &reconciler, &network).await;
        }
        was_online = now_online;
    }
}
