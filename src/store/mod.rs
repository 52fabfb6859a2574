//! Canonical record set and the optimistic mutation surface.
//!
//! The canonical state is shared between one writer (the `Reconciler`) and
//! any number of readers. `CanonicalStore` is the read-only view handed to
//! consumers; it cannot mutate records, which keeps the single-writer
//! invariant structural rather than conventional.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{EntityKind, Record, RecordId};
use crate::protocol::ChangeOp;

pub mod reconciler;

/// Lifecycle of one optimistic mutation. `Failed` covers a rejection whose
/// rollback has completed; `RolledBack` is reported when a resolution arrives
/// for a mutation no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
    RolledBack,
}

/// A local write applied ahead of backend confirmation.
#[derive(Debug, Clone)]
pub struct OptimisticMutation {
    pub local_id: Uuid,
    /// Server-side identity; `None` for a create until confirmation.
    pub target: Option<RecordId>,
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct CanonicalRecord {
    pub(crate) record: Record,
    /// Content not yet confirmed by the backend.
    pub(crate) optimistic: bool,
    /// A mutation for this record is in flight.
    pub(crate) pending: bool,
    /// Optimistically deleted; invisible to consumers but kept for rollback.
    pub(crate) hidden: bool,
    /// Timestamp of the newest authoritative value merged into this record.
    pub(crate) updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct CanonicalState {
    pub(crate) order: Vec<RecordId>,
    pub(crate) records: HashMap<RecordId, CanonicalRecord>,
    /// Confirmed temporary ids, so consumers holding a pre-confirmation id
    /// keep getting answers.
    pub(crate) aliases: HashMap<Uuid, RecordId>,
}

impl CanonicalState {
    pub(crate) fn resolve(&self, id: &RecordId) -> RecordId {
        if let RecordId::Local(uuid) = id {
            if let Some(aliased) = self.aliases.get(uuid) {
                return aliased.clone();
            }
        }
        id.clone()
    }
}

/// Read-only view of the merged canonical record set.
#[derive(Clone)]
pub struct CanonicalStore {
    pub(crate) state: Arc<RwLock<CanonicalState>>,
}

impl CanonicalStore {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CanonicalState::default())),
        }
    }

    /// The merged, UI-consumable view, in stable arrival order.
    pub fn data(&self) -> Vec<Record> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|entry| !entry.hidden)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        let state = self.state.read();
        let key = state.resolve(id);
        state
            .records
            .get(&key)
            .filter(|entry| !entry.hidden)
            .map(|entry| entry.record.clone())
    }

    /// True while the record's visible content is unconfirmed.
    pub fn is_optimistic(&self, id: &RecordId) -> bool {
        let state = self.state.read();
        let key = state.resolve(id);
        state
            .records
            .get(&key)
            .map(|entry| entry.optimistic)
            .unwrap_or(false)
    }

    /// True while a mutation for the record is in flight.
    pub fn is_pending(&self, id: &RecordId) -> bool {
        let state = self.state.read();
        let key = state.resolve(id);
        state
            .records
            .get(&key)
            .map(|entry| entry.pending)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.records.values().filter(|entry| !entry.hidden).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
