//! The single writer of the canonical record set.
//!
//! Everything funnels through here: optimistic writes at mutation-issue time,
//! authoritative change events from channels, and mutation resolutions.
//! While a record has an in-flight mutation, incoming change events for it
//! are deferred (latest by server timestamp) so a server echo of the
//! client's own write cannot visually revert an in-flight edit; once the
//! mutation settles, the newer of {mutation outcome, deferred event} wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BackendError, SyncError};
use crate::model::{EntityKind, Record, RecordId};
use crate::protocol::{ChangeEvent, ChangeOp, MutationAck, MutationRequest, RecordPatch};

use super::{
    CanonicalRecord, CanonicalState, CanonicalStore, MutationStatus, OptimisticMutation,
};

struct PendingEntry {
    /// In-flight mutations for this record, oldest first.
    mutations: Vec<(Uuid, ChangeOp)>,
    entity: EntityKind,
    /// Value before the first optimistic write; `None` when the record was
    /// created optimistically.
    prior: Option<Record>,
    rooted_in_create: bool,
    /// Latest remote event held back until the mutations settle.
    deferred: Option<ChangeEvent>,
}

pub struct Reconciler {
    state: Arc<RwLock<CanonicalState>>,
    pending: Mutex<HashMap<RecordId, PendingEntry>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            state: CanonicalStore::new().state,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The read-only view consumers observe.
    pub fn store(&self) -> CanonicalStore {
        CanonicalStore {
            state: self.state.clone(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .map(|entry| entry.mutations.len())
            .sum()
    }

    /// Rewrite a request's target through the confirmed-id alias map. A
    /// request captured before its record's create confirmed still carries
    /// the temporary local id; the backend only knows the server id.
    pub(crate) fn resolve_request(&self, request: &MutationRequest) -> MutationRequest {
        match request {
            MutationRequest::Create { .. } => request.clone(),
            MutationRequest::Update { id, patch } => MutationRequest::Update {
                id: self.state.read().resolve(id),
                patch: patch.clone(),
            },
            MutationRequest::Delete { entity, id } => MutationRequest::Delete {
                entity: *entity,
                id: self.state.read().resolve(id),
            },
        }
    }

    /// Write an optimistic record for a create. `record` must carry a fresh
    /// local id.
    pub(crate) fn optimistic_create(&self, record: Record) -> OptimisticMutation {
        let local_id = match record.id() {
            RecordId::Local(uuid) => *uuid,
            RecordId::Server(_) => {
                // Engine always mints local ids for creates; treat a server
                // id here as a programming error worth noticing in logs.
                warn!("optimistic create with server id {}", record.id());
                Uuid::new_v4()
            }
        };
        let key = record.id().clone();
        let entity = record.kind();

        {
            let mut state = self.state.write();
            state.order.push(key.clone());
            state.records.insert(
                key.clone(),
                CanonicalRecord {
                    record,
                    optimistic: true,
                    pending: true,
                    hidden: false,
                    updated_at: Utc::now(),
                },
            );
        }

        self.pending.lock().insert(
            key,
            PendingEntry {
                mutations: vec![(local_id, ChangeOp::Insert)],
                entity,
                prior: None,
                rooted_in_create: true,
                deferred: None,
            },
        );

        OptimisticMutation {
            local_id,
            target: None,
            entity,
            op: ChangeOp::Insert,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Patch an existing canonical record optimistically.
    pub(crate) fn optimistic_update(
        &self,
        id: &RecordId,
        patch: &RecordPatch,
    ) -> Result<OptimisticMutation, SyncError> {
        let local_id = Uuid::new_v4();
        let mut state = self.state.write();
        let key = state.resolve(id);
        let entry = state
            .records
            .get_mut(&key)
            .filter(|entry| !entry.hidden)
            .ok_or_else(|| SyncError::UnknownRecord(id.to_string()))?;

        let prior = entry.record.clone();
        let mut patched = entry.record.clone();
        if !patch.apply_to(&mut patched) {
            return Err(SyncError::InvalidPatch(format!(
                "{} patch on {} record",
                patch.kind(),
                entry.record.kind()
            )));
        }
        entry.record = patched;
        entry.optimistic = true;
        entry.pending = true;
        let entity = entry.record.kind();
        drop(state);

        let mut pending = self.pending.lock();
        let slot = pending.entry(key.clone()).or_insert_with(|| PendingEntry {
            mutations: Vec::new(),
            entity,
            prior: Some(prior),
            rooted_in_create: false,
            deferred: None,
        });
        slot.mutations.push((local_id, ChangeOp::Update));

        Ok(OptimisticMutation {
            local_id,
            target: Some(key),
            entity,
            op: ChangeOp::Update,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Hide a record optimistically pending delete confirmation. The value
    /// is retained so a rejection can restore it in place.
    pub(crate) fn optimistic_delete(&self, id: &RecordId) -> Result<OptimisticMutation, SyncError> {
        let local_id = Uuid::new_v4();
        let mut state = self.state.write();
        let key = state.resolve(id);
        let entry = state
            .records
            .get_mut(&key)
            .filter(|entry| !entry.hidden)
            .ok_or_else(|| SyncError::UnknownRecord(id.to_string()))?;

        let prior = entry.record.clone();
        let entity = entry.record.kind();
        entry.hidden = true;
        entry.pending = true;
        entry.optimistic = true;
        drop(state);

        let mut pending = self.pending.lock();
        let slot = pending.entry(key.clone()).or_insert_with(|| PendingEntry {
            mutations: Vec::new(),
            entity,
            prior: Some(prior),
            rooted_in_create: false,
            deferred: None,
        });
        slot.mutations.push((local_id, ChangeOp::Delete));

        Ok(OptimisticMutation {
            local_id,
            target: Some(key),
            entity,
            op: ChangeOp::Delete,
            status: MutationStatus::Pending,
            created_at: Utc::now(),
        })
    }

    /// Merge one authoritative change event. Events for records with
    /// in-flight mutations are deferred, keeping only the newest.
    pub fn apply_change(&self, event: ChangeEvent) {
        let key = event.record_id().clone();

        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&key) {
            let newer = entry
                .deferred
                .as_ref()
                .map(|held| event.server_timestamp > held.server_timestamp)
                .unwrap_or(true);
            if newer {
                debug!(record = %key, op = ?event.op, "deferring change event behind pending mutation");
                entry.deferred = Some(event);
            }
            return;
        }
        drop(pending);

        self.apply_authoritative(event);
    }

    /// Resolve one in-flight mutation against the backend outcome. Returns
    /// `Confirmed` or `Failed` (the rollback accompanying a failure has
    /// completed by the time this returns); `RolledBack` is reported for a
    /// mutation no longer tracked.
    pub(crate) fn resolve(
        &self,
        local_id: Uuid,
        outcome: &Result<MutationAck, BackendError>,
    ) -> MutationStatus {
        let mut pending = self.pending.lock();
        let Some(key) = pending.iter().find_map(|(key, entry)| {
            entry
                .mutations
                .iter()
                .any(|(id, _)| *id == local_id)
                .then(|| key.clone())
        }) else {
            warn!(%local_id, "resolution for unknown mutation");
            return MutationStatus::RolledBack;
        };

        let entry = pending.get_mut(&key).expect("entry present");
        let position = entry
            .mutations
            .iter()
            .position(|(id, _)| *id == local_id)
            .expect("mutation present");
        let (_, op) = entry.mutations.remove(position);
        let settled = entry.mutations.is_empty();

        let status = match outcome {
            Ok(ack) => {
                let confirmed_key = self.confirm(&key, op, ack, settled);
                if settled {
                    let deferred = entry.deferred.take();
                    pending.remove(&key);
                    drop(pending);
                    if let Some(event) = deferred {
                        if event.server_timestamp > ack.server_timestamp {
                            self.apply_authoritative(event);
                        }
                    }
                } else if confirmed_key != key {
                    // The create settled under its server id while later
                    // mutations are still in flight; re-key the entry so
                    // their resolutions and future events find it. The entry
                    // is no longer rooted in an unconfirmed create: if a
                    // later mutation is rejected, the record must revert to
                    // the confirmed value, not disappear.
                    let mut entry = pending.remove(&key).expect("entry present");
                    entry.rooted_in_create = false;
                    entry.prior = Some(ack.record.clone());
                    pending.insert(confirmed_key, entry);
                }
                MutationStatus::Confirmed
            }
            Err(err) => {
                debug!(record = %key, error = %err, "mutation failed; rolling back");
                self.rollback(&key, entry);
                if settled {
                    let deferred = entry.deferred.take();
                    pending.remove(&key);
                    drop(pending);
                    // The local intent is lost; any remote state observed in
                    // the meantime wins outright.
                    if let Some(event) = deferred {
                        self.apply_authoritative(event);
                    }
                }
                MutationStatus::Failed
            }
        };
        status
    }

    fn confirm(&self, key: &RecordId, op: ChangeOp, ack: &MutationAck, settled: bool) -> RecordId {
        let mut state = self.state.write();
        match op {
            ChangeOp::Insert => {
                let server_key = RecordId::server(ack.server_id.clone());
                if let RecordId::Local(uuid) = key {
                    state.aliases.insert(*uuid, server_key.clone());
                }

                if state.records.contains_key(&server_key) {
                    // The server echo of this create arrived before the ack
                    // and was applied under the server id. Drop the
                    // temporary record and keep the newer value.
                    state.order.retain(|id| id != key);
                    state.records.remove(key);
                    let existing = state.records.get_mut(&server_key).expect("echo present");
                    if ack.server_timestamp >= existing.updated_at {
                        existing.record = ack.record.clone();
                        existing.updated_at = ack.server_timestamp;
                    }
                    existing.optimistic = !settled;
                    existing.pending = !settled;
                } else {
                    if let Some(slot) = state.order.iter_mut().find(|id| *id == key) {
                        *slot = server_key.clone();
                    }
                    state.records.remove(key);
                    state.records.insert(
                        server_key.clone(),
                        CanonicalRecord {
                            record: ack.record.clone(),
                            optimistic: !settled,
                            pending: !settled,
                            hidden: false,
                            updated_at: ack.server_timestamp,
                        },
                    );
                }
                server_key
            }
            ChangeOp::Update => {
                if let Some(existing) = state.records.get_mut(key) {
                    if ack.server_timestamp >= existing.updated_at {
                        existing.record = ack.record.clone();
                        existing.updated_at = ack.server_timestamp;
                    }
                    existing.optimistic = !settled;
                    existing.pending = !settled;
                } else {
                    warn!(record = %key, "confirmed update for missing record");
                }
                key.clone()
            }
            ChangeOp::Delete => {
                state.order.retain(|id| id != key);
                state.records.remove(key);
                key.clone()
            }
        }
    }

    fn rollback(&self, key: &RecordId, entry: &PendingEntry) {
        let mut state = self.state.write();
        if entry.rooted_in_create {
            state.order.retain(|id| id != key);
            state.records.remove(key);
            return;
        }
        let Some(existing) = state.records.get_mut(key) else {
            return;
        };
        if let Some(prior) = &entry.prior {
            existing.record = prior.clone();
        }
        existing.hidden = false;
        existing.optimistic = false;
        existing.pending = !entry.mutations.is_empty();
    }

    fn apply_authoritative(&self, event: ChangeEvent) {
        let key = event.record_id().clone();
        let mut state = self.state.write();
        match event.op {
            ChangeOp::Insert => {
                if let Some(existing) = state.records.get_mut(&key) {
                    if event.server_timestamp >= existing.updated_at {
                        existing.record = event.record;
                        existing.updated_at = event.server_timestamp;
                        existing.optimistic = false;
                    }
                } else {
                    state.order.push(key.clone());
                    state.records.insert(
                        key,
                        CanonicalRecord {
                            record: event.record,
                            optimistic: false,
                            pending: false,
                            hidden: false,
                            updated_at: event.server_timestamp,
                        },
                    );
                }
            }
            ChangeOp::Update => {
                if let Some(existing) = state.records.get_mut(&key) {
                    if event.server_timestamp >= existing.updated_at {
                        existing.record = event.record;
                        existing.updated_at = event.server_timestamp;
                        existing.optimistic = false;
                    }
                } else {
                    // An update for a record never seen on this channel;
                    // treat as an upsert rather than dropping data.
                    debug!(record = %key, "upserting update for unseen record");
                    state.order.push(key.clone());
                    state.records.insert(
                        key,
                        CanonicalRecord {
                            record: event.record,
                            optimistic: false,
                            pending: false,
                            hidden: false,
                            updated_at: event.server_timestamp,
                        },
                    );
                }
            }
            ChangeOp::Delete => {
                state.order.retain(|id| id != &key);
                state.records.remove(&key);
            }
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageRecord;

    fn message(id: RecordId, body: &str) -> Record {
        Record::Message(MessageRecord {
            id,
            thread_id: "T1".into(),
            author: "ada".into(),
            body: body.into(),
            edited: false,
        })
    }

    fn ack_for(record: &Record, server_id: &str) -> MutationAck {
        let mut committed = record.clone();
        committed.set_id(RecordId::server(server_id));
        MutationAck {
            server_id: server_id.into(),
            record: committed,
            server_timestamp: Utc::now(),
        }
    }

    #[test]
    fn ordered_events_yield_ordered_view() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();
        let now = Utc::now();

        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m1"), "first"),
            now,
        ));
        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m2"), "second"),
            now + chrono::Duration::seconds(1),
        ));
        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Update,
            message(RecordId::server("m1"), "first (edited)"),
            now + chrono::Duration::seconds(2),
        ));

        let view = store.data();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id(), &RecordId::server("m1"));
        assert_eq!(view[1].id(), &RecordId::server("m2"));
        match &view[0] {
            Record::Message(m) => assert_eq!(m.body, "first (edited)"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn confirmed_create_leaves_single_record() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();

        let draft = message(RecordId::local(), "hello");
        let local = draft.id().clone();
        let mutation = reconciler.optimistic_create(draft.clone());
        assert!(store.is_pending(&local));
        assert!(store.is_optimistic(&local));

        let ack = ack_for(&draft, "srv-1");
        let status = reconciler.resolve(mutation.local_id, &Ok(ack));
        assert_eq!(status, MutationStatus::Confirmed);

        let view = store.data();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id(), &RecordId::server("srv-1"));
        // The pre-confirmation id keeps answering through the alias.
        assert!(!store.is_pending(&local));
        assert!(store.get(&local).is_some());
    }

    #[test]
    fn echo_before_ack_still_leaves_single_record() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();

        let draft = message(RecordId::local(), "hello");
        let mutation = reconciler.optimistic_create(draft.clone());

        // Echo of our own write lands before the ack does.
        let mut echoed = draft.clone();
        echoed.set_id(RecordId::server("srv-1"));
        reconciler.apply_change(ChangeEvent::new(ChangeOp::Insert, echoed, Utc::now()));

        reconciler.resolve(mutation.local_id, &Ok(ack_for(&draft, "srv-1")));
        let view = store.data();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id(), &RecordId::server("srv-1"));
    }

    #[test]
    fn pending_mutation_defers_remote_events_until_settled() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();
        let now = Utc::now();

        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m1"), "original"),
            now,
        ));

        let id = RecordId::server("m1");
        let mutation = reconciler
            .optimistic_update(
                &id,
                &RecordPatch::Message {
                    body: Some("local edit".into()),
                },
            )
            .unwrap();

        // A concurrent remote edit with a later timestamp than our ack.
        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Update,
            message(RecordId::server("m1"), "remote edit"),
            now + chrono::Duration::seconds(10),
        ));

        // The optimistic value still shows while the mutation is in flight.
        match store.get(&id).unwrap() {
            Record::Message(m) => assert_eq!(m.body, "local edit"),
            other => panic!("unexpected record {other:?}"),
        }

        let ack = MutationAck {
            server_id: "m1".into(),
            record: message(id.clone(), "local edit"),
            server_timestamp: now + chrono::Duration::seconds(5),
        };
        reconciler.resolve(mutation.local_id, &Ok(ack));

        // The deferred remote edit is newer than the ack, so it wins.
        match store.get(&id).unwrap() {
            Record::Message(m) => assert_eq!(m.body, "remote edit"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn stale_echo_does_not_revert_confirmed_edit() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();
        let now = Utc::now();

        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m1"), "original"),
            now,
        ));

        let id = RecordId::server("m1");
        let mutation = reconciler
            .optimistic_update(
                &id,
                &RecordPatch::Message {
                    body: Some("local edit".into()),
                },
            )
            .unwrap();

        // Server echo of the state *before* our edit, deferred while pending.
        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Update,
            message(RecordId::server("m1"), "original"),
            now + chrono::Duration::seconds(1),
        ));

        let ack = MutationAck {
            server_id: "m1".into(),
            record: message(id.clone(), "local edit"),
            server_timestamp: now + chrono::Duration::seconds(2),
        };
        reconciler.resolve(mutation.local_id, &Ok(ack));

        match store.get(&id).unwrap() {
            Record::Message(m) => assert_eq!(m.body, "local edit"),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn rejected_update_rolls_back_to_prior_value() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();

        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m1"), "original"),
            Utc::now(),
        ));

        let id = RecordId::server("m1");
        let mutation = reconciler
            .optimistic_update(
                &id,
                &RecordPatch::Message {
                    body: Some("doomed edit".into()),
                },
            )
            .unwrap();

        let status = reconciler.resolve(
            mutation.local_id,
            &Err(BackendError::Rejected("not allowed".into())),
        );
        assert_eq!(status, MutationStatus::Failed);
        match store.get(&id).unwrap() {
            Record::Message(m) => assert_eq!(m.body, "original"),
            other => panic!("unexpected record {other:?}"),
        }
        assert!(!store.is_pending(&id));
        assert!(!store.is_optimistic(&id));
    }

    #[test]
    fn rejected_create_removes_the_record() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();

        let draft = message(RecordId::local(), "never happened");
        let local = draft.id().clone();
        let mutation = reconciler.optimistic_create(draft);
        assert_eq!(store.len(), 1);

        reconciler.resolve(
            mutation.local_id,
            &Err(BackendError::Rejected("quota".into())),
        );
        assert!(store.is_empty());
        assert!(store.get(&local).is_none());
    }

    #[test]
    fn rejection_after_confirmed_create_keeps_the_confirmed_record() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();

        let draft = message(RecordId::local(), "keep me");
        let local = draft.id().clone();
        let create = reconciler.optimistic_create(draft.clone());
        let update = reconciler
            .optimistic_update(
                &local,
                &RecordPatch::Message {
                    body: Some("doomed edit".into()),
                },
            )
            .unwrap();

        reconciler.resolve(create.local_id, &Ok(ack_for(&draft, "srv-1")));
        let status = reconciler.resolve(
            update.local_id,
            &Err(BackendError::Rejected("storage full".into())),
        );
        assert_eq!(status, MutationStatus::Failed);

        // The confirmed record survives with its confirmed value.
        let view = store.data();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id(), &RecordId::server("srv-1"));
        match &view[0] {
            Record::Message(m) => assert_eq!(m.body, "keep me"),
            other => panic!("unexpected record {other:?}"),
        }
        assert!(!store.is_pending(&RecordId::server("srv-1")));
    }

    #[test]
    fn queued_target_ids_resolve_through_the_alias() {
        let reconciler = Reconciler::new();

        let draft = message(RecordId::local(), "hello");
        let local = draft.id().clone();
        let request = MutationRequest::Update {
            id: local.clone(),
            patch: RecordPatch::Message {
                body: Some("edited".into()),
            },
        };
        let create = reconciler.optimistic_create(draft.clone());

        // Before confirmation the local id is all there is.
        assert_eq!(reconciler.resolve_request(&request), request);

        reconciler.resolve(create.local_id, &Ok(ack_for(&draft, "srv-1")));
        match reconciler.resolve_request(&request) {
            MutationRequest::Update { id, .. } => assert_eq!(id, RecordId::server("srv-1")),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn rejected_delete_restores_the_record_in_place() {
        let reconciler = Reconciler::new();
        let store = reconciler.store();
        let now = Utc::now();

        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m1"), "first"),
            now,
        ));
        reconciler.apply_change(ChangeEvent::new(
            ChangeOp::Insert,
            message(RecordId::server("m2"), "second"),
            now,
        ));

        let id = RecordId::server("m1");
        let mutation = reconciler.optimistic_delete(&id).unwrap();
        assert_eq!(store.data().len(), 1);

        reconciler.resolve(
            mutation.local_id,
            &Err(BackendError::Rejected("protected".into())),
        );
        let view = store.data();
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id(), &RecordId::server("m1"));
    }
}
