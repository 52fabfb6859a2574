//! Wire shapes exchanged with the backend.
//!
//! `ChangeEvent` is the internal, fully resolved form; `WireChangeEvent` is
//! the transport shape in which `new` is absent on DELETE and `old` is absent
//! on INSERT. Mutation intents travel as `MutationRequest` and come back as
//! `MutationAck`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EntityKind, Record, RecordId};

/// Subscription scope: one entity family, optionally narrowed by a backend
/// filter expression (e.g. `thread_id=eq.T1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelScope {
    pub entity: EntityKind,
    pub filter: Option<String>,
}

impl ChannelScope {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            filter: None,
        }
    }

    pub fn filtered(entity: EntityKind, filter: impl Into<String>) -> Self {
        Self {
            entity,
            filter: Some(filter.into()),
        }
    }
}

impl std::fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{}[{}]", self.entity, filter),
            None => write!(f, "{}", self.entity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One authoritative change notification, resolved from the wire shape.
/// Immutable once received; ordering within a channel matches server commit
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub record: Record,
    pub server_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, record: Record, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            entity: record.kind(),
            op,
            record,
            server_timestamp,
        }
    }

    pub fn record_id(&self) -> &RecordId {
        self.record.id()
    }

    pub fn from_wire(wire: WireChangeEvent) -> Result<Self, ProtocolError> {
        let record = match wire.event_type {
            ChangeOp::Insert | ChangeOp::Update => wire
                .new
                .ok_or(ProtocolError::MissingRecord { op: wire.event_type })?,
            ChangeOp::Delete => wire
                .old
                .ok_or(ProtocolError::MissingRecord { op: wire.event_type })?,
        };
        if record.kind() != wire.entity_type {
            return Err(ProtocolError::EntityMismatch {
                declared: wire.entity_type,
                actual: record.kind(),
            });
        }
        Ok(Self {
            entity: wire.entity_type,
            op: wire.event_type,
            record,
            server_timestamp: wire.server_timestamp,
        })
    }

    pub fn to_wire(&self) -> WireChangeEvent {
        let (new, old) = match self.op {
            ChangeOp::Insert => (Some(self.record.clone()), None),
            // The engine does not track the server-side previous value, so
            // `old` on UPDATE is left empty when re-encoding.
            ChangeOp::Update => (Some(self.record.clone()), None),
            ChangeOp::Delete => (None, Some(self.record.clone())),
        };
        WireChangeEvent {
            event_type: self.op,
            entity_type: self.entity,
            new,
            old,
            server_timestamp: self.server_timestamp,
        }
    }
}

/// Transport shape of a change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChangeEvent {
    pub event_type: ChangeOp,
    pub entity_type: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Record>,
    pub server_timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("change event {op:?} is missing its record")]
    MissingRecord { op: ChangeOp },
    #[error("change event declared {declared} but carried a {actual} record")]
    EntityMismatch {
        declared: EntityKind,
        actual: EntityKind,
    },
}

/// A typed partial update, one shape per entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum RecordPatch {
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Document {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Alert {
        #[serde(skip_serializing_if = "Option::is_none")]
        acknowledged: Option<bool>,
    },
}

impl RecordPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            RecordPatch::Message { .. } => EntityKind::Message,
            RecordPatch::Document { .. } => EntityKind::Document,
            RecordPatch::Alert { .. } => EntityKind::Alert,
        }
    }

    /// Apply the patch in place. Returns false when the patch and record
    /// disagree on entity kind.
    pub fn apply_to(&self, record: &mut Record) -> bool {
        match (self, record) {
            (RecordPatch::Message { body }, Record::Message(rec)) => {
                if let Some(body) = body {
                    rec.body = body.clone();
                    rec.edited = true;
                }
                true
            }
            (RecordPatch::Document { title, body }, Record::Document(rec)) => {
                if let Some(title) = title {
                    rec.title = title.clone();
                }
                if let Some(body) = body {
                    rec.body = body.clone();
                }
                rec.revision += 1;
                true
            }
            (RecordPatch::Alert { acknowledged }, Record::Alert(rec)) => {
                if let Some(acknowledged) = acknowledged {
                    rec.acknowledged = *acknowledged;
                }
                true
            }
            _ => false,
        }
    }
}

/// A mutation intent. This is also the persisted queue payload shape:
/// `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum MutationRequest {
    Create { record: Record },
    Update { id: RecordId, patch: RecordPatch },
    Delete { entity: EntityKind, id: RecordId },
}

impl MutationRequest {
    pub fn entity(&self) -> EntityKind {
        match self {
            MutationRequest::Create { record } => record.kind(),
            MutationRequest::Update { patch, .. } => patch.kind(),
            MutationRequest::Delete { entity, .. } => *entity,
        }
    }

    pub fn op(&self) -> ChangeOp {
        match self {
            MutationRequest::Create { .. } => ChangeOp::Insert,
            MutationRequest::Update { .. } => ChangeOp::Update,
            MutationRequest::Delete { .. } => ChangeOp::Delete,
        }
    }
}

/// Successful mutation outcome: the server-assigned identity plus the
/// authoritative record as committed.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationAck {
    pub server_id: String,
    /// The committed record; carries the pre-delete value for deletes.
    pub record: Record,
    pub server_timestamp: DateTime<Utc>,
}

/// Advisory liveness record scoped to a channel. No durability guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: String,
    pub label: String,
    pub last_seen_at: DateTime<Utc>,
}
