//! Entity model shared by the wire protocol and the canonical store.
//!
//! Records are a tagged union keyed by entity kind so the reconciler's merge
//! logic is exhaustively checked instead of pattern-matching on loosely typed
//! payloads.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// The entity families the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Message,
    Document,
    Alert,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Message => write!(f, "message"),
            EntityKind::Document => write!(f, "document"),
            EntityKind::Alert => write!(f, "alert"),
        }
    }
}

/// Identity of a record: a temporary local id until the server confirms the
/// creating mutation, the server-assigned id afterwards.
///
/// Serialized as a string (`local:<uuid>` for local ids) so wire shapes and
/// the persisted queue stay flat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    Local(Uuid),
    Server(String),
}

impl RecordId {
    /// Mint a fresh temporary id for an optimistic create.
    pub fn local() -> Self {
        RecordId::Local(Uuid::new_v4())
    }

    pub fn server(id: impl Into<String>) -> Self {
        RecordId::Server(id.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RecordId::Local(_))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Local(id) => write!(f, "local:{id}"),
            RecordId::Server(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.strip_prefix("local:") {
            Some(uuid) => Ok(RecordId::Local(Uuid::parse_str(uuid)?)),
            None => Ok(RecordId::Server(raw.to_string())),
        }
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: RecordId,
    pub thread_id: String,
    pub author: String,
    pub body: String,
    pub edited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: RecordId,
    pub title: String,
    pub body: String,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: RecordId,
    pub severity: AlertSeverity,
    pub text: String,
    pub acknowledged: bool,
}

/// One record of any synchronized entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum Record {
    Message(MessageRecord),
    Document(DocumentRecord),
    Alert(AlertRecord),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Message(_) => EntityKind::Message,
            Record::Document(_) => EntityKind::Document,
            Record::Alert(_) => EntityKind::Alert,
        }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            Record::Message(rec) => &rec.id,
            Record::Document(rec) => &rec.id,
            Record::Alert(rec) => &rec.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: RecordId) {
        match self {
            Record::Message(rec) => rec.id = id,
            Record::Document(rec) => rec.id = id,
            Record::Alert(rec) => rec.id = id,
        }
    }
}
