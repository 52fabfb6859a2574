//! Realtime synchronization and optimistic mutation engine.
//!
//! The engine keeps a local, UI-consumable view of conversational, document,
//! and alert data consistent with an authoritative backend while the user
//! mutates that data optimistically and connectivity comes and goes.
//! `SyncEngine` wires the pieces together: `ChannelManager` maintains live
//! subscriptions with bounded reconnect backoff, the `Reconciler` is the
//! single writer of the canonical record set, the `OfflineQueue` replays
//! mutations issued while disconnected, and `PresenceTracker` carries
//! advisory liveness.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod network;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod transport;

pub use channel::{ChannelEvent, ChannelHandle, ChannelManager, ChannelState};
pub use config::SyncConfig;
pub use engine::{MutationTicket, SyncEngine};
pub use error::{BackendError, SyncError};
pub use model::{EntityKind, Record, RecordId};
pub use network::NetworkMonitor;
pub use protocol::{ChangeEvent, ChangeOp, ChannelScope, MutationAck, MutationRequest, RecordPatch};
pub use store::{MutationStatus, OptimisticMutation};
