//! Backend seam.
//!
//! The engine never talks to a concrete network stack; it holds an
//! `Arc<dyn Backend>` that opens scoped change-event subscriptions, applies
//! mutation intents, and best-effort publishes presence. Tests and embedders
//! inject their own implementation.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::protocol::{ChangeEvent, ChannelScope, MutationAck, MutationRequest, PresenceRecord};

pub mod mock;

/// One item on a live subscription feed. Presence rides the same feed as
/// change events but carries no consistency guarantee.
#[derive(Debug, Clone)]
pub enum FeedItem {
    Change(ChangeEvent),
    Presence(PresenceRecord),
}

/// Closes the transport-level subscription when dropped.
pub struct SubscriptionGuard {
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            closer: Some(Box::new(on_close)),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(close) = self.closer.take() {
            close();
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a live subscription for `scope`. The backend must deliver items
    /// into `feed` in server commit order and drop its sender on transport
    /// failure, which the channel driver observes as the stream ending.
    async fn open_subscription(
        &self,
        scope: &ChannelScope,
        feed: mpsc::Sender<FeedItem>,
    ) -> Result<SubscriptionGuard, BackendError>;

    /// Apply one mutation intent. Resolves with the authoritative outcome or
    /// a rejection; there is no client-side deadline.
    async fn apply(&self, request: &MutationRequest) -> Result<MutationAck, BackendError>;

    /// Best-effort presence broadcast into `scope`.
    async fn publish_presence(
        &self,
        scope: &ChannelScope,
        record: &PresenceRecord,
    ) -> Result<(), BackendError>;
}
