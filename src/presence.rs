//! Advisory presence: who is currently active in a channel's scope.
//!
//! Best effort only. A dropped presence update is not a correctness failure,
//! so publish errors are logged at debug and never escalate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::{ChannelEvent, ChannelHandle};
use crate::protocol::{ChannelScope, PresenceRecord};
use crate::transport::Backend;

pub struct PresenceTracker {
    backend: Arc<dyn Backend>,
    scope: ChannelScope,
    participant_id: String,
    label: String,
    staleness: chrono::Duration,
    remote: Mutex<HashMap<String, PresenceRecord>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        scope: ChannelScope,
        participant_id: impl Into<String>,
        label: impl Into<String>,
        staleness: Duration,
    ) -> Self {
        Self {
            backend,
            scope,
            participant_id: participant_id.into(),
            label: label.into(),
            staleness: chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            remote: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        }
    }

    /// Start observing remote presence on the channel's event stream.
    pub(crate) fn attach(self: &Arc<Self>, handle: &ChannelHandle) {
        let mut events = handle.events();
        let tracker = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Presence(record)) => {
                        let Some(tracker) = tracker.upgrade() else { break };
                        tracker.observe(record);
                    }
                    Ok(_) => {}
                    // Presence is lossy by contract; skipping missed events
                    // is fine.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump.lock() = Some(pump);
    }

    /// Broadcast local liveness into the scope.
    pub async fn announce(&self) {
        let record = PresenceRecord {
            participant_id: self.participant_id.clone(),
            label: self.label.clone(),
            last_seen_at: Utc::now(),
        };
        if let Err(err) = self.backend.publish_presence(&self.scope, &record).await {
            debug!(scope = %self.scope, error = %err, "presence publish failed");
        }
    }

    pub fn observe(&self, record: PresenceRecord) {
        self.remote
            .lock()
            .insert(record.participant_id.clone(), record);
    }

    /// Participants seen within the staleness horizon, stably ordered.
    pub fn participants(&self) -> Vec<PresenceRecord> {
        let horizon = Utc::now() - self.staleness;
        let mut remote = self.remote.lock();
        remote.retain(|_, record| record.last_seen_at >= horizon);
        let mut participants: Vec<_> = remote.values().cloned().collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        participants
    }

    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::transport::mock::MockBackend;

    #[tokio::test]
    async fn stale_participants_are_pruned() {
        let backend = Arc::new(MockBackend::new());
        let tracker = PresenceTracker::new(
            backend,
            ChannelScope::new(EntityKind::Message),
            "p1",
            "Ada",
            Duration::from_secs(30),
        );

        tracker.observe(PresenceRecord {
            participant_id: "p2".into(),
            label: "Grace".into(),
            last_seen_at: Utc::now(),
        });
        tracker.observe(PresenceRecord {
            participant_id: "p3".into(),
            label: "Edsger".into(),
            last_seen_at: Utc::now() - chrono::Duration::minutes(5),
        });

        let participants = tracker.participants();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].participant_id, "p2");
    }

    #[tokio::test]
    async fn publish_failures_never_escalate() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_presence(true);
        let tracker = PresenceTracker::new(
            backend,
            ChannelScope::new(EntityKind::Message),
            "p1",
            "Ada",
            Duration::from_secs(30),
        );
        // Must not panic or propagate.
        tracker.announce().await;
    }
}
