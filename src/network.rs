//! Injectable binary connectivity signal.
//!
//! Platform integrations (browser online/offline events, OS reachability)
//! feed `set_online`; the engine and channel drivers observe transitions
//! through a watch channel instead of registering ad-hoc callbacks.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// A monitor that starts online; the common production default.
    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a connectivity transition. Observers wake even when the value
    /// is re-sent unchanged; consumers handle that by comparing edges.
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }

    /// Observe connectivity transitions.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_are_observable() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.watch();
        assert!(!monitor.is_online());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(monitor.is_online());
    }
}
