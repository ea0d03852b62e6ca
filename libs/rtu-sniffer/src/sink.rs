//! Outward event delivery

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::types::CoreEvent;

/// Receives every change and lifecycle event produced by the hub.
///
/// Called while the hub lock is held, so events arrive in the order the
/// state changed. Implementations must not block or call back into the hub.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

impl EventSink for UnboundedSender<CoreEvent> {
    fn emit(&self, event: CoreEvent) {
        if self.send(event).is_err() {
            trace!("Event receiver dropped, event discarded");
        }
    }
}

/// In-memory collector
impl EventSink for Arc<Mutex<Vec<CoreEvent>>> {
    fn emit(&self, event: CoreEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LifecycleEvent;

    #[test]
    fn test_collector_sink() {
        let sink: Arc<Mutex<Vec<CoreEvent>>> = Arc::default();
        sink.emit(CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 1 }));
        assert_eq!(sink.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.emit(CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 4 }));
        assert_eq!(
            rx.recv().await,
            Some(CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 4 }))
        );

        drop(rx);
        // A closed channel is not an error for the core
        tx.emit(CoreEvent::Lifecycle(LifecycleEvent::Offline { address: 4 }));
    }
}
