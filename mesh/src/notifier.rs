//! Change notification
//!
//! Internal pub/sub for mesh-visible changes. Listeners registered with
//! [`ChangeNotifier::register`] are called synchronously on the emitting task;
//! [`ChangeNotifier::subscribe`] hands out broadcast receivers for async
//! consumers such as the sync round driver.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    PeerOnline,
    PeerOffline,
    PeerDiscovered,
    SyncComplete,
    LocalWrite,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::PeerOnline => "PEER_ONLINE",
            ChangeKind::PeerOffline => "PEER_OFFLINE",
            ChangeKind::PeerDiscovered => "PEER_DISCOVERED",
            ChangeKind::SyncComplete => "SYNC_COMPLETE",
            ChangeKind::LocalWrite => "LOCAL_WRITE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Sink for change events, e.g. a push-to-client layer
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

pub struct ChangeNotifier {
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    tx: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            tx,
        }
    }

    pub fn register(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: ChangeKind, payload: Value) {
        let event = ChangeEvent {
            kind,
            payload,
            at: Utc::now(),
        };
        trace!(kind = %kind, "Change event");

        // Clone out so a listener may register another without deadlocking.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_change(&event);
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn test_listeners_called_synchronously() {
        let notifier = ChangeNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        notifier.register(Arc::new(move |event: &ChangeEvent| {
            if event.kind == ChangeKind::SyncComplete {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        notifier.emit(ChangeKind::SyncComplete, json!({}));
        notifier.emit(ChangeKind::PeerOnline, json!({"peer": "a"}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.emit(ChangeKind::LocalWrite, json!({"type": "USER"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::LocalWrite);
        assert_eq!(event.payload["type"], "USER");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let notifier = ChangeNotifier::new();
        notifier.emit(ChangeKind::PeerOffline, Value::Null);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ChangeKind::PeerDiscovered).unwrap(),
            json!("PEER_DISCOVERED")
        );
        assert_eq!(ChangeKind::SyncComplete.to_string(), "SYNC_COMPLETE");
    }
}
