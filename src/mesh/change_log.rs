use std::sync::atomic::{AtomicU64, Ordering};

use chat_mesh::{ChangeEvent, ChangeKind, ChangeListener};
use tracing::{debug, info};

/// Writes every change event to the log. Stands in for a push-to-client
/// layer.
#[derive(Debug, Default)]
pub struct ChangeLogger {
    seen: AtomicU64,
}

impl ChangeLogger {
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl ChangeListener for ChangeLogger {
    fn on_change(&self, event: &ChangeEvent) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        match event.kind {
            // emitted for every local mutation
            ChangeKind::LocalWrite => debug!(
                kind = %event.kind,
                payload = %event.payload,
                at = %event.at,
                "Change"
            ),
            _ => info!(
                kind = %event.kind,
                payload = %event.payload,
                at = %event.at,
                "Change"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_mesh::ChangeNotifier;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_counts_events() {
        let notifier = ChangeNotifier::new();
        let logger = Arc::new(ChangeLogger::default());
        notifier.register(logger.clone());

        notifier.emit(ChangeKind::PeerOnline, json!({"peer": "127.0.0.1:9000"}));
        notifier.emit(ChangeKind::LocalWrite, json!({"type": "USER"}));
        assert_eq!(logger.seen(), 2);
    }
}
