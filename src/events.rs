// In-process event bus connecting the core to its UI shell
//
// Commands are request/response; anything asynchronous travels here as a
// typed envelope on a broadcast channel. The core emits four of the
// envelope kinds; the rest exist so the shell can fan its own
// notifications through the same pipe.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::tools::ToolId;
use crate::watcher::DiffEntry;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CoreEvent {
    /// A tool's native config was edited outside this process
    ExternalConfigChange {
        tool: ToolId,
        diffs: Vec<DiffEntry>,
        is_sensitive: bool,
    },
    UpdateAvailable {
        version: String,
    },
    UpdateNotFound,
    /// A proxy instance started, stopped, or had its config rewritten
    ProxyConfigUpdated {
        tool: ToolId,
        running: bool,
    },
}

/// Cheap-to-clone handle; subscribers see events published after they
/// subscribe, and slow subscribers lose the oldest entries (lagged), not
/// the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // A send with no subscribers is fine; events are advisory
        let receivers = self.tx.receiver_count();
        if let Err(e) = self.tx.send(event) {
            tracing::trace!("event dropped ({receivers} subscribers): {e}");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(CoreEvent::UpdateNotFound);
        match rx.recv().await.unwrap() {
            CoreEvent::UpdateNotFound => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(CoreEvent::UpdateNotFound);
    }

    #[test]
    fn envelope_wire_form_is_kebab_case() {
        let event = CoreEvent::ProxyConfigUpdated {
            tool: ToolId::Codex,
            running: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "proxy-config-updated");
        assert_eq!(json["tool"], "codex");
    }
}
