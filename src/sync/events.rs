//! Events emitted to presentation code

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sync::stream::ConnectionState;
use crate::types::{DeliveryStatus, Message};

/// Event emitted by the inbox core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboxEvent {
    /// A message became visible (streamed, loaded or optimistic)
    MessageReceived { message: Message, latency_ms: Option<u64> },
    /// An existing message changed (edit, reaction, reconciliation)
    MessageUpdated { message: Message },
    MessageDeleted { conversation_id: String, message_id: String },
    ConversationListChanged { conversation_ids: Vec<String> },
    SendStatusChanged {
        optimistic_id: String,
        conversation_id: String,
        message_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
    },
    ConnectionChanged { state: ConnectionState },
}

/// Fan-out of [`InboxEvent`]s to any number of subscribers
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<InboxEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<InboxEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: InboxEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("No subscribers for inbox event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_fans_out_and_prunes() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        bus.emit(InboxEvent::ConversationListChanged {
            conversation_ids: vec!["c1".to_string()],
        });

        assert_eq!(bus.subscriber_count(), 1);
        match first.try_recv() {
            Ok(InboxEvent::ConversationListChanged { conversation_ids }) => {
                assert_eq!(conversation_ids, vec!["c1"]);
            }
            other => panic!("Expected ConversationListChanged, got {:?}", other),
        }
    }
}
