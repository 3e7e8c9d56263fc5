//! Change notifications
//!
//! The session publishes a [`SessionEvent`] after every state change it
//! applies. Listeners re-read the derived views they care about through the
//! handle; events carry ids, not snapshots.

use super::subscription::StreamKind;
use crate::core_client::LoadPhase;
use crate::model::{Address, ConversationId, InboxId, MessageId};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Conversation previews or their order changed
    ConversationsChanged,
    PhaseChanged(LoadPhase),
    /// The open conversation's timeline changed
    TimelineChanged(ConversationId),
    ConsentChanged(Vec<InboxId>),
    UnreadChanged { conversation_id: ConversationId, count: u32 },
    ReputationUpdated(Vec<Address>),
    FocusedContactChanged(InboxId),
    SendFailed { conversation_id: ConversationId, local_id: MessageId },
    /// A live stream ended; `restart_streams` re-subscribes
    StreamClosed(StreamKind),
    /// The session loop stopped
    Closed,
}

/// Fan-out of session events to any number of listeners
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of listeners that received the event
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let broadcaster = EventBroadcaster::new(8);
        assert_eq!(broadcaster.emit(SessionEvent::ConversationsChanged), 0);

        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        assert_eq!(broadcaster.emit(SessionEvent::Closed), 2);
        assert_eq!(rx1.recv().await.unwrap(), SessionEvent::Closed);
        assert_eq!(rx2.recv().await.unwrap(), SessionEvent::Closed);
    }
}
