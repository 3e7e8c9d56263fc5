//! Cancellable stream subscriptions, at most one per stream kind

use std::collections::HashMap;
use std::fmt;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Conversations,
    Messages,
    Consent,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Conversations, StreamKind::Messages, StreamKind::Consent];
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Conversations => "conversations",
            StreamKind::Messages => "messages",
            StreamKind::Consent => "consent",
        };
        write!(f, "{}", name)
    }
}

/// A running forwarder task; stopping it drops the collaborator receiver
pub struct Subscription {
    kind: StreamKind,
    generation: u64,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(kind: StreamKind, generation: u64, task: JoinHandle<()>) -> Self {
        Self { kind, generation, task }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        debug!(stream = %self.kind, generation = self.generation, "Stopping subscription");
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
pub struct SubscriptionSet {
    active: HashMap<StreamKind, Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription, stopping any previous one of the same kind
    pub fn replace(&mut self, subscription: Subscription) {
        if let Some(previous) = self.active.insert(subscription.kind(), subscription) {
            previous.stop();
        }
    }

    /// Whether `generation` is the live subscription for `kind`
    pub fn is_current(&self, kind: StreamKind, generation: u64) -> bool {
        self.active.get(&kind).is_some_and(|s| s.generation() == generation)
    }

    /// Forget a subscription whose stream ended
    pub fn remove(&mut self, kind: StreamKind) {
        if let Some(subscription) = self.active.remove(&kind) {
            subscription.stop();
        }
    }

    pub fn is_active(&self, kind: StreamKind) -> bool {
        self.active.get(&kind).is_some_and(|s| !s.is_finished())
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn stop_all(&mut self) {
        for (_, subscription) in self.active.drain() {
            subscription.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn forever() -> JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(3600)).await })
    }

    #[tokio::test]
    async fn test_replace_keeps_one_per_kind() {
        let mut set = SubscriptionSet::new();
        set.replace(Subscription::new(StreamKind::Messages, 1, forever()));
        set.replace(Subscription::new(StreamKind::Messages, 2, forever()));
        set.replace(Subscription::new(StreamKind::Consent, 3, forever()));

        assert_eq!(set.len(), 2);
        assert!(!set.is_current(StreamKind::Messages, 1));
        assert!(set.is_current(StreamKind::Messages, 2));

        set.stop_all();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_task() {
        let task = forever();
        let subscription = Subscription::new(StreamKind::Conversations, 1, task);
        subscription.stop();
        tokio::task::yield_now().await;
    }
}
