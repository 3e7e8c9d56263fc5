/*
    resolver.rs - Inbox id to chain address lookup

    One network round trip per batch. The network may report inbox ids in a
    different casing than the caller used; results are matched
    case-insensitively and returned under the caller's original key.

    Lookups never fail as a whole: a failed round trip or a missing entry
    yields `None` for the affected ids.
*/

use crate::core_protocol::MessagingBackend;
use crate::model::{Address, InboxId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves inbox ids through the protocol collaborator
#[derive(Clone)]
pub struct IdentityResolver {
    backend: Arc<dyn MessagingBackend>,
}

impl IdentityResolver {
    pub fn new(backend: Arc<dyn MessagingBackend>) -> Self {
        Self { backend }
    }

    /// Resolve a single inbox id
    pub async fn resolve(&self, inbox_id: &InboxId) -> Option<Address> {
        self.resolve_batch(std::slice::from_ref(inbox_id))
            .await
            .remove(inbox_id)
            .flatten()
    }

    /// Resolve many inbox ids in one round trip
    ///
    /// Every requested id appears in the result; duplicates collapse.
    pub async fn resolve_batch(&self, inbox_ids: &[InboxId]) -> HashMap<InboxId, Option<Address>> {
        if inbox_ids.is_empty() {
            return HashMap::new();
        }

        let response = match self.backend.addresses_for_inboxes(inbox_ids).await {
            Ok(found) => found,
            Err(e) => {
                warn!(count = inbox_ids.len(), error = %e, "Identity lookup failed");
                HashMap::new()
            }
        };

        let by_lower: HashMap<String, Address> = response
            .into_iter()
            .map(|(key, address)| (key.to_lowercase(), address))
            .collect();

        let resolved: HashMap<InboxId, Option<Address>> = inbox_ids
            .iter()
            .map(|id| (id.clone(), by_lower.get(&id.as_str().to_lowercase()).cloned()))
            .collect();

        debug!(
            requested = inbox_ids.len(),
            resolved = resolved.values().filter(|a| a.is_some()).count(),
            "Resolved identities"
        );
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_protocol::memory::{BackendOp, InMemoryNetwork};
    use crate::core_protocol::ProtocolError;

    fn addr(n: u8) -> Address {
        Address::from_network(format!("0x{:040x}", n))
    }

    #[tokio::test]
    async fn test_batch_is_one_round_trip_and_keeps_caller_casing() {
        let network = InMemoryNetwork::new();
        let me = network.client(&addr(1));
        let bob = network.register(&addr(2));
        let carol = network.register(&addr(3));
        let resolver = IdentityResolver::new(me);

        let shouted = InboxId::new(bob.as_str().to_uppercase());
        let unknown = InboxId::new("inbox-nobody");
        let result = resolver
            .resolve_batch(&[shouted.clone(), carol.clone(), unknown.clone()])
            .await;

        assert_eq!(network.calls(BackendOp::AddressesForInboxes), 1);
        assert_eq!(result.get(&shouted), Some(&Some(addr(2))));
        assert_eq!(result.get(&carol), Some(&Some(addr(3))));
        assert_eq!(result.get(&unknown), Some(&None));
    }

    #[tokio::test]
    async fn test_failure_yields_none_for_every_id() {
        let network = InMemoryNetwork::new();
        let me = network.client(&addr(1));
        let bob = network.register(&addr(2));
        network.fail_next(BackendOp::AddressesForInboxes, ProtocolError::Network("timeout".into()));

        let resolver = IdentityResolver::new(me);
        let result = resolver.resolve_batch(&[bob.clone()]).await;
        assert_eq!(result.get(&bob), Some(&None));

        assert_eq!(resolver.resolve(&bob).await, Some(addr(2)));
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_call() {
        let network = InMemoryNetwork::new();
        let resolver = IdentityResolver::new(network.client(&addr(1)));
        assert!(resolver.resolve_batch(&[]).await.is_empty());
        assert_eq!(network.calls(BackendOp::AddressesForInboxes), 0);
    }
}
