//! Test fixtures
//!
//! [`TestWorld`] is one signed-in identity on an [`InMemoryNetwork`] with
//! in-memory reputation and key/value stores. Peers are registered by small
//! integers so addresses stay readable in assertions.

use crate::core_protocol::memory::{InMemoryBackend, InMemoryFactory, InMemoryNetwork};
use crate::core_protocol::MessagingBackend;
use crate::core_reputation::StaticReputationSource;
use crate::core_session::{Session, SessionContext, SessionHandle};
use crate::core_unread::{KeyValueStore, MemoryKvStore};
use crate::model::{Address, ConversationId, InboxId, ReputationProfile};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Deterministic address for fixture `n`
pub fn test_address(n: u8) -> Address {
    Address::from_network(format!("0x{:040x}", n))
}

pub fn test_profile(n: u8, score: f64) -> ReputationProfile {
    ReputationProfile {
        address: test_address(n),
        score,
        level: if score >= 50.0 { "trusted" } else { "new" }.to_string(),
        review_count: n as u32,
        vouch_count: 0,
    }
}

/// A registered peer
#[derive(Debug, Clone)]
pub struct TestPeer {
    pub address: Address,
    pub inbox_id: InboxId,
}

pub struct TestWorld {
    pub network: InMemoryNetwork,
    pub me: TestPeer,
    pub backend: Arc<InMemoryBackend>,
    pub reputation: StaticReputationSource,
    pub store: Arc<dyn KeyValueStore>,
}

impl TestWorld {
    /// Identity 1 signed in on a fresh network
    pub fn new() -> Self {
        let network = InMemoryNetwork::new();
        let address = test_address(1);
        let backend = network.client(&address);
        let me = TestPeer { address, inbox_id: backend.inbox_id() };
        Self {
            network,
            me,
            backend,
            reputation: StaticReputationSource::new(),
            store: Arc::new(MemoryKvStore::new()),
        }
    }

    pub fn factory(&self) -> Arc<InMemoryFactory> {
        Arc::new(InMemoryFactory::new(self.network.clone()))
    }

    pub fn add_peer(&self, n: u8) -> TestPeer {
        let address = test_address(n);
        let inbox_id = self.network.register(&address);
        TestPeer { address, inbox_id }
    }

    /// DM initiated by the peer
    pub fn dm_from(&self, peer: &TestPeer) -> ConversationId {
        self.network.create_dm(&peer.inbox_id, &self.me.inbox_id)
    }

    pub fn context(&self) -> SessionContext {
        SessionContext::new(
            self.backend.clone(),
            Arc::new(self.reputation.clone()),
            self.store.clone(),
        )
    }

    pub fn spawn_session(&self) -> (SessionHandle, JoinHandle<()>) {
        Session::spawn(self.context())
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}
