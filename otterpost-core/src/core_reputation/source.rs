//! Reputation collaborator interface and an in-memory implementation

use crate::model::{Address, ReputationProfile};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Source of trust profiles keyed by address
#[async_trait]
pub trait ReputationSource: Send + Sync {
    /// Profile for one address; `None` if the service has none
    async fn fetch(&self, address: &Address) -> Result<Option<ReputationProfile>, ReputationError>;

    /// Profiles for many addresses in one request; missing addresses are absent
    async fn fetch_batch(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, ReputationProfile>, ReputationError>;
}

#[derive(Default)]
struct StaticState {
    profiles: HashMap<Address, ReputationProfile>,
    delays: HashMap<Address, Duration>,
    single_calls: usize,
    batch_calls: usize,
    failing: bool,
}

/// Fixed profile table with per-address latency, for tests and the demo
#[derive(Clone, Default)]
pub struct StaticReputationSource {
    state: Arc<Mutex<StaticState>>,
}

impl StaticReputationSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, profile: ReputationProfile) {
        self.lock().profiles.insert(profile.address.clone(), profile);
    }

    /// Delay answers that include `address`
    pub fn set_delay(&self, address: &Address, delay: Duration) {
        self.lock().delays.insert(address.clone(), delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// (single, batch) request counts
    pub fn calls(&self) -> (usize, usize) {
        let state = self.lock();
        (state.single_calls, state.batch_calls)
    }

    async fn wait_for(&self, addresses: &[Address]) -> Result<(), ReputationError> {
        let delay = {
            let state = self.lock();
            addresses.iter().filter_map(|a| state.delays.get(a)).max().copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().failing {
            return Err(ReputationError::Connection("reputation service unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReputationSource for StaticReputationSource {
    async fn fetch(&self, address: &Address) -> Result<Option<ReputationProfile>, ReputationError> {
        self.lock().single_calls += 1;
        self.wait_for(std::slice::from_ref(address)).await?;
        Ok(self.lock().profiles.get(address).cloned())
    }

    async fn fetch_batch(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, ReputationProfile>, ReputationError> {
        self.lock().batch_calls += 1;
        self.wait_for(addresses).await?;
        let state = self.lock();
        Ok(addresses
            .iter()
            .filter_map(|a| state.profiles.get(a).map(|p| (a.clone(), p.clone())))
            .collect())
    }
}
