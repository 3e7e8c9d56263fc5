//! Reputation Cache
//!
//! TTL cache of trust profiles keyed by lowercased address. Lookups that find
//! a fresh entry never reach the network; addresses already being fetched are
//! not requested twice. "No profile" answers are cached like profiles so an
//! unknown address is not re-requested on every preview rebuild.
//!
//! Time is passed in explicitly so the owner (the session loop) decides
//! the clock.

use super::source::ReputationSource;
use crate::metrics;
use crate::model::{Address, ReputationProfile};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry {
    profile: Option<ReputationProfile>,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct ReputationCache {
    entries: HashMap<Address, CacheEntry>,
    in_flight: HashSet<Address>,
    ttl: Duration,
    sweep_interval: Duration,
    last_sweep: Option<Instant>,
}

impl Default for ReputationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_SWEEP_INTERVAL)
    }
}

impl ReputationCache {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashSet::new(),
            ttl,
            sweep_interval,
            last_sweep: None,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.fetched_at) < self.ttl
    }

    /// Fresh cached answer: `Some(None)` means "known to have no profile"
    pub fn lookup(&self, address: &Address, now: Instant) -> Option<Option<&ReputationProfile>> {
        self.entries
            .get(address)
            .filter(|e| self.is_fresh(e, now))
            .map(|e| e.profile.as_ref())
    }

    pub fn profile(&self, address: &Address, now: Instant) -> Option<&ReputationProfile> {
        self.lookup(address, now).flatten()
    }

    /// Addresses that need a network fetch; marks them in flight
    pub fn plan_fetch(&mut self, addresses: &[Address], now: Instant) -> Vec<Address> {
        let mut needed = Vec::new();
        for address in addresses {
            if self.lookup(address, now).is_some() {
                metrics::increment(metrics::REPUTATION_HITS);
                continue;
            }
            if self.in_flight.contains(address) || needed.contains(address) {
                continue;
            }
            metrics::increment(metrics::REPUTATION_MISSES);
            needed.push(address.clone());
        }
        self.in_flight.extend(needed.iter().cloned());
        needed
    }

    /// Store the answer for a planned fetch
    pub fn complete(
        &mut self,
        requested: &[Address],
        mut found: HashMap<Address, ReputationProfile>,
        now: Instant,
    ) {
        for address in requested {
            self.in_flight.remove(address);
            let profile = found.remove(address);
            self.entries.insert(address.clone(), CacheEntry { profile, fetched_at: now });
        }
    }

    /// A planned fetch failed; nothing is cached so the next lookup retries
    pub fn fail(&mut self, requested: &[Address]) {
        for address in requested {
            self.in_flight.remove(address);
        }
    }

    /// Drop expired entries, at most once per sweep interval
    pub fn maybe_sweep(&mut self, now: Instant) -> Option<usize> {
        if let Some(last) = self.last_sweep {
            if now.saturating_duration_since(last) < self.sweep_interval {
                return None;
            }
        }
        self.last_sweep = Some(now);
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.fetched_at) < ttl);
        let evicted = before - self.entries.len();

        metrics::increment(metrics::REPUTATION_SWEEPS);
        metrics::increment_by(metrics::REPUTATION_EVICTED, evicted as u64);
        debug!(evicted, remaining = self.entries.len(), "Reputation cache swept");
        Some(evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
    }

    /// Plan, fetch and store in one call for hosts that own the cache directly
    ///
    /// Uses the batch endpoint whenever more than one address is needed.
    pub async fn fetch_through(
        &mut self,
        source: &dyn ReputationSource,
        addresses: &[Address],
        now: Instant,
    ) -> HashMap<Address, ReputationProfile> {
        let needed = self.plan_fetch(addresses, now);
        if !needed.is_empty() {
            match fetch_profiles(source, &needed).await {
                Ok(found) => self.complete(&needed, found, now),
                Err(e) => {
                    warn!(count = needed.len(), error = %e, "Reputation fetch failed");
                    self.fail(&needed);
                }
            }
        }
        addresses
            .iter()
            .filter_map(|a| self.profile(a, now).map(|p| (a.clone(), p.clone())))
            .collect()
    }
}

/// Single endpoint for one address, batch endpoint otherwise
pub async fn fetch_profiles(
    source: &dyn ReputationSource,
    addresses: &[Address],
) -> Result<HashMap<Address, ReputationProfile>, super::source::ReputationError> {
    match addresses {
        [] => Ok(HashMap::new()),
        [single] => Ok(source
            .fetch(single)
            .await?
            .map(|p| HashMap::from([(single.clone(), p)]))
            .unwrap_or_default()),
        many => source.fetch_batch(many).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_reputation::source::StaticReputationSource;

    fn addr(n: u8) -> Address {
        Address::from_network(format!("0x{:040x}", n))
    }

    fn profile(n: u8) -> ReputationProfile {
        ReputationProfile {
            address: addr(n),
            score: n as f64,
            level: "trusted".to_string(),
            review_count: 1,
            vouch_count: 0,
        }
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let now = Instant::now();
        let mut cache = ReputationCache::default();
        let planned = cache.plan_fetch(&[addr(1)], now);
        cache.complete(&planned, HashMap::from([(addr(1), profile(1))]), now);

        assert!(cache.profile(&addr(1), now + Duration::from_secs(299)).is_some());
        assert!(cache.profile(&addr(1), now + DEFAULT_TTL).is_none());
    }

    #[test]
    fn test_in_flight_addresses_are_not_planned_twice() {
        let now = Instant::now();
        let mut cache = ReputationCache::default();
        assert_eq!(cache.plan_fetch(&[addr(1), addr(2), addr(1)], now).len(), 2);
        assert!(cache.plan_fetch(&[addr(1)], now).is_empty());

        cache.fail(&[addr(1)]);
        assert_eq!(cache.plan_fetch(&[addr(1)], now), vec![addr(1)]);
    }

    #[test]
    fn test_missing_profiles_are_cached_as_none() {
        let now = Instant::now();
        let mut cache = ReputationCache::default();
        let planned = cache.plan_fetch(&[addr(1)], now);
        cache.complete(&planned, HashMap::new(), now);

        assert_eq!(cache.lookup(&addr(1), now), Some(None));
        assert!(cache.plan_fetch(&[addr(1)], now).is_empty());
    }

    #[test]
    fn test_sweep_runs_at_most_once_per_interval() {
        let start = Instant::now();
        let mut cache = ReputationCache::default();
        let planned = cache.plan_fetch(&[addr(1)], start);
        cache.complete(&planned, HashMap::new(), start);

        assert_eq!(cache.maybe_sweep(start), Some(0));
        assert_eq!(cache.maybe_sweep(start + Duration::from_secs(30)), None);

        let later = start + DEFAULT_TTL + Duration::from_secs(1);
        assert_eq!(cache.maybe_sweep(later), Some(1));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_through_uses_batch_for_many_and_cache_afterwards() {
        let source = StaticReputationSource::new();
        source.insert(profile(1));
        source.insert(profile(2));
        let now = Instant::now();
        let mut cache = ReputationCache::default();

        let found = cache.fetch_through(&source, &[addr(1), addr(2), addr(3)], now).await;
        assert_eq!(found.len(), 2);
        assert_eq!(source.calls(), (0, 1));

        let again = cache.fetch_through(&source, &[addr(1), addr(3)], now).await;
        assert_eq!(again.len(), 1);
        assert_eq!(source.calls(), (0, 1));

        cache.fetch_through(&source, &[addr(4)], now).await;
        assert_eq!(source.calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let source = StaticReputationSource::new();
        source.insert(profile(1));
        source.set_failing(true);
        let now = Instant::now();
        let mut cache = ReputationCache::default();

        assert!(cache.fetch_through(&source, &[addr(1)], now).await.is_empty());
        source.set_failing(false);
        assert_eq!(cache.fetch_through(&source, &[addr(1)], now).await.len(), 1);
    }
}
