//! Per-remote-address hostname miss/hit tracking, used as a brute-force
//! and domain-scanning signal by the dispatcher.

use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Unique missed domains beyond which an address is considered negative
const NEGATIVE_MISS_THRESHOLD: usize = 6;
/// Misses older than this are forgotten
const MISS_DECAY_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Every this-many hits forgives one recorded miss
const HITS_PER_FORGIVENESS: u64 = 10;

/// Miss/hit history for one remote address.
#[derive(Debug, Default)]
pub struct Reputation {
    pub total_misses: u64,
    pub total_hits: u64,
    /// Domain that missed → time of the most recent miss
    missed_domains: HashMap<String, Instant>,
}

impl Reputation {
    pub fn register_miss(&mut self, domain: &str, now: Instant) {
        self.total_misses += 1;
        self.missed_domains.insert(domain.to_string(), now);
    }

    /// Record a successful resolution. Every tenth hit forgives the oldest
    /// recorded miss, so well-behaved clients recover over time.
    pub fn register_hit(&mut self) {
        self.total_hits += 1;
        if self.total_hits % HITS_PER_FORGIVENESS == 0 {
            let oldest = self
                .missed_domains
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(domain, _)| domain.clone());
            if let Some(domain) = oldest {
                self.missed_domains.remove(&domain);
            }
        }
    }

    fn prune_expired(&mut self, now: Instant) {
        self.missed_domains
            .retain(|_, at| now.duration_since(*at) < MISS_DECAY_WINDOW);
    }

    /// True when this address has missed more unique domains than the
    /// threshold within the decay window.
    pub fn is_negative(&mut self, now: Instant) -> bool {
        self.prune_expired(now);
        self.missed_domains.len() > NEGATIVE_MISS_THRESHOLD
    }

    pub fn unique_misses(&self) -> usize {
        self.missed_domains.len()
    }
}

/// Reputation entries keyed by remote IP.
#[derive(Debug, Default)]
pub struct ReputationTracker {
    entries: DashMap<IpAddr, Reputation>,
}

impl ReputationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hostname miss and report whether the address is now
    /// considered negative.
    pub fn register_miss(&self, addr: IpAddr, domain: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(addr).or_default();
        entry.register_miss(domain, now);
        entry.is_negative(now)
    }

    pub fn register_hit(&self, addr: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&addr) {
            entry.register_hit();
        }
    }

    pub fn is_negative(&self, addr: IpAddr) -> bool {
        match self.entries.get_mut(&addr) {
            Some(mut entry) => entry.is_negative(Instant::now()),
            None => false,
        }
    }

    pub fn tracked_addresses(&self) -> usize {
        self.entries.len()
    }
}
