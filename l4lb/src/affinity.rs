//! Flow affinity cache.
//!
//! Remembers which backend each active flow was sent to so that a table
//! rebuild never moves a flow mid-connection. Bounded by entry count, and
//! flows idle for longer than the idle timeout are dropped. Built on
//! `moka::sync::Cache`, which shards internally so packet-path lookups and
//! inserts never contend on a single lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use l4lb_common::FiveTuple;
use log::{debug, trace};
use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::config::RealServer;
use crate::error::{Error, Result};
use crate::flow::FlowHasher;
use crate::hash::LookupTable;

#[derive(Debug, Default)]
struct AffinityCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AffinityStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits dropped because their backend left the backend set.
    pub stale: u64,
    /// Entries pushed out by the capacity bound.
    pub evictions: u64,
    /// Entries dropped after the idle timeout.
    pub expirations: u64,
    pub entries: u64,
}

pub struct AffinityCache {
    cache: Cache<FiveTuple, RealServer>,
    counters: Arc<AffinityCounters>,
    capacity: u64,
    idle_timeout: Duration,
}

impl AffinityCache {
    pub fn new(capacity: u64, idle_timeout: Duration) -> Self {
        AffinityCache::with_counters(capacity, idle_timeout, Arc::default())
    }

    fn with_counters(capacity: u64, idle_timeout: Duration, counters: Arc<AffinityCounters>) -> Self {
        let listener_counters = Arc::clone(&counters);

        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(idle_timeout)
            .eviction_listener(move |_flow, _backend, cause| match cause {
                RemovalCause::Size => {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Expired => {
                    listener_counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                RemovalCause::Explicit | RemovalCause::Replaced => {}
            })
            .build();

        AffinityCache {
            cache,
            counters,
            capacity,
            idle_timeout,
        }
    }

    /// A cache with new bounds holding this one's live entries. Counters
    /// are shared with `self`.
    pub fn resized(&self, capacity: u64, idle_timeout: Duration) -> AffinityCache {
        let resized = AffinityCache::with_counters(capacity, idle_timeout, Arc::clone(&self.counters));
        resized.absorb(self);
        resized
    }

    /// Copy every entry of `other` this cache doesn't have yet.
    pub fn absorb(&self, other: &AffinityCache) {
        for (flow, backend) in other.cache.iter() {
            self.cache.get_with(*flow, || backend);
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Cached backend for `flow`, refreshing its idle timer.
    pub fn get(&self, flow: &FiveTuple) -> Option<RealServer> {
        self.cache.get(flow)
    }

    /// Backend for `flow`: the remembered one if the flow is known and its
    /// backend is still in `table`, otherwise the table's choice for the
    /// flow's slot, which is then remembered.
    ///
    /// Concurrent first packets of one flow all get the same answer; only
    /// one of them stores an entry.
    pub fn resolve(
        &self,
        flow: &FiveTuple,
        table: &LookupTable,
        hasher: &FlowHasher,
    ) -> Result<RealServer> {
        if let Some(backend) = self.cache.get(flow) {
            if table.backends().contains(&backend) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!("affinity hit {:?} -> {}", flow, backend);
                return Ok(backend);
            }
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            debug!("affinity entry {:?} -> {} points at a removed backend", flow, backend);
            self.cache.invalidate(flow);
        }

        if table.is_empty() {
            return Err(Error::UnroutableFlow);
        }
        let slot = hasher.slot(flow, table.len());
        let candidate = *table.get(slot).ok_or(Error::UnroutableFlow)?;
        let backend = self.cache.get_with(*flow, || candidate);

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("affinity miss {:?} -> slot {} -> {}", flow, slot, backend);
        Ok(backend)
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Apply pending evictions and expirations now instead of lazily.
    pub fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }

    /// Approximate entry count.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AffinityStats {
        AffinityStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}
