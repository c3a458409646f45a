//! Routing engine for a single virtual service.
//!
//! The packet path only ever reads the current [`Generation`] through an
//! `ArcSwapOption`; reloads build a complete generation off to the side and
//! publish it with one pointer swap. Readers that loaded the previous
//! generation keep using it until they drop their reference.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use l4lb_common::FiveTuple;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::affinity::AffinityCache;
use crate::config::{Config, RealServer};
use crate::error::{Error, Result};
use crate::flow::{self, FlowHasher};
use crate::hash::{LookupTable, MaglevHasher};
use crate::permutation::PermutationSet;
use crate::registry::{Registry, RegistryGeneration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub table_size: u32,
    pub max_backends: usize,
    pub affinity_capacity: u64,
    pub idle_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        EngineSettings {
            table_size: config.maglev.table_size,
            max_backends: config.maglev.max_backends,
            affinity_capacity: config.affinity.capacity,
            idle_timeout: config.affinity.idle_timeout(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            table_size: 503,
            max_backends: 10,
            affinity_capacity: 65536,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// A backend set together with everything derived from it.
#[derive(Debug)]
pub struct Generation {
    registry: RegistryGeneration,
    permutations: PermutationSet,
    table: LookupTable,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.registry.id()
    }

    pub fn backends(&self) -> &[RealServer] {
        self.registry.backends()
    }

    pub fn permutations(&self) -> &PermutationSet {
        &self.permutations
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }
}

/// Everything needed to turn a backend list into a [`Generation`]. Only
/// touched with the engine's reload lock held.
struct Builder {
    settings: EngineSettings,
    registry: Registry,
    maglev: MaglevHasher,
}

impl Builder {
    fn build(&self, backends: &[RealServer]) -> Result<Generation> {
        let registry = self.registry.load(backends)?;
        let permutations = PermutationSet::generate(registry.backends(), self.maglev.table_size())?;
        let table = self.maglev.populate(&permutations)?;
        Ok(Generation {
            registry,
            permutations,
            table,
        })
    }
}

pub struct RoutingEngine {
    current: ArcSwapOption<Generation>,
    affinity: ArcSwap<AffinityCache>,
    flow_hasher: FlowHasher,
    builder: Mutex<Builder>,
}

impl RoutingEngine {
    /// An engine with no backends yet. Every flow is unroutable until the
    /// first successful [`reload`](Self::reload).
    pub fn new(settings: &EngineSettings) -> Self {
        RoutingEngine {
            current: ArcSwapOption::empty(),
            affinity: ArcSwap::from_pointee(AffinityCache::new(
                settings.affinity_capacity,
                settings.idle_timeout,
            )),
            flow_hasher: FlowHasher::default(),
            builder: Mutex::new(Builder {
                settings: settings.clone(),
                registry: Registry::new(settings.max_backends),
                maglev: MaglevHasher::new(settings.table_size),
            }),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        self.builder.lock().settings.clone()
    }

    pub fn with_backends(settings: &EngineSettings, backends: &[RealServer]) -> Result<Self> {
        let engine = RoutingEngine::new(settings);
        engine.reload(backends)?;
        Ok(engine)
    }

    /// Build a generation without publishing it.
    pub fn build(&self, backends: &[RealServer]) -> Result<Generation> {
        self.builder.lock().build(backends)
    }

    /// Replace the backend set. On error nothing changes and the previous
    /// generation, if any, keeps serving.
    pub fn reload(&self, backends: &[RealServer]) -> Result<Arc<Generation>> {
        let builder = self.builder.lock();
        self.reload_with(&builder, backends)
    }

    /// Replace the backend set under new settings. Remembered flows carry
    /// over: a new table size only changes where unseen flows land, and new
    /// affinity bounds move the live entries into a cache built to them.
    /// On error the engine keeps its old settings and generation.
    pub fn reconfigure(&self, settings: &EngineSettings, backends: &[RealServer]) -> Result<Arc<Generation>> {
        let mut builder = self.builder.lock();
        if builder.settings == *settings {
            return self.reload_with(&builder, backends);
        }

        let next = Builder {
            settings: settings.clone(),
            registry: builder.registry.with_max_backends(settings.max_backends),
            maglev: MaglevHasher::new(settings.table_size),
        };
        let generation = self.activate(&next, backends)?;

        let old = self.affinity.load_full();
        if old.capacity() != settings.affinity_capacity || old.idle_timeout() != settings.idle_timeout {
            let resized = Arc::new(old.resized(settings.affinity_capacity, settings.idle_timeout));
            self.affinity.store(Arc::clone(&resized));
            // Flows first seen by the old cache while it was being copied.
            resized.absorb(&old);
            info!(
                "affinity cache now holds {} flows for {:?} idle, carried over {} entries",
                settings.affinity_capacity,
                settings.idle_timeout,
                resized.len()
            );
        }

        *builder = next;
        Ok(generation)
    }

    fn reload_with(&self, builder: &Builder, backends: &[RealServer]) -> Result<Arc<Generation>> {
        if let Some(current) = self.current.load_full() {
            if current.backends() == backends {
                debug!("generation {} already has this backend set", current.id());
                return Ok(current);
            }
        }
        self.activate(builder, backends)
    }

    fn activate(&self, builder: &Builder, backends: &[RealServer]) -> Result<Arc<Generation>> {
        let generation = match builder.build(backends) {
            Ok(generation) => Arc::new(generation),
            Err(e) => {
                match self.current.load_full() {
                    Some(current) => warn!(
                        "rejected new backend set ({}), keeping generation {}",
                        e,
                        current.id()
                    ),
                    None => warn!("rejected new backend set ({}), no generation active", e),
                }
                return Err(e);
            }
        };

        self.current.store(Some(Arc::clone(&generation)));
        let (min, max) = generation.table().spread();
        info!(
            "activated generation {}: {} backends, {} slots, {}..={} slots per backend",
            generation.id(),
            generation.backends().len(),
            generation.table().len(),
            min,
            max
        );
        Ok(generation)
    }

    pub fn generation(&self) -> Option<Arc<Generation>> {
        self.current.load_full()
    }

    /// Pick the backend for one packet of `flow`.
    pub fn route(&self, flow: &FiveTuple) -> Result<RealServer> {
        flow::validate(flow)?;
        self.resolve(flow)
    }

    /// [`route`](Self::route) for a key the caller already validated.
    pub(crate) fn resolve(&self, flow: &FiveTuple) -> Result<RealServer> {
        let current = self.current.load();
        let generation = Option::as_ref(&current).ok_or(Error::UnroutableFlow)?;
        self.affinity.load().resolve(flow, generation.table(), &self.flow_hasher)
    }

    pub fn affinity(&self) -> Arc<AffinityCache> {
        self.affinity.load_full()
    }

    pub fn flow_hasher(&self) -> &FlowHasher {
        &self.flow_hasher
    }
}
