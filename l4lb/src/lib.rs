//! Maglev consistent-hashing routing engine for an L4 load balancer.
//!
//! Flows are hashed into a prime-sized lookup table built from per-backend
//! preference permutations, then pinned to the chosen backend by an affinity
//! cache that outlives table rebuilds.

pub mod affinity;
pub mod balancer;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod hash;
pub mod permutation;
pub mod registry;

pub use balancer::Balancer;
pub use config::{Config, RealServer};
pub use engine::{EngineSettings, Generation, RoutingEngine};
pub use error::{Error, ErrorKind, Result};
pub use l4lb_common::{FiveTuple, VipKey};
