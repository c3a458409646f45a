use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::RealServer;
use crate::error::{Error, Result};

/// Immutable snapshot of one backend set. Replacing the set produces a new
/// generation; nothing edits one in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryGeneration {
    id: u64,
    backends: Arc<[RealServer]>,
}

impl RegistryGeneration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backends(&self) -> &[RealServer] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, backend: &RealServer) -> bool {
        self.backends.contains(backend)
    }
}

/// Hands out numbered generations for validated backend lists.
#[derive(Debug)]
pub struct Registry {
    max_backends: usize,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new(max_backends: usize) -> Self {
        Registry {
            max_backends,
            next_id: AtomicU64::new(1),
        }
    }

    /// A registry with a different bound that continues this one's
    /// generation numbering.
    pub fn with_max_backends(&self, max_backends: usize) -> Registry {
        Registry {
            max_backends,
            next_id: AtomicU64::new(self.next_id.load(Ordering::Relaxed)),
        }
    }

    /// Validate `backends` and wrap them in a new generation. Order is kept:
    /// it decides which backends get the extra slot when `M` doesn't divide
    /// evenly.
    pub fn load(&self, backends: &[RealServer]) -> Result<RegistryGeneration> {
        if backends.is_empty() {
            return Err(Error::NoBackends);
        }
        if backends.len() > self.max_backends {
            return Err(Error::TooManyBackends {
                count: backends.len(),
                max: self.max_backends,
            });
        }
        let mut seen = HashSet::with_capacity(backends.len());
        for backend in backends {
            if !seen.insert(backend) {
                return Err(Error::DuplicateBackend(*backend));
            }
        }

        Ok(RegistryGeneration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            backends: backends.into(),
        })
    }
}
