//! Per-backend slot preference orderings.
//!
//! Each backend gets an `offset` and a `skip` derived from its identity, and
//! its preference list is `(offset + j * skip) mod M` for `j` in `[0, M)`.
//! With `M` prime and `skip` in `[1, M-1]` that list visits every slot
//! exactly once.

use crate::config::RealServer;
use crate::error::{Error, Result};

const OFFSET_SEED: u32 = 0x6d61_676c;
const SKIP_SEED: u32 = 0x736b_6970;

/// Largest accepted lookup table size. Each backend's preference list holds
/// one `u32` per slot.
pub const MAX_TABLE_SIZE: u32 = 65537 * 16;

pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let n = n as u64;
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    backend: RealServer,
    offset: u32,
    skip: u32,
    order: Box<[u32]>,
}

impl Permutation {
    /// `table_size` must be prime; [`PermutationSet::generate`] checks it.
    fn generate(backend: RealServer, table_size: u32) -> Permutation {
        let identity = backend.identity();
        let m = table_size as u64;
        let offset = mur3::murmurhash3_x86_32(&identity, OFFSET_SEED) as u64 % m;
        let skip = mur3::murmurhash3_x86_32(&identity, SKIP_SEED) as u64 % (m - 1) + 1;

        let mut order = Vec::with_capacity(table_size as usize);
        let mut slot = offset;
        for _ in 0..table_size {
            order.push(slot as u32);
            slot = (slot + skip) % m;
        }

        Permutation {
            backend,
            offset: offset as u32,
            skip: skip as u32,
            order: order.into_boxed_slice(),
        }
    }

    pub fn backend(&self) -> &RealServer {
        &self.backend
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn skip(&self) -> u32 {
        self.skip
    }

    /// The `j`-th preferred slot.
    pub fn get(&self, j: usize) -> Option<u32> {
        self.order.get(j).copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.order
    }
}

/// Preference lists for every backend of one registry generation, in
/// registry order. Read-only once generated.
#[derive(Debug, Clone)]
pub struct PermutationSet {
    table_size: u32,
    rows: Vec<Permutation>,
}

impl PermutationSet {
    pub fn generate(backends: &[RealServer], table_size: u32) -> Result<PermutationSet> {
        if table_size > MAX_TABLE_SIZE || !is_prime(table_size) {
            return Err(Error::InvalidTableSize(table_size));
        }
        let rows = backends
            .iter()
            .map(|backend| Permutation::generate(*backend, table_size))
            .collect();
        Ok(PermutationSet { table_size, rows })
    }

    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Permutation] {
        &self.rows
    }

    #[cfg(test)]
    pub(crate) fn from_rows(table_size: u32, rows: Vec<(RealServer, Vec<u32>)>) -> PermutationSet {
        let rows = rows
            .into_iter()
            .map(|(backend, order)| Permutation {
                backend,
                offset: order.first().copied().unwrap_or(0),
                skip: 0,
                order: order.into_boxed_slice(),
            })
            .collect();
        PermutationSet { table_size, rows }
    }
}
