use std::sync::Arc;

use crate::config::RealServer;
use crate::error::{Error, Result};
use crate::permutation::PermutationSet;

pub trait ConsistentHasher {
    fn generate_hash_ring(&self, reals: &[RealServer]) -> Result<LookupTable>;
}

const EMPTY: u32 = u32::MAX;

/// Slot to backend assignment, one backend per slot.
#[derive(Debug, Clone)]
pub struct LookupTable {
    backends: Arc<[RealServer]>,
    slots: Box<[u32]>,
}

impl LookupTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&RealServer> {
        let index = *self.slots.get(slot)?;
        self.backends.get(index as usize)
    }

    pub fn backends(&self) -> &[RealServer] {
        &self.backends
    }

    /// `(slot, backend)` for every slot, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RealServer)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, index)| (slot, &self.backends[*index as usize]))
    }

    /// Number of slots owned by each backend, in registry order.
    pub fn slot_counts(&self) -> Vec<(RealServer, usize)> {
        let mut counts = vec![0usize; self.backends.len()];
        for index in self.slots.iter() {
            counts[*index as usize] += 1;
        }
        self.backends.iter().copied().zip(counts).collect()
    }

    /// Smallest and largest per-backend slot count.
    pub fn spread(&self) -> (usize, usize) {
        let counts = self.slot_counts();
        let min = counts.iter().map(|(_, c)| *c).min().unwrap_or(0);
        let max = counts.iter().map(|(_, c)| *c).max().unwrap_or(0);
        (min, max)
    }
}

/// Maglev lookup table population.
pub struct MaglevHasher {
    table_size: u32,
}

impl MaglevHasher {
    pub fn new(table_size: u32) -> Self {
        MaglevHasher { table_size }
    }

    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    fn check_fit(backends: usize, table_size: u32) -> Result<()> {
        if backends == 0 {
            return Err(Error::NoBackends);
        }
        if backends >= table_size as usize {
            return Err(Error::TableTooSmall {
                backends,
                table_size,
            });
        }
        Ok(())
    }

    /// Fill the table from already generated permutations.
    ///
    /// Backends take turns in registry order; on its turn a backend walks its
    /// own preference list from where it last stopped and claims the first
    /// free slot. Every round hands out exactly one slot per backend, so slot
    /// counts differ by at most one.
    pub fn populate(&self, permutations: &PermutationSet) -> Result<LookupTable> {
        let m = permutations.table_size();
        let n = permutations.len();
        Self::check_fit(n, m)?;

        let rows = permutations.rows();
        let table_len = m as usize;
        let mut next = vec![0usize; n];
        let mut slots = vec![EMPTY; table_len];
        let mut filled = 0usize;

        'fill: loop {
            for (i, row) in rows.iter().enumerate() {
                // A cursor can never move past M positions; if it does the
                // row was not a permutation.
                let slot = loop {
                    let candidate = match row.get(next[i]) {
                        Some(slot) if (slot as usize) < table_len => slot as usize,
                        _ => {
                            return Err(Error::AssignmentFailed {
                                backend: *row.backend(),
                                filled,
                                table_size: m,
                            })
                        }
                    };
                    if slots[candidate] == EMPTY {
                        break candidate;
                    }
                    next[i] += 1;
                };

                slots[slot] = i as u32;
                next[i] += 1;
                filled += 1;
                if filled == table_len {
                    break 'fill;
                }
            }
        }

        let backends: Arc<[RealServer]> = rows.iter().map(|row| *row.backend()).collect();
        Ok(LookupTable {
            backends,
            slots: slots.into_boxed_slice(),
        })
    }
}

impl ConsistentHasher for MaglevHasher {
    fn generate_hash_ring(&self, reals: &[RealServer]) -> Result<LookupTable> {
        let permutations = PermutationSet::generate(reals, self.table_size)?;
        self.populate(&permutations)
    }
}
