//! Reference-count ledgers for metadata and data blocks.
//!
//! A space map records, per block, how many live references reach it. A
//! count of zero means the block is free. Both the metadata device (tree
//! nodes) and the data device (blocks named by mappings) are tracked through
//! the same [`SpaceMap`] trait.

use parking_lot::Mutex;
use pd_error::{PdError, Result};
use tracing::{error, trace};

/// Per-block reference counts.
///
/// Methods take `&self`; implementations provide their own interior
/// mutability so a single ledger can be shared by every tree and ref-count
/// policy taking part in a transaction.
pub trait SpaceMap: Send + Sync {
    /// Number of blocks tracked.
    fn nr_blocks(&self) -> u64;

    /// Number of blocks whose count is zero.
    fn nr_free(&self) -> u64;

    fn get_count(&self, block: u64) -> Result<u32>;

    fn set_count(&self, block: u64, count: u32) -> Result<()>;

    /// Increment and return the new count.
    fn inc(&self, block: u64) -> Result<u32>;

    /// Decrement and return the new count.
    ///
    /// Fails with [`PdError::RefCountUnderflow`] if the count is already zero.
    fn dec(&self, block: u64) -> Result<u32>;

    /// Find a free block, set its count to one and return it.
    fn alloc(&self) -> Result<u64>;
}

#[derive(Debug)]
struct CoreState {
    counts: Vec<u32>,
    nr_free: u64,
    /// Next block the allocator inspects.
    cursor: usize,
}

impl CoreState {
    fn slot(&self, block: u64) -> Result<usize> {
        usize::try_from(block)
            .ok()
            .filter(|idx| *idx < self.counts.len())
            .ok_or_else(|| {
                PdError::Format(format!(
                    "space map block out of range: block={block} nr_blocks={}",
                    self.counts.len()
                ))
            })
    }
}

/// In-memory space map.
#[derive(Debug)]
pub struct CoreSpaceMap {
    state: Mutex<CoreState>,
}

impl CoreSpaceMap {
    #[must_use]
    pub fn new(nr_blocks: u64) -> Self {
        let len = usize::try_from(nr_blocks).unwrap_or(usize::MAX);
        Self {
            state: Mutex::new(CoreState {
                counts: vec![0; len],
                nr_free: len as u64,
                cursor: 0,
            }),
        }
    }

    /// Count of every block, in block order.
    #[must_use]
    pub fn snapshot_counts(&self) -> Vec<u32> {
        self.state.lock().counts.clone()
    }
}

impl SpaceMap for CoreSpaceMap {
    fn nr_blocks(&self) -> u64 {
        self.state.lock().counts.len() as u64
    }

    fn nr_free(&self) -> u64 {
        self.state.lock().nr_free
    }

    fn get_count(&self, block: u64) -> Result<u32> {
        let state = self.state.lock();
        let idx = state.slot(block)?;
        Ok(state.counts[idx])
    }

    fn set_count(&self, block: u64, count: u32) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state.slot(block)?;
        let old = state.counts[idx];
        state.counts[idx] = count;
        match (old == 0, count == 0) {
            (true, false) => state.nr_free -= 1,
            (false, true) => state.nr_free += 1,
            _ => {}
        }
        drop(state);
        Ok(())
    }

    fn inc(&self, block: u64) -> Result<u32> {
        let mut state = self.state.lock();
        let idx = state.slot(block)?;
        let old = state.counts[idx];
        let new = old
            .checked_add(1)
            .ok_or_else(|| PdError::ValueOutOfRange(format!("ref count overflow at block {block}")))?;
        state.counts[idx] = new;
        if old == 0 {
            state.nr_free -= 1;
        }
        drop(state);
        Ok(new)
    }

    fn dec(&self, block: u64) -> Result<u32> {
        let mut state = self.state.lock();
        let idx = state.slot(block)?;
        let old = state.counts[idx];
        if old == 0 {
            drop(state);
            error!(block, "space_map_refcount_underflow");
            return Err(PdError::RefCountUnderflow { block });
        }
        let new = old - 1;
        state.counts[idx] = new;
        if new == 0 {
            state.nr_free += 1;
        }
        drop(state);
        Ok(new)
    }

    fn alloc(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let len = state.counts.len();
        if state.nr_free == 0 || len == 0 {
            return Err(PdError::NoSpace);
        }
        let start = state.cursor % len;
        let found = (start..len)
            .chain(0..start)
            .find(|idx| state.counts[*idx] == 0)
            .ok_or(PdError::NoSpace)?;
        state.counts[found] = 1;
        state.nr_free -= 1;
        state.cursor = found + 1;
        drop(state);
        trace!(block = found, "space_map_alloc");
        Ok(found as u64)
    }
}

impl<T: SpaceMap + ?Sized> SpaceMap for &T {
    fn nr_blocks(&self) -> u64 {
        (**self).nr_blocks()
    }

    fn nr_free(&self) -> u64 {
        (**self).nr_free()
    }

    fn get_count(&self, block: u64) -> Result<u32> {
        (**self).get_count(block)
    }

    fn set_count(&self, block: u64, count: u32) -> Result<()> {
        (**self).set_count(block, count)
    }

    fn inc(&self, block: u64) -> Result<u32> {
        (**self).inc(block)
    }

    fn dec(&self, block: u64) -> Result<u32> {
        (**self).dec(block)
    }

    fn alloc(&self) -> Result<u64> {
        (**self).alloc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn alloc_rotates_and_reports_no_space() {
        let sm = CoreSpaceMap::new(3);
        assert_eq!(sm.alloc().unwrap(), 0);
        assert_eq!(sm.alloc().unwrap(), 1);
        sm.dec(0).unwrap();
        // Cursor keeps moving forward before wrapping to reuse block 0.
        assert_eq!(sm.alloc().unwrap(), 2);
        assert_eq!(sm.alloc().unwrap(), 0);
        assert!(matches!(sm.alloc(), Err(PdError::NoSpace)));
        assert_eq!(sm.nr_free(), 0);
    }

    #[test]
    fn dec_at_zero_is_an_error_not_a_clamp() {
        let sm = CoreSpaceMap::new(4);
        assert!(matches!(
            sm.dec(2),
            Err(PdError::RefCountUnderflow { block: 2 })
        ));
        assert_eq!(sm.get_count(2).unwrap(), 0);
    }

    #[test]
    fn set_count_tracks_free_blocks() {
        let sm = CoreSpaceMap::new(4);
        sm.set_count(1, 5).unwrap();
        assert_eq!(sm.nr_free(), 3);
        assert_eq!(sm.inc(1).unwrap(), 6);
        sm.set_count(1, 0).unwrap();
        assert_eq!(sm.nr_free(), 4);
        assert!(sm.get_count(4).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn nr_free_matches_zero_counts(ops in proptest::collection::vec((0_u64..16, any::<bool>()), 0..200)) {
            let sm = CoreSpaceMap::new(16);
            for (block, up) in ops {
                if up {
                    sm.inc(block).unwrap();
                } else {
                    let before = sm.get_count(block).unwrap();
                    let res = sm.dec(block);
                    prop_assert_eq!(res.is_err(), before == 0);
                }
            }
            let zeros = sm.snapshot_counts().iter().filter(|c| **c == 0).count() as u64;
            prop_assert_eq!(sm.nr_free(), zeros);
        }
    }
}
