#![forbid(unsafe_code)]
//! Copy-on-write transaction manager.
//!
//! Trees never write a block that another path may still reach. Before a
//! node is modified it is *shadowed*: if the metadata space map says more
//! than one reference reaches the block, the node is copied to a freshly
//! allocated block and the original loses one reference. Otherwise the
//! node is modified in place.
//!
//! The manager is shared by reference between every tree and ref-count
//! policy taking part in a transaction; it owns no tree state itself.

pub mod space_map;

pub use space_map::{CoreSpaceMap, SpaceMap};

use pd_block::{BlockBuf, BlockDevice};
use pd_error::{PdError, Result};
use pd_types::BlockNumber;
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome of [`TransactionManager::shadow_block`].
#[derive(Debug, Clone)]
pub struct Shadow {
    /// Block the caller must write its modified node to.
    pub block: u64,
    /// Current contents of the node.
    pub data: BlockBuf,
    /// The node was copied away from a shared block. Everything the copy
    /// references gained a referrer and must be incremented by the caller.
    pub copied: bool,
}

pub struct TransactionManager {
    dev: Arc<dyn BlockDevice>,
    sm: Arc<dyn SpaceMap>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("block_size", &self.dev.block_size())
            .field("nr_blocks", &self.sm.nr_blocks())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Bind a metadata device to the space map tracking its blocks.
    pub fn new(dev: Arc<dyn BlockDevice>, sm: Arc<dyn SpaceMap>) -> Result<Self> {
        if sm.nr_blocks() > dev.block_count() {
            return Err(PdError::Format(format!(
                "space map tracks {} blocks but device has {}",
                sm.nr_blocks(),
                dev.block_count()
            )));
        }
        Ok(Self { dev, sm })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    #[must_use]
    pub fn space_map(&self) -> &dyn SpaceMap {
        self.sm.as_ref()
    }

    // ── Transaction boundaries ──────────────────────────────────────────────

    /// Start a transaction.
    pub fn begin(&self) {
        debug!(free_blocks = self.sm.nr_free(), "transaction_begin");
    }

    /// Flush the device and close the transaction.
    pub fn commit(&self) -> Result<()> {
        self.dev.sync()?;
        debug!(free_blocks = self.sm.nr_free(), "transaction_commit");
        Ok(())
    }

    // ── Block access ────────────────────────────────────────────────────────

    pub fn read_block(&self, block: u64) -> Result<BlockBuf> {
        self.dev.read_block(BlockNumber(block))
    }

    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        self.dev.write_block(BlockNumber(block), data)
    }

    /// Allocate an unused block with a reference count of one.
    pub fn new_block(&self) -> Result<u64> {
        let block = self.sm.alloc()?;
        trace!(block, "tm_new_block");
        Ok(block)
    }

    /// Prepare `block` for modification.
    ///
    /// A block reached by a single reference is returned as is. A shared
    /// block is copied to a new block and the original's count drops by
    /// one; its other referrers keep seeing the unmodified contents.
    pub fn shadow_block(&self, block: u64) -> Result<Shadow> {
        let count = self.sm.get_count(block)?;
        if count == 0 {
            return Err(PdError::Corruption {
                block,
                detail: "shadow of a block with no references".to_owned(),
            });
        }
        let data = self.read_block(block)?;
        if count == 1 {
            return Ok(Shadow {
                block,
                data,
                copied: false,
            });
        }

        let copy = self.new_block()?;
        self.write_block(copy, data.as_slice())?;
        self.sm.dec(block)?;
        trace!(
            old_block = block,
            new_block = copy,
            ref_count = count,
            "btree_shadow"
        );
        Ok(Shadow {
            block: copy,
            data,
            copied: true,
        })
    }

    // ── Reference counts ────────────────────────────────────────────────────

    pub fn inc_block(&self, block: u64) -> Result<u32> {
        self.sm.inc(block)
    }

    /// Drop a reference; returns the remaining count.
    pub fn dec_block(&self, block: u64) -> Result<u32> {
        self.sm.dec(block)
    }

    pub fn ref_count(&self, block: u64) -> Result<u32> {
        self.sm.get_count(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_block::MemBlockDevice;

    fn tm(blocks: u64) -> TransactionManager {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(512, blocks));
        let sm: Arc<dyn SpaceMap> = Arc::new(CoreSpaceMap::new(blocks));
        TransactionManager::new(dev, sm).expect("tm")
    }

    #[test]
    fn shadow_of_unshared_block_is_in_place() {
        let tm = tm(8);
        let b = tm.new_block().unwrap();
        tm.write_block(b, &[4_u8; 512]).unwrap();

        let shadow = tm.shadow_block(b).unwrap();
        assert_eq!(shadow.block, b);
        assert!(!shadow.copied);
        assert_eq!(tm.ref_count(b).unwrap(), 1);
    }

    #[test]
    fn shadow_of_shared_block_copies_and_drops_one_reference() {
        let tm = tm(8);
        let b = tm.new_block().unwrap();
        tm.write_block(b, &[9_u8; 512]).unwrap();
        tm.inc_block(b).unwrap();

        let shadow = tm.shadow_block(b).unwrap();
        assert_ne!(shadow.block, b);
        assert!(shadow.copied);
        assert_eq!(tm.ref_count(b).unwrap(), 1);
        assert_eq!(tm.ref_count(shadow.block).unwrap(), 1);
        assert_eq!(tm.read_block(shadow.block).unwrap().as_slice(), &[9_u8; 512]);
    }

    #[test]
    fn shadow_of_free_block_is_corruption() {
        let tm = tm(4);
        assert!(matches!(
            tm.shadow_block(3),
            Err(PdError::Corruption { block: 3, .. })
        ));
    }

    #[test]
    fn committed_blocks_keep_their_contents() {
        let tm = tm(4);
        tm.begin();
        let b = tm.new_block().unwrap();
        tm.write_block(b, &[7_u8; 512]).unwrap();
        tm.commit().unwrap();
        assert_eq!(tm.read_block(b).unwrap().as_slice(), &[7_u8; 512]);
        assert_eq!(tm.ref_count(b).unwrap(), 1);
    }

    #[test]
    fn space_map_larger_than_device_is_rejected() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(512, 4));
        let sm: Arc<dyn SpaceMap> = Arc::new(CoreSpaceMap::new(8));
        assert!(TransactionManager::new(dev, sm).is_err());
    }
}
