#![forbid(unsafe_code)]
//! thinpd public API facade.
//!
//! Re-exports the metadata engine through one stable interface. Checker,
//! dumper and repair tools depend on this crate rather than on the layer
//! crates.

pub use pd_block::{
    BlockBuf, BlockCache, BlockDevice, ByteBlockDevice, ByteDevice, CacheStats, FileByteDevice,
    MemBlockDevice,
};
pub use pd_btree::{
    BTree, Iter, NoOpRefCounter, NodeDamage, RefCounter, SubtreeRefCounter, ValueType,
    ValueVisitor, WalkOptions, walk_btree,
};
pub use pd_error::{PdError, Result};
pub use pd_thin::*;
pub use pd_tm::{CoreSpaceMap, SpaceMap, TransactionManager};
pub use pd_types::{BlockNumber, BlockSize, MD_BLOCK_SIZE, Run, RunSet};
