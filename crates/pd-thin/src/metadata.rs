//! Pool-level operations that keep the device and mapping trees in step.

use crate::damage::DamageVisitor;
use crate::device_tree::{DeviceDetails, DeviceTree, check_device_tree, open_device_tree};
use crate::mapping_tree::{
    BlockTime, BlockTimeRefCounter, MappingTree, check_mapping_tree, open_mapping_tree,
};
use pd_btree::{BTree, NoOpRefCounter, WalkOptions};
use pd_error::{PdError, Result};
use pd_tm::{SpaceMap, TransactionManager};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Tree roots of a pool, as recorded in its superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRoots {
    pub device_details_root: u64,
    pub data_mapping_root: u64,
}

/// The metadata of one thin pool.
///
/// Holds the two tree roots; trees are opened per operation against the
/// metadata transaction manager and the data space map.
pub struct ThinMetadata<'a> {
    tm: &'a TransactionManager,
    data_sm: &'a dyn SpaceMap,
    roots: MetadataRoots,
}

impl std::fmt::Debug for ThinMetadata<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThinMetadata")
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

impl<'a> ThinMetadata<'a> {
    /// Format empty device and mapping trees.
    pub fn create(tm: &'a TransactionManager, data_sm: &'a dyn SpaceMap) -> Result<Self> {
        let details = DeviceTree::create(tm, 1, NoOpRefCounter)?;
        let mappings = MappingTree::create(tm, 2, BlockTimeRefCounter::new(data_sm))?;
        let roots = MetadataRoots {
            device_details_root: details.root(),
            data_mapping_root: mappings.root(),
        };
        info!(
            details_root = roots.device_details_root,
            mapping_root = roots.data_mapping_root,
            "thin_metadata_format"
        );
        Ok(Self { tm, data_sm, roots })
    }

    #[must_use]
    pub fn open(tm: &'a TransactionManager, data_sm: &'a dyn SpaceMap, roots: MetadataRoots) -> Self {
        Self { tm, data_sm, roots }
    }

    #[must_use]
    pub fn roots(&self) -> MetadataRoots {
        self.roots
    }

    #[must_use]
    pub fn device_tree(&self) -> DeviceTree<'a> {
        open_device_tree(self.tm, self.roots.device_details_root)
    }

    #[must_use]
    pub fn mapping_tree(&self) -> MappingTree<'a, 'a> {
        open_mapping_tree(self.tm, self.roots.data_mapping_root, self.data_sm)
    }

    // ── Devices ─────────────────────────────────────────────────────────────

    /// Add an empty thin device.
    pub fn create_thin(&mut self, dev_id: u64, transaction_id: u64, time: u32) -> Result<()> {
        let mut details = self.device_tree();
        if details.get(&[dev_id])?.is_some() {
            return Err(PdError::Exists(format!("thin device {dev_id}")));
        }
        details.insert(&[dev_id], &DeviceDetails::new(transaction_id, time))?;

        let subtree = BTree::<BlockTime, _>::create(self.tm, 1, BlockTimeRefCounter::new(self.data_sm))?;
        let mut mappings = self.mapping_tree();
        mappings.insert_subtree(&[dev_id], subtree.root())?;

        self.roots.device_details_root = details.root();
        self.roots.data_mapping_root = mappings.root();
        debug!(dev_id, transaction_id, time, "thin_create");
        Ok(())
    }

    /// Add `snap_id` as a snapshot of `origin_id`. The two devices share
    /// every mapping until either is written.
    pub fn create_snap(
        &mut self,
        origin_id: u64,
        snap_id: u64,
        transaction_id: u64,
        time: u32,
    ) -> Result<()> {
        let mut details = self.device_tree();
        if details.get(&[snap_id])?.is_some() {
            return Err(PdError::Exists(format!("thin device {snap_id}")));
        }
        let mut origin = details.lookup(&[origin_id])?;

        let mut mappings = self.mapping_tree();
        let subtree = mappings
            .lookup_subtree(&[origin_id])?
            .ok_or_else(|| PdError::NotFound(format!("mappings of thin device {origin_id}")))?;
        self.tm.inc_block(subtree)?;
        mappings.insert_subtree(&[snap_id], subtree)?;

        origin.snapshotted_time = time;
        details.insert(&[origin_id], &origin)?;
        let snap = DeviceDetails {
            mapped_blocks: origin.mapped_blocks,
            transaction_id,
            creation_time: time,
            snapshotted_time: time,
        };
        details.insert(&[snap_id], &snap)?;

        self.roots.device_details_root = details.root();
        self.roots.data_mapping_root = mappings.root();
        debug!(origin_id, snap_id, subtree, "thin_snapshot");
        Ok(())
    }

    /// Remove a device. Mappings no snapshot still shares are released.
    pub fn delete_thin(&mut self, dev_id: u64) -> Result<()> {
        let mut details = self.device_tree();
        details.remove(&[dev_id])?;
        let mut mappings = self.mapping_tree();
        mappings.remove_subtree(&[dev_id])?;

        self.roots.device_details_root = details.root();
        self.roots.data_mapping_root = mappings.root();
        debug!(dev_id, "thin_delete");
        Ok(())
    }

    pub fn device_details(&self, dev_id: u64) -> Result<DeviceDetails> {
        self.device_tree().lookup(&[dev_id])
    }

    /// Device ids in ascending order.
    pub fn devices(&self) -> Result<Vec<u64>> {
        self.device_tree()
            .iter()
            .map(|entry| entry.map(|(key, _)| key[0]))
            .collect()
    }

    // ── Mappings ────────────────────────────────────────────────────────────

    /// Map `vblock` of `dev_id`, replacing any previous mapping.
    pub fn insert_mapping(&mut self, dev_id: u64, vblock: u64, mapping: BlockTime) -> Result<()> {
        let mut details = self.device_tree();
        let mut record = details.lookup(&[dev_id])?;

        let mut mappings = self.mapping_tree();
        let existed = mappings.get(&[dev_id, vblock])?.is_some();
        mappings.insert(&[dev_id, vblock], &mapping)?;
        self.roots.data_mapping_root = mappings.root();

        if !existed {
            record.mapped_blocks += 1;
            details.insert(&[dev_id], &record)?;
            self.roots.device_details_root = details.root();
        }
        Ok(())
    }

    /// Unmap `vblock` of `dev_id`, returning the old mapping.
    pub fn remove_mapping(&mut self, dev_id: u64, vblock: u64) -> Result<BlockTime> {
        let mut details = self.device_tree();
        let mut record = details.lookup(&[dev_id])?;

        let mut mappings = self.mapping_tree();
        let removed = mappings.remove(&[dev_id, vblock])?;
        self.roots.data_mapping_root = mappings.root();

        record.mapped_blocks = record.mapped_blocks.saturating_sub(1);
        details.insert(&[dev_id], &record)?;
        self.roots.device_details_root = details.root();
        Ok(removed)
    }

    pub fn lookup_mapping(&self, dev_id: u64, vblock: u64) -> Result<BlockTime> {
        self.mapping_tree().lookup(&[dev_id, vblock])
    }

    /// Mappings of `dev_id` as `(vblock, mapping)`, in block order.
    pub fn mappings(&self, dev_id: u64) -> Result<Vec<(u64, BlockTime)>> {
        self.mapping_tree()
            .iter_from(&[dev_id])
            .take_while(|entry| !matches!(entry, Ok((key, _)) if key[0] != dev_id))
            .map(|entry| entry.map(|(key, mapping)| (key[1], mapping)))
            .collect()
    }

    // ── Checking ────────────────────────────────────────────────────────────

    /// Walk both trees and report everything that could not be read.
    ///
    /// The mapping tree is checked even when the device tree walk fails;
    /// the first failure is returned once both reports are delivered.
    pub fn check(&self, damage: &mut dyn DamageVisitor, options: WalkOptions) -> Result<()> {
        let details = check_device_tree(&self.device_tree(), damage, options);
        let mappings = check_mapping_tree(&self.mapping_tree(), damage, options);
        details.and(mappings)
    }
}
