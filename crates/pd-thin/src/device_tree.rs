//! Per-device records, keyed by thin device id.

use crate::damage::{Damage, DamageVisitor};
use pd_btree::{BTree, NoOpRefCounter, NodeDamage, ValueType, WalkOptions};
use pd_error::Result;
use pd_tm::TransactionManager;
use pd_types::{ParseError, ensure_slice, read_le_u32, read_le_u64, write_le_u32, write_le_u64};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEVICE_DETAILS_SIZE: usize = 24;

/// Metadata kept for one thin device.
///
/// Records never compare equal, not even to themselves, so overwriting a
/// record is always treated as a change.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub mapped_blocks: u64,
    /// Transaction that created the device.
    pub transaction_id: u64,
    pub creation_time: u32,
    pub snapshotted_time: u32,
}

impl DeviceDetails {
    #[must_use]
    pub fn new(transaction_id: u64, time: u32) -> Self {
        Self {
            mapped_blocks: 0,
            transaction_id,
            creation_time: time,
            snapshotted_time: time,
        }
    }
}

impl PartialEq for DeviceDetails {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

impl ValueType for DeviceDetails {
    const DISK_SIZE: usize = DEVICE_DETAILS_SIZE;

    fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, Self::DISK_SIZE)?;
        Ok(Self {
            mapped_blocks: read_le_u64(data, 0)?,
            transaction_id: read_le_u64(data, 8)?,
            creation_time: read_le_u32(data, 16)?,
            snapshotted_time: read_le_u32(data, 20)?,
        })
    }

    fn pack(&self, out: &mut [u8]) {
        write_le_u64(out, 0, self.mapped_blocks);
        write_le_u64(out, 8, self.transaction_id);
        write_le_u32(out, 16, self.creation_time);
        write_le_u32(out, 20, self.snapshotted_time);
    }
}

pub type DeviceTree<'a> = BTree<'a, DeviceDetails, NoOpRefCounter>;

#[must_use]
pub fn open_device_tree(tm: &TransactionManager, root: u64) -> DeviceTree<'_> {
    BTree::open(tm, root, 1, NoOpRefCounter)
}

/// Receives every device record in id order.
pub trait DeviceVisitor {
    fn visit(&mut self, dev_id: u64, details: &DeviceDetails) -> Result<()>;
}

impl<F> DeviceVisitor for F
where
    F: FnMut(u64, &DeviceDetails) -> Result<()>,
{
    fn visit(&mut self, dev_id: u64, details: &DeviceDetails) -> Result<()> {
        self(dev_id, details)
    }
}

/// Visit every device record. Unreadable nodes are reported as
/// [`Damage::MissingDevices`] over the ids they could have held.
pub fn walk_device_tree(
    tree: &DeviceTree<'_>,
    visitor: &mut dyn DeviceVisitor,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    let mut devices = 0_u64;
    tree.walk(
        options,
        &mut |path: &[u64], details: &DeviceDetails| -> Result<()> {
            devices += 1;
            visitor.visit(path[0], details)
        },
        &mut |node: NodeDamage| damage.visit(Damage::devices(node)),
    )?;
    debug!(root = tree.root(), devices, "device_tree_walk_done");
    Ok(())
}

/// Validate the structure only.
pub fn check_device_tree(
    tree: &DeviceTree<'_>,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    walk_device_tree(tree, &mut |_: u64, _: &DeviceDetails| -> Result<()> { Ok(()) }, damage, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_block::{BlockDevice, MemBlockDevice};
    use pd_btree::Node;
    use pd_tm::{CoreSpaceMap, SpaceMap};
    use pd_types::{BlockNumber, Run, RunSet};
    use std::sync::Arc;

    fn tm(block_size: u32) -> (Arc<MemBlockDevice>, TransactionManager) {
        let dev = Arc::new(MemBlockDevice::new(block_size, 1024));
        let sm: Arc<dyn SpaceMap> = Arc::new(CoreSpaceMap::new(1024));
        let tm = TransactionManager::new(Arc::clone(&dev) as Arc<dyn BlockDevice>, sm).expect("tm");
        (dev, tm)
    }

    fn details(mapped_blocks: u64, transaction_id: u64, creation_time: u32) -> DeviceDetails {
        DeviceDetails {
            mapped_blocks,
            transaction_id,
            creation_time,
            snapshotted_time: 0,
        }
    }

    #[test]
    fn details_codec_layout() {
        let d = DeviceDetails {
            mapped_blocks: 100,
            transaction_id: 5,
            creation_time: 10,
            snapshotted_time: 3,
        };
        let mut buf = [0_u8; DEVICE_DETAILS_SIZE];
        d.pack(&mut buf);
        assert_eq!(&buf[0..8], &100_u64.to_le_bytes());
        assert_eq!(&buf[16..20], &10_u32.to_le_bytes());
        let back = DeviceDetails::unpack(&buf).unwrap();
        assert_eq!(back.mapped_blocks, 100);
        assert_eq!(back.transaction_id, 5);
        assert_eq!(back.creation_time, 10);
        assert_eq!(back.snapshotted_time, 3);
        assert!(DeviceDetails::unpack(&buf[..23]).is_err());
    }

    #[test]
    fn details_never_compare_equal() {
        let d = DeviceDetails::new(1, 1);
        let same = d;
        assert_ne!(d, same);
    }

    #[test]
    fn walk_visits_in_id_order() {
        let (_dev, tm) = tm(4096);
        let mut tree = DeviceTree::create(&tm, 1, NoOpRefCounter).unwrap();
        tree.insert(&[2], &details(50, 6, 12)).unwrap();
        tree.insert(&[1], &details(100, 5, 10)).unwrap();

        let mut seen = Vec::new();
        let mut damage: Vec<Damage> = Vec::new();
        walk_device_tree(
            &tree,
            &mut |id: u64, d: &DeviceDetails| -> Result<()> {
                seen.push((id, d.mapped_blocks, d.transaction_id, d.creation_time));
                Ok(())
            },
            &mut damage,
            WalkOptions::default(),
        )
        .unwrap();
        assert_eq!(seen, vec![(1, 100, 5, 10), (2, 50, 6, 12)]);
        assert!(damage.is_empty());
    }

    #[test]
    fn damaged_leaf_becomes_missing_devices() {
        let (dev, tm) = tm(512);
        let mut tree = DeviceTree::create(&tm, 1, NoOpRefCounter).unwrap();
        for id in 0..60_u64 {
            tree.insert(&[id], &details(id, 1, 1)).unwrap();
        }
        let data = tm.read_block(tree.root()).unwrap();
        let root = Node::<DeviceDetails>::unpack(
            tree.root(),
            data.as_slice(),
            pd_btree::NodeCheck::relaxed(),
        )
        .unwrap();
        let pd_btree::node::Entries::Children(children) = root.entries else {
            panic!("expected an internal root");
        };
        let victim = children[0];
        dev.fail_reads(BlockNumber(victim));

        let mut damage: Vec<Damage> = Vec::new();
        let mut seen = 0_u64;
        walk_device_tree(
            &tree,
            &mut |_: u64, _: &DeviceDetails| -> Result<()> {
                seen += 1;
                Ok(())
            },
            &mut damage,
            WalkOptions::tolerant(),
        )
        .unwrap();
        assert_eq!(damage.len(), 1);
        let Damage::MissingDevices(missing) = &damage[0] else {
            panic!("expected missing devices, got {:?}", damage[0]);
        };
        assert_eq!(missing.keys, RunSet::from(Run::new(0, root.keys[1] - 1)));
        assert_eq!(seen, 60 - root.keys[1]);

        let mut damage: Vec<Damage> = Vec::new();
        assert!(check_device_tree(&tree, &mut damage, WalkOptions::strict()).is_err());
        assert_eq!(damage.len(), 1);
    }
}
