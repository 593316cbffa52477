//! Virtual to physical block mappings.
//!
//! The mapping tree has two key levels, `(thin device, virtual block)`.
//! Its top level is itself a one-level tree from device id to the root of
//! that device's mapping tree, so the same root block can be opened three
//! ways:
//!
//! | View | Levels | Values |
//! |------|--------|--------|
//! | [`MappingTree`] | 2 | [`BlockTime`] |
//! | [`DevTree`] | 1 | per-device subtree roots |
//! | [`SingleMappingTree`] | 1 | [`BlockTime`], opened at a subtree root |
//!
//! Devices created as snapshots share subtrees with their origin until one
//! of them writes.

use crate::damage::{Damage, DamageVisitor};
use pd_btree::{BTree, NodeDamage, RefCounter, SubtreeRefCounter, ValueType, WalkOptions};
use pd_error::{PdError, Result};
use pd_tm::{SpaceMap, TransactionManager};
use pd_types::{ParseError, ensure_slice, read_le_u64, write_le_u64};
use serde::{Deserialize, Serialize};
use tracing::debug;

const TIME_BITS: u32 = 24;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;
/// Largest physical block a mapping can name.
pub const MAX_MAPPED_BLOCK: u64 = (1 << (64 - TIME_BITS)) - 1;
pub const MAX_MAPPING_TIME: u32 = (1 << TIME_BITS) - 1;

/// A physical block and the time it was mapped.
///
/// Two mappings are equal when they name the same block; the time is
/// not part of the identity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockTime {
    pub block: u64,
    pub time: u32,
}

impl BlockTime {
    #[must_use]
    pub fn new(block: u64, time: u32) -> Self {
        Self { block, time }
    }
}

impl PartialEq for BlockTime {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl Eq for BlockTime {}

impl ValueType for BlockTime {
    const DISK_SIZE: usize = 8;

    fn unpack(data: &[u8]) -> std::result::Result<Self, ParseError> {
        ensure_slice(data, 0, Self::DISK_SIZE)?;
        let packed = read_le_u64(data, 0)?;
        #[allow(clippy::cast_possible_truncation)]
        let time = (packed & TIME_MASK) as u32;
        Ok(Self {
            block: packed >> TIME_BITS,
            time,
        })
    }

    fn pack(&self, out: &mut [u8]) {
        write_le_u64(out, 0, (self.block << TIME_BITS) | (u64::from(self.time) & TIME_MASK));
    }

    fn check(&self) -> Result<()> {
        if self.block > MAX_MAPPED_BLOCK {
            return Err(PdError::ValueOutOfRange(format!(
                "data block {} exceeds {MAX_MAPPED_BLOCK}",
                self.block
            )));
        }
        if self.time > MAX_MAPPING_TIME {
            return Err(PdError::ValueOutOfRange(format!(
                "mapping time {} exceeds {MAX_MAPPING_TIME}",
                self.time
            )));
        }
        Ok(())
    }
}

// ── Reference counting ──────────────────────────────────────────────────────

/// Counts references to data blocks in the pool's data space map.
#[derive(Clone, Copy)]
pub struct BlockTimeRefCounter<'s> {
    data_sm: &'s dyn SpaceMap,
}

impl std::fmt::Debug for BlockTimeRefCounter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTimeRefCounter")
            .field("nr_blocks", &self.data_sm.nr_blocks())
            .finish()
    }
}

impl<'s> BlockTimeRefCounter<'s> {
    #[must_use]
    pub fn new(data_sm: &'s dyn SpaceMap) -> Self {
        Self { data_sm }
    }
}

impl RefCounter<BlockTime> for BlockTimeRefCounter<'_> {
    fn inc(&self, value: &BlockTime) -> Result<()> {
        self.data_sm.inc(value.block)?;
        Ok(())
    }

    fn dec(&self, value: &BlockTime) -> Result<()> {
        self.data_sm.dec(value.block)?;
        Ok(())
    }
}

/// Policy for the per-device subtree roots held by the top level.
pub type MtreeRefCounter<'a, 's> = SubtreeRefCounter<'a, BlockTime, BlockTimeRefCounter<'s>>;

pub type MappingTree<'a, 's> = BTree<'a, BlockTime, BlockTimeRefCounter<'s>>;
pub type DevTree<'a, 's> = BTree<'a, u64, MtreeRefCounter<'a, 's>>;
pub type SingleMappingTree<'a, 's> = BTree<'a, BlockTime, BlockTimeRefCounter<'s>>;

#[must_use]
pub fn open_mapping_tree<'a, 's>(
    tm: &'a TransactionManager,
    root: u64,
    data_sm: &'s dyn SpaceMap,
) -> MappingTree<'a, 's> {
    BTree::open(tm, root, 2, BlockTimeRefCounter::new(data_sm))
}

#[must_use]
pub fn open_dev_tree<'a, 's>(
    tm: &'a TransactionManager,
    root: u64,
    data_sm: &'s dyn SpaceMap,
) -> DevTree<'a, 's> {
    let rc = SubtreeRefCounter::new(tm, 1, BlockTimeRefCounter::new(data_sm));
    BTree::open(tm, root, 1, rc)
}

#[must_use]
pub fn open_single_mapping_tree<'a, 's>(
    tm: &'a TransactionManager,
    root: u64,
    data_sm: &'s dyn SpaceMap,
) -> SingleMappingTree<'a, 's> {
    BTree::open(tm, root, 1, BlockTimeRefCounter::new(data_sm))
}

// ── Visitors ────────────────────────────────────────────────────────────────

/// Receives each mapping with its key path: `[dev, vblock]` from the
/// two-level walk, `[vblock]` from a single-device walk.
pub trait MappingVisitor {
    fn visit(&mut self, path: &[u64], mapping: &BlockTime) -> Result<()>;
}

impl<F> MappingVisitor for F
where
    F: FnMut(&[u64], &BlockTime) -> Result<()>,
{
    fn visit(&mut self, path: &[u64], mapping: &BlockTime) -> Result<()> {
        self(path, mapping)
    }
}

/// Receives each device id with the root of its mapping tree.
pub trait DeviceRootVisitor {
    fn visit(&mut self, path: &[u64], subtree_root: u64) -> Result<()>;
}

impl<F> DeviceRootVisitor for F
where
    F: FnMut(&[u64], u64) -> Result<()>,
{
    fn visit(&mut self, path: &[u64], subtree_root: u64) -> Result<()> {
        self(path, subtree_root)
    }
}

fn expect_levels(levels: usize, expected: usize) -> Result<()> {
    if levels != expected {
        return Err(PdError::ValueOutOfRange(format!(
            "expected a {expected}-level tree, got {levels} levels"
        )));
    }
    Ok(())
}

// ── Walks ───────────────────────────────────────────────────────────────────

/// Visit the top level only: each device id and its subtree root.
/// Damage is [`Damage::MissingDevices`].
pub fn walk_dev_tree(
    tree: &DevTree<'_, '_>,
    visitor: &mut dyn DeviceRootVisitor,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    expect_levels(tree.levels(), 1)?;
    tree.walk(
        options,
        &mut |path: &[u64], root: &u64| -> Result<()> { visitor.visit(path, *root) },
        &mut |node: NodeDamage| damage.visit(Damage::devices(node)),
    )
}

/// Visit every mapping of every device in `(dev, vblock)` order.
///
/// Damage in the top level, or an unreadable subtree root, is reported as
/// [`Damage::MissingDevices`]; damage inside a device's subtree is
/// [`Damage::MissingMappings`] for that device, and the other devices are
/// still visited when `options.ignore_non_fatal` is set.
pub fn walk_mapping_tree(
    tree: &MappingTree<'_, '_>,
    visitor: &mut dyn MappingVisitor,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    expect_levels(tree.levels(), 2)?;
    let mut mappings = 0_u64;
    tree.walk(
        options,
        &mut |path: &[u64], mapping: &BlockTime| -> Result<()> {
            mappings += 1;
            visitor.visit(path, mapping)
        },
        &mut |node: NodeDamage| damage.visit(classify(node)),
    )?;
    debug!(root = tree.root(), mappings, "mapping_tree_walk_done");
    Ok(())
}

fn classify(node: NodeDamage) -> Damage {
    match node.path.first().copied() {
        Some(dev) if node.subtree_root => Damage::devices(NodeDamage {
            keys: pd_types::Run::single(dev),
            ..node
        }),
        Some(dev) => Damage::mappings(dev, node),
        None => Damage::devices(node),
    }
}

/// Visit the mappings of one device, given the root of its subtree.
/// `dev_id` labels damage reports; paths hold the virtual block only.
pub fn walk_single_mapping_tree(
    tree: &SingleMappingTree<'_, '_>,
    dev_id: u64,
    visitor: &mut dyn MappingVisitor,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    expect_levels(tree.levels(), 1)?;
    tree.walk(
        options,
        &mut |path: &[u64], mapping: &BlockTime| -> Result<()> { visitor.visit(path, mapping) },
        &mut |node: NodeDamage| damage.visit(Damage::mappings(dev_id, node)),
    )
}

pub fn check_dev_tree(
    tree: &DevTree<'_, '_>,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    walk_dev_tree(tree, &mut |_: &[u64], _: u64| -> Result<()> { Ok(()) }, damage, options)
}

pub fn check_mapping_tree(
    tree: &MappingTree<'_, '_>,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    walk_mapping_tree(tree, &mut |_: &[u64], _: &BlockTime| -> Result<()> { Ok(()) }, damage, options)
}

pub fn check_single_mapping_tree(
    tree: &SingleMappingTree<'_, '_>,
    dev_id: u64,
    damage: &mut dyn DamageVisitor,
    options: WalkOptions,
) -> Result<()> {
    walk_single_mapping_tree(
        tree,
        dev_id,
        &mut |_: &[u64], _: &BlockTime| -> Result<()> { Ok(()) },
        damage,
        options,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pd_block::{BlockDevice, MemBlockDevice};
    use pd_tm::CoreSpaceMap;
    use pd_types::{BlockNumber, Run, RunSet};
    use proptest::prelude::*;
    use std::sync::Arc;

    struct Pool {
        dev: Arc<MemBlockDevice>,
        tm: TransactionManager,
        data: CoreSpaceMap,
    }

    fn pool() -> Pool {
        let dev = Arc::new(MemBlockDevice::new(512, 2048));
        let sm: Arc<dyn SpaceMap> = Arc::new(CoreSpaceMap::new(2048));
        let tm = TransactionManager::new(Arc::clone(&dev) as Arc<dyn BlockDevice>, sm).expect("tm");
        Pool {
            dev,
            tm,
            data: CoreSpaceMap::new(16_384),
        }
    }

    fn populated<'p>(p: &'p Pool, devs: &[u64], blocks: u64) -> MappingTree<'p, 'p> {
        let mut tree = MappingTree::create(&p.tm, 2, BlockTimeRefCounter::new(&p.data)).unwrap();
        for dev in devs {
            for vblock in 0..blocks {
                let mapping = BlockTime::new(dev * 1000 + vblock, 1);
                tree.insert(&[*dev, vblock], &mapping).unwrap();
            }
        }
        tree
    }

    #[test]
    fn block_time_packs_into_one_word() {
        let bt = BlockTime::new(0x12_3456, 0x00AB_CDEF);
        let mut buf = [0_u8; 8];
        bt.pack(&mut buf);
        assert_eq!(u64::from_le_bytes(buf), (0x12_3456 << 24) | 0x00AB_CDEF);
        let back = BlockTime::unpack(&buf).unwrap();
        assert_eq!(back.block, 0x12_3456);
        assert_eq!(back.time, 0x00AB_CDEF);
    }

    #[test]
    fn block_time_equality_ignores_time() {
        assert_eq!(BlockTime::new(5, 1), BlockTime::new(5, 9));
        assert_ne!(BlockTime::new(5, 1), BlockTime::new(6, 1));
    }

    #[test]
    fn block_time_range_is_checked() {
        assert!(BlockTime::new(MAX_MAPPED_BLOCK, MAX_MAPPING_TIME).check().is_ok());
        assert!(BlockTime::new(MAX_MAPPED_BLOCK + 1, 0).check().is_err());
        assert!(BlockTime::new(0, MAX_MAPPING_TIME + 1).check().is_err());

        let p = pool();
        let mut tree = MappingTree::create(&p.tm, 2, BlockTimeRefCounter::new(&p.data)).unwrap();
        assert!(matches!(
            tree.insert(&[1, 1], &BlockTime::new(1 << 41, 0)),
            Err(PdError::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn three_views_of_one_root() {
        let p = pool();
        let tree = populated(&p, &[4, 2], 50);

        let mut devices = Vec::new();
        let mut damage: Vec<Damage> = Vec::new();
        let top = open_dev_tree(&p.tm, tree.root(), &p.data);
        walk_dev_tree(
            &top,
            &mut |path: &[u64], root: u64| -> Result<()> {
                devices.push((path.to_vec(), root));
                Ok(())
            },
            &mut damage,
            WalkOptions::strict(),
        )
        .unwrap();
        let ids: Vec<u64> = devices.iter().map(|(path, _)| path[0]).collect();
        assert_eq!(ids, vec![2, 4]);

        let mut paths = Vec::new();
        walk_mapping_tree(
            &tree,
            &mut |path: &[u64], m: &BlockTime| -> Result<()> {
                assert_eq!(m.block, path[0] * 1000 + path[1]);
                paths.push(path.to_vec());
                Ok(())
            },
            &mut damage,
            WalkOptions::strict(),
        )
        .unwrap();
        assert_eq!(paths.len(), 100);
        assert_eq!(paths[0], vec![2, 0]);
        assert_eq!(paths[99], vec![4, 49]);

        let single = open_single_mapping_tree(&p.tm, devices[1].1, &p.data);
        let mut vblocks = Vec::new();
        walk_single_mapping_tree(
            &single,
            4,
            &mut |path: &[u64], _: &BlockTime| -> Result<()> {
                vblocks.push(path.to_vec());
                Ok(())
            },
            &mut damage,
            WalkOptions::strict(),
        )
        .unwrap();
        assert_eq!(vblocks.len(), 50);
        assert_eq!(vblocks[7], vec![7]);
        assert!(damage.is_empty());

        assert!(check_mapping_tree(&single, &mut damage, WalkOptions::strict()).is_err());
    }

    #[test]
    fn damage_below_subtree_root_is_scoped_to_device() {
        let p = pool();
        let tree = populated(&p, &[1, 2, 3], 120);
        let top = open_dev_tree(&p.tm, tree.root(), &p.data);
        let subtree = top.lookup(&[2]).unwrap();
        let data = p.tm.read_block(subtree).unwrap();
        let node = pd_btree::Node::<BlockTime>::unpack(subtree, data.as_slice(), pd_btree::NodeCheck::relaxed())
            .unwrap();
        let pd_btree::node::Entries::Children(children) = node.entries else {
            panic!("expected an internal subtree root");
        };
        p.dev.poke(BlockNumber(children[1]), 40, &[0xAA; 8]);

        let mut damage: Vec<Damage> = Vec::new();
        let mut per_dev = [0_u64; 4];
        walk_mapping_tree(
            &tree,
            &mut |path: &[u64], _: &BlockTime| -> Result<()> {
                per_dev[usize::try_from(path[0]).unwrap()] += 1;
                Ok(())
            },
            &mut damage,
            WalkOptions::tolerant(),
        )
        .unwrap();

        assert_eq!(per_dev[1], 120);
        assert_eq!(per_dev[3], 120);
        assert_eq!(damage.len(), 1);
        let Damage::MissingMappings(missing) = &damage[0] else {
            panic!("expected missing mappings, got {:?}", damage[0]);
        };
        assert_eq!(missing.thin_dev, 2);
        assert!(missing.keys.is_subset_of(&Run::new(0, 119)));
        let lost = u64::try_from(missing.keys.key_count()).unwrap();
        assert_eq!(per_dev[2] + lost, 120);

        let mut single_damage: Vec<Damage> = Vec::new();
        let single = open_single_mapping_tree(&p.tm, subtree, &p.data);
        check_single_mapping_tree(&single, 2, &mut single_damage, WalkOptions::tolerant()).unwrap();
        assert_eq!(single_damage, damage);
    }

    #[test]
    fn unreadable_subtree_root_is_a_missing_device() {
        let p = pool();
        let tree = populated(&p, &[5, 7, 9], 10);
        let subtree = tree.lookup_subtree(&[7]).unwrap().unwrap();
        p.dev.fail_reads(BlockNumber(subtree));

        let mut damage: Vec<Damage> = Vec::new();
        check_mapping_tree(&tree, &mut damage, WalkOptions::tolerant()).unwrap();
        assert_eq!(damage.len(), 1);
        assert!(matches!(
            &damage[0],
            Damage::MissingDevices(d) if d.keys == RunSet::from(Run::single(7))
        ));

        // The top level alone is intact.
        let mut top_damage: Vec<Damage> = Vec::new();
        let top = open_dev_tree(&p.tm, tree.root(), &p.data);
        check_dev_tree(&top, &mut top_damage, WalkOptions::strict()).unwrap();
        assert!(top_damage.is_empty());
    }

    #[test]
    fn removing_a_device_releases_its_data_blocks() {
        let p = pool();
        let tree = populated(&p, &[1, 2], 40);
        assert_eq!(p.data.get_count(1005).unwrap(), 1);

        let mut top = open_dev_tree(&p.tm, tree.root(), &p.data);
        top.remove(&[1]).unwrap();
        assert_eq!(p.data.get_count(1005).unwrap(), 0);
        assert_eq!(p.data.get_count(2005).unwrap(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn block_time_round_trips(block in 0..=MAX_MAPPED_BLOCK, time in 0..=MAX_MAPPING_TIME) {
            let bt = BlockTime::new(block, time);
            let mut buf = [0_u8; 8];
            bt.pack(&mut buf);
            let back = BlockTime::unpack(&buf).unwrap();
            prop_assert_eq!(back.block, block);
            prop_assert_eq!(back.time, time);
        }
    }
}
