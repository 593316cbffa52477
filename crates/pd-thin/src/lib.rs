#![forbid(unsafe_code)]
//! Thin-provisioning metadata trees.
//!
//! A pool keeps two trees in its metadata device:
//!
//! - the **device tree**, one [`DeviceDetails`] record per thin device;
//! - the **mapping tree**, `(thin device, virtual block) -> BlockTime`,
//!   whose per-device subtrees are shared between a device and its
//!   snapshots.
//!
//! Walkers over both trees turn unreadable nodes into [`Damage`] reports
//! scoped to the devices or mappings that were lost, so a checker can list
//! every problem in one pass.

pub mod damage;
pub mod device_tree;
pub mod mapping_tree;
pub mod metadata;

pub use damage::{Damage, DamageVisitor, MissingDevices, MissingMappings};
pub use device_tree::{
    DEVICE_DETAILS_SIZE, DeviceDetails, DeviceTree, DeviceVisitor, check_device_tree,
    open_device_tree, walk_device_tree,
};
pub use mapping_tree::{
    BlockTime, BlockTimeRefCounter, DevTree, DeviceRootVisitor, MAX_MAPPED_BLOCK,
    MAX_MAPPING_TIME, MappingTree, MappingVisitor, MtreeRefCounter, SingleMappingTree,
    check_dev_tree, check_mapping_tree, check_single_mapping_tree, open_dev_tree,
    open_mapping_tree, open_single_mapping_tree, walk_dev_tree, walk_mapping_tree,
    walk_single_mapping_tree,
};
pub use metadata::{MetadataRoots, ThinMetadata};
