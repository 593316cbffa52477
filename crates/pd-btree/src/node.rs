//! On-disk node codec.
//!
//! A node fills one metadata block:
//!
//! ```text
//! offset  size  field
//! 0       4     checksum (crc32c of bytes 4.., inverted, xor 121107)
//! 4       4     flags (1 = internal, 2 = leaf)
//! 8       8     block number the node was written to
//! 16      4     nr_entries
//! 20      4     max_entries
//! 24      4     value_size
//! 28      4     padding
//! 32      8*max keys (u64 LE, strictly ascending)
//! ...     vs*max values (internal: child block u64; leaf: value codec)
//! ```
//!
//! Validation failures fall into two classes. Fatal ones make the node
//! unusable. Non-fatal ones (capacity not a multiple of three, an
//! under-populated non-root node) describe a tree the engine would not have
//! produced but which can still be read; they are only reported when the
//! caller asks for strict checking.

use crate::value::ValueType;
use pd_error::{PdError, Result};
use pd_types::{read_le_u32, read_le_u64, write_le_u32, write_le_u64};
use tracing::error;

// ── Constants ───────────────────────────────────────────────────────────────

pub const NODE_HEADER_SIZE: usize = 32;

const CSUM_XOR: u32 = 121_107;

const INTERNAL_NODE: u32 = 1;
const LEAF_NODE: u32 = 2;

/// Width of a key and of a child pointer.
const WORD: usize = 8;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Internal,
    Leaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub kind: NodeKind,
    pub block: u64,
    pub nr_entries: u32,
    pub max_entries: u32,
    pub value_size: u32,
}

/// Entries parallel to a node's keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Entries<V> {
    Children(Vec<u64>),
    Values(Vec<V>),
}

impl<V> Entries<V> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Children(c) => c.len(),
            Self::Values(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node<V> {
    pub header: NodeHeader,
    pub keys: Vec<u64>,
    pub entries: Entries<V>,
}

/// How strictly [`Node::unpack`] checks a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCheck {
    /// Skip the non-fatal checks.
    pub ignore_non_fatal: bool,
    /// The node is the root of a tree and may be under-populated.
    pub is_root: bool,
}

impl NodeCheck {
    /// Checks used by the engine when it reads nodes to mutate or iterate.
    #[must_use]
    pub fn relaxed() -> Self {
        Self {
            ignore_non_fatal: true,
            is_root: true,
        }
    }
}

// ── Capacity and checksum ───────────────────────────────────────────────────

/// Largest entry count a node of `value_size` values fits in `block_size`.
///
/// Rounded down to a multiple of three so that merges and splits keep
/// every non-root node at least a third full.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn calc_max_entries(block_size: usize, value_size: usize) -> u32 {
    let per_entry = WORD + value_size;
    let total = block_size.saturating_sub(NODE_HEADER_SIZE) / per_entry;
    (3 * (total / 3)) as u32
}

#[must_use]
pub fn node_checksum(data: &[u8]) -> u32 {
    !crc32c::crc32c(&data[4..]) ^ CSUM_XOR
}

fn violation(block: u64, invariant: &'static str, detail: String) -> PdError {
    error!(block, invariant, detail = %detail, "btree_invariant_violation");
    PdError::Corruption { block, detail }
}

// ── Node ────────────────────────────────────────────────────────────────────

impl<V: ValueType> Node<V> {
    /// Empty leaf sized for `block_size`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn empty_leaf(block: u64, block_size: usize) -> Self {
        Self {
            header: NodeHeader {
                kind: NodeKind::Leaf,
                block,
                nr_entries: 0,
                max_entries: calc_max_entries(block_size, V::DISK_SIZE),
                value_size: V::DISK_SIZE as u32,
            },
            keys: Vec::new(),
            entries: Entries::Values(Vec::new()),
        }
    }

    /// Internal node holding `keys`/`children`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn internal(block: u64, block_size: usize, keys: Vec<u64>, children: Vec<u64>) -> Self {
        Self {
            header: NodeHeader {
                kind: NodeKind::Internal,
                block,
                nr_entries: keys.len() as u32,
                max_entries: calc_max_entries(block_size, WORD),
                value_size: WORD as u32,
            },
            keys,
            entries: Entries::Children(children),
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.kind == NodeKind::Leaf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.header.max_entries as usize
    }

    /// Entry count below which a non-root node is under-populated.
    #[must_use]
    pub fn min_entries(&self) -> usize {
        self.max_entries() / 3
    }

    /// Detach entries `at..` into a new node of the same kind.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn split_off(&mut self, at: usize, new_block: u64) -> Self {
        let keys = self.keys.split_off(at);
        let entries = match &mut self.entries {
            Entries::Children(c) => Entries::Children(c.split_off(at)),
            Entries::Values(v) => Entries::Values(v.split_off(at)),
        };
        self.header.nr_entries = self.keys.len() as u32;
        Self {
            header: NodeHeader {
                block: new_block,
                nr_entries: keys.len() as u32,
                ..self.header
            },
            keys,
            entries,
        }
    }

    /// Move every entry of `right` to the end of `self`.
    #[expect(clippy::cast_possible_truncation)]
    pub fn append(&mut self, right: &mut Self) -> Result<()> {
        match (&mut self.entries, &mut right.entries) {
            (Entries::Children(l), Entries::Children(r)) => l.append(r),
            (Entries::Values(l), Entries::Values(r)) => l.append(r),
            _ => {
                return Err(violation(
                    right.header.block,
                    "sibling.kind==node.kind",
                    "siblings of different node kinds".to_owned(),
                ));
            }
        }
        self.keys.append(&mut right.keys);
        self.header.nr_entries = self.keys.len() as u32;
        right.header.nr_entries = 0;
        Ok(())
    }

    /// Decode and validate the node stored at `block`.
    #[expect(clippy::too_many_lines)]
    pub fn unpack(block: u64, data: &[u8], check: NodeCheck) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE {
            return Err(violation(
                block,
                "block.len>=header",
                format!("node block too short: {} bytes", data.len()),
            ));
        }

        let parse = |e: pd_types::ParseError| PdError::Corruption {
            block,
            detail: e.to_string(),
        };
        let stored_csum = read_le_u32(data, 0).map_err(parse)?;
        let csum = node_checksum(data);
        if stored_csum != csum {
            return Err(violation(
                block,
                "header.csum",
                format!("node checksum mismatch: stored {stored_csum:#010x}, computed {csum:#010x}"),
            ));
        }

        let flags = read_le_u32(data, 4).map_err(parse)?;
        let kind = match flags {
            INTERNAL_NODE => NodeKind::Internal,
            LEAF_NODE => NodeKind::Leaf,
            other => {
                return Err(violation(
                    block,
                    "header.flags",
                    format!("unknown node flags {other:#x}"),
                ));
            }
        };

        let blocknr = read_le_u64(data, 8).map_err(parse)?;
        if blocknr != block {
            return Err(violation(
                block,
                "header.blocknr==location",
                format!("node claims block {blocknr} but was read from {block}"),
            ));
        }

        let nr_entries = read_le_u32(data, 16).map_err(parse)?;
        let max_entries = read_le_u32(data, 20).map_err(parse)?;
        let value_size = read_le_u32(data, 24).map_err(parse)?;

        let expected_vs = match kind {
            NodeKind::Internal => WORD,
            NodeKind::Leaf => V::DISK_SIZE,
        };
        if value_size as usize != expected_vs {
            return Err(violation(
                block,
                "header.value_size",
                format!("value size {value_size}, expected {expected_vs}"),
            ));
        }

        let capacity = calc_max_entries(data.len(), expected_vs);
        if max_entries > capacity {
            return Err(violation(
                block,
                "header.max_entries<=capacity",
                format!("max_entries {max_entries} exceeds block capacity {capacity}"),
            ));
        }
        if nr_entries > max_entries {
            return Err(violation(
                block,
                "header.nr_entries<=max_entries",
                format!("nr_entries {nr_entries} > max_entries {max_entries}"),
            ));
        }
        if kind == NodeKind::Internal && nr_entries == 0 {
            return Err(violation(
                block,
                "internal.nr_entries>0",
                "internal node has no entries".to_owned(),
            ));
        }

        if !check.ignore_non_fatal {
            if max_entries % 3 != 0 {
                return Err(violation(
                    block,
                    "header.max_entries%3==0",
                    format!("max_entries {max_entries} is not a multiple of 3"),
                ));
            }
            if !check.is_root && nr_entries < max_entries / 3 {
                return Err(violation(
                    block,
                    "nr_entries>=max_entries/3",
                    format!("under-populated node: {nr_entries} of {max_entries} entries"),
                ));
            }
        }

        let nr = nr_entries as usize;
        let max = max_entries as usize;
        let mut keys = Vec::with_capacity(nr);
        for i in 0..nr {
            let key = read_le_u64(data, NODE_HEADER_SIZE + i * WORD).map_err(parse)?;
            match keys.last() {
                Some(prev) if *prev >= key => {
                    return Err(violation(
                        block,
                        "keys.strictly_ascending",
                        format!("key {key} at index {i} does not follow {prev}"),
                    ));
                }
                _ => {}
            }
            keys.push(key);
        }

        let values_at = NODE_HEADER_SIZE + max * WORD;
        let entries = match kind {
            NodeKind::Internal => {
                let mut children = Vec::with_capacity(nr);
                for i in 0..nr {
                    children.push(read_le_u64(data, values_at + i * WORD).map_err(parse)?);
                }
                Entries::Children(children)
            }
            NodeKind::Leaf => {
                let mut values = Vec::with_capacity(nr);
                for i in 0..nr {
                    let at = values_at + i * V::DISK_SIZE;
                    let bytes = pd_types::ensure_slice(data, at, V::DISK_SIZE).map_err(parse)?;
                    values.push(V::unpack(bytes).map_err(|e| PdError::Corruption {
                        block,
                        detail: format!("value {i}: {e}"),
                    })?);
                }
                Entries::Values(values)
            }
        };

        Ok(Self {
            header: NodeHeader {
                kind,
                block,
                nr_entries,
                max_entries,
                value_size,
            },
            keys,
            entries,
        })
    }

    /// Encode into a `block_size` buffer, checksum included.
    #[expect(clippy::cast_possible_truncation)]
    pub fn pack(&self, block_size: usize) -> Result<Vec<u8>> {
        let nr = self.keys.len();
        let max = self.max_entries();
        let vs = self.header.value_size as usize;
        if nr > max || nr != self.entries.len() {
            return Err(violation(
                self.header.block,
                "pack.nr_entries<=max_entries",
                format!(
                    "cannot pack {nr} keys / {} entries into {max} slots",
                    self.entries.len()
                ),
            ));
        }
        if NODE_HEADER_SIZE + max * (WORD + vs) > block_size {
            return Err(PdError::Format(format!(
                "node layout of {max} entries does not fit block size {block_size}"
            )));
        }

        let mut buf = vec![0_u8; block_size];
        let flags = match self.header.kind {
            NodeKind::Internal => INTERNAL_NODE,
            NodeKind::Leaf => LEAF_NODE,
        };
        write_le_u32(&mut buf, 4, flags);
        write_le_u64(&mut buf, 8, self.header.block);
        write_le_u32(&mut buf, 16, nr as u32);
        write_le_u32(&mut buf, 20, self.header.max_entries);
        write_le_u32(&mut buf, 24, self.header.value_size);

        for (i, key) in self.keys.iter().enumerate() {
            write_le_u64(&mut buf, NODE_HEADER_SIZE + i * WORD, *key);
        }
        let values_at = NODE_HEADER_SIZE + max * WORD;
        match &self.entries {
            Entries::Children(children) => {
                for (i, child) in children.iter().enumerate() {
                    write_le_u64(&mut buf, values_at + i * WORD, *child);
                }
            }
            Entries::Values(values) => {
                for (i, value) in values.iter().enumerate() {
                    let at = values_at + i * vs;
                    value.pack(&mut buf[at..at + vs]);
                }
            }
        }

        let csum = node_checksum(&buf);
        write_le_u32(&mut buf, 0, csum);
        Ok(buf)
    }
}

/// Index of the child whose key range contains `key`: the last child whose
/// separator is `<= key`, or the first child when `key` precedes them all.
#[must_use]
pub fn child_index(keys: &[u64], key: u64) -> usize {
    keys.partition_point(|k| *k <= key).saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 4096;

    fn leaf(keys: &[u64]) -> Node<u64> {
        let mut node = Node::<u64>::empty_leaf(7, BS);
        node.keys = keys.to_vec();
        node.entries = Entries::Values(keys.iter().map(|k| k * 10).collect());
        node.header.nr_entries = u32::try_from(keys.len()).unwrap();
        node
    }

    #[test]
    fn capacity_matches_persistent_data_layout() {
        assert_eq!(calc_max_entries(4096, 8), 252);
        assert_eq!(calc_max_entries(4096, 24), 126);
        assert_eq!(calc_max_entries(512, 8), 30);
        assert_eq!(calc_max_entries(16, 8), 0);
    }

    #[test]
    fn leaf_survives_pack_unpack() {
        let node = leaf(&[1, 5, 9]);
        let bytes = node.pack(BS).unwrap();
        let back = Node::<u64>::unpack(7, &bytes, NodeCheck::relaxed()).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn internal_survives_pack_unpack() {
        let node = Node::<u64>::internal(3, BS, vec![0, 100], vec![11, 12]);
        let bytes = node.pack(BS).unwrap();
        let back = Node::<u64>::unpack(3, &bytes, NodeCheck::relaxed()).unwrap();
        assert_eq!(back.entries, Entries::Children(vec![11, 12]));
        assert!(!back.is_leaf());
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut bytes = leaf(&[1, 2]).pack(BS).unwrap();
        bytes[40] ^= 0xFF;
        let err = Node::<u64>::unpack(7, &bytes, NodeCheck::relaxed()).unwrap_err();
        assert!(matches!(err, PdError::Corruption { block: 7, .. }));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn wrong_location_is_fatal() {
        let bytes = leaf(&[1]).pack(BS).unwrap();
        let err = Node::<u64>::unpack(8, &bytes, NodeCheck::relaxed()).unwrap_err();
        assert!(err.to_string().contains("claims block 7"));
    }

    #[test]
    fn unordered_keys_are_fatal() {
        let mut node = leaf(&[1, 2, 3]);
        node.keys = vec![1, 3, 3];
        let bytes = node.pack(BS).unwrap();
        let err = Node::<u64>::unpack(7, &bytes, NodeCheck::relaxed()).unwrap_err();
        assert!(err.to_string().contains("does not follow"));
    }

    #[test]
    fn value_size_mismatch_is_fatal() {
        #[derive(Debug, Clone, PartialEq)]
        struct Wide;
        impl ValueType for Wide {
            const DISK_SIZE: usize = 16;
            fn unpack(_: &[u8]) -> std::result::Result<Self, pd_types::ParseError> {
                Ok(Self)
            }
            fn pack(&self, _: &mut [u8]) {}
        }
        let bytes = leaf(&[1]).pack(BS).unwrap();
        assert!(Node::<Wide>::unpack(7, &bytes, NodeCheck::relaxed()).is_err());
    }

    #[test]
    fn underpopulated_non_root_is_non_fatal() {
        let bytes = leaf(&[1, 2]).pack(BS).unwrap();
        let strict = NodeCheck {
            ignore_non_fatal: false,
            is_root: false,
        };
        assert!(Node::<u64>::unpack(7, &bytes, strict).is_err());
        assert!(
            Node::<u64>::unpack(
                7,
                &bytes,
                NodeCheck {
                    is_root: true,
                    ..strict
                }
            )
            .is_ok()
        );
        assert!(
            Node::<u64>::unpack(
                7,
                &bytes,
                NodeCheck {
                    ignore_non_fatal: true,
                    ..strict
                }
            )
            .is_ok()
        );
    }

    #[test]
    fn zeroed_block_is_rejected() {
        assert!(Node::<u64>::unpack(0, &[0_u8; BS], NodeCheck::relaxed()).is_err());
        assert!(Node::<u64>::unpack(0, &[0_u8; 10], NodeCheck::relaxed()).is_err());
    }

    #[test]
    fn split_and_append_are_inverse() {
        let mut left = leaf(&[1, 2, 3, 4]);
        let mut right = left.split_off(2, 99);
        assert_eq!(left.keys, vec![1, 2]);
        assert_eq!(right.keys, vec![3, 4]);
        assert_eq!(right.header.block, 99);
        assert_eq!(right.header.nr_entries, 2);

        left.append(&mut right).unwrap();
        assert_eq!(left, leaf(&[1, 2, 3, 4]));
    }

    #[test]
    fn child_index_picks_covering_child() {
        let keys = [10, 20, 30];
        assert_eq!(child_index(&keys, 5), 0);
        assert_eq!(child_index(&keys, 10), 0);
        assert_eq!(child_index(&keys, 25), 1);
        assert_eq!(child_index(&keys, 99), 2);
    }
}
