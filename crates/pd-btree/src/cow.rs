//! Copy-on-write mutation of a single key level.
//!
//! Every node on a mutation path is shadowed before it is changed, top
//! down. Splits propagate back up the recursion; under-populated children
//! are merged with or refilled from a sibling on the way back up.

use crate::node::{Entries, Node, NodeCheck, child_index};
use crate::refcount::RefCounter;
use crate::value::ValueType;
use pd_error::{PdError, Result};
use pd_tm::TransactionManager;
use tracing::{debug, trace};

/// One key level of a tree together with the policy applied to its leaf
/// values when a shared leaf is copied.
pub(crate) struct Level<'t, W> {
    pub tm: &'t TransactionManager,
    pub rc: &'t dyn RefCounter<W>,
}

/// A split child: separator key and the block holding the upper half.
type Split = (u64, u64);

// ── Block helpers ───────────────────────────────────────────────────────────

pub(crate) fn read_node<W: ValueType>(tm: &TransactionManager, block: u64) -> Result<Node<W>> {
    let data = tm.read_block(block)?;
    Node::unpack(block, data.as_slice(), NodeCheck::relaxed())
}

pub(crate) fn write_node<W: ValueType>(tm: &TransactionManager, node: &Node<W>) -> Result<()> {
    let bytes = node.pack(tm.block_size() as usize)?;
    tm.write_block(node.header.block, &bytes)
}

/// Allocate and write an empty leaf; the caller owns its single reference.
pub(crate) fn new_empty_leaf<W: ValueType>(tm: &TransactionManager) -> Result<u64> {
    let block = tm.new_block()?;
    let node = Node::<W>::empty_leaf(block, tm.block_size() as usize);
    if node.max_entries() == 0 {
        return Err(PdError::Format(format!(
            "block size {} too small for {}-byte values",
            tm.block_size(),
            W::DISK_SIZE
        )));
    }
    write_node(tm, &node)?;
    Ok(block)
}

/// Shadow `block` and decode it. When the node had to be copied, every
/// child and value it holds gains a referrer.
fn shadow_node<W: ValueType>(lvl: &Level<'_, W>, block: u64) -> Result<Node<W>> {
    let shadow = lvl.tm.shadow_block(block)?;
    let mut node = Node::<W>::unpack(block, shadow.data.as_slice(), NodeCheck::relaxed())?;
    if shadow.copied {
        match &node.entries {
            Entries::Children(children) => {
                for child in children {
                    lvl.tm.inc_block(*child)?;
                }
            }
            Entries::Values(values) => {
                for value in values {
                    lvl.rc.inc(value)?;
                }
            }
        }
        node.header.block = shadow.block;
    }
    Ok(node)
}

// ── Lookup ──────────────────────────────────────────────────────────────────

pub(crate) fn lookup_raw<W: ValueType>(
    tm: &TransactionManager,
    root: u64,
    key: u64,
) -> Result<Option<W>> {
    let mut block = root;
    loop {
        let node = read_node::<W>(tm, block)?;
        match node.entries {
            Entries::Children(children) => {
                if node.keys.first().is_none_or(|first| key < *first) {
                    return Ok(None);
                }
                block = children[child_index(&node.keys, key)];
            }
            Entries::Values(mut values) => {
                return Ok(node
                    .keys
                    .binary_search(&key)
                    .ok()
                    .map(|i| values.swap_remove(i)));
            }
        }
    }
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// Insert or overwrite `key` in the level rooted at `root`.
///
/// `make` receives the current value (if any) once the leaf has been
/// shadowed and returns the value to store. Returns the new root and the
/// overwritten value. Reference counts of the stored values are the
/// caller's business.
pub(crate) fn insert_raw<W, F>(
    lvl: &Level<'_, W>,
    root: u64,
    key: u64,
    make: F,
) -> Result<(u64, Option<W>)>
where
    W: ValueType,
    F: FnOnce(Option<&W>) -> Result<W>,
{
    let mut node = shadow_node(lvl, root)?;
    let (old, split) = insert_descend(lvl, &mut node, key, make)?;
    let Some((separator, right)) = split else {
        return Ok((node.header.block, old));
    };

    let new_root = lvl.tm.new_block()?;
    let left_key = node.keys.first().copied().unwrap_or(0);
    let grown = Node::<W>::internal(
        new_root,
        lvl.tm.block_size() as usize,
        vec![left_key, separator],
        vec![node.header.block, right],
    );
    write_node(lvl.tm, &grown)?;
    debug!(
        old_root = node.header.block,
        new_root,
        separator_key = separator,
        "btree_root_grow"
    );
    Ok((new_root, old))
}

/// Insert below the already shadowed `node`, write it back, and report a
/// split if it overflowed.
fn insert_descend<W, F>(
    lvl: &Level<'_, W>,
    node: &mut Node<W>,
    key: u64,
    make: F,
) -> Result<(Option<W>, Option<Split>)>
where
    W: ValueType,
    F: FnOnce(Option<&W>) -> Result<W>,
{
    let old = match &mut node.entries {
        Entries::Values(values) => match node.keys.binary_search(&key) {
            Ok(i) => {
                let new = make(Some(&values[i]))?;
                Some(std::mem::replace(&mut values[i], new))
            }
            Err(i) => {
                let new = make(None)?;
                node.keys.insert(i, key);
                values.insert(i, new);
                None
            }
        },
        Entries::Children(children) => {
            let idx = child_index(&node.keys, key);
            if key < node.keys[idx] {
                // New minimum: widen the first child's range.
                node.keys[idx] = key;
            }
            let mut child = shadow_node(lvl, children[idx])?;
            children[idx] = child.header.block;

            let (old, split) = insert_descend(lvl, &mut child, key, make)?;
            if let Some((separator, right)) = split {
                node.keys.insert(idx + 1, separator);
                children.insert(idx + 1, right);
            }
            old
        }
    };

    let split = if node.len() > node.max_entries() {
        let right_block = lvl.tm.new_block()?;
        let right = node.split_off(node.len() / 2, right_block);
        write_node(lvl.tm, &right)?;
        let separator = right.keys[0];
        trace!(
            old_node = node.header.block,
            new_node = right_block,
            separator_key = separator,
            leaf = node.is_leaf(),
            "btree_node_split"
        );
        Some((separator, right_block))
    } else {
        None
    };
    write_node(lvl.tm, node)?;
    Ok((old, split))
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove `key` from the level rooted at `root`, returning the new root and
/// the removed value. The removed value's reference is not dropped.
pub(crate) fn remove_raw<W: ValueType>(
    lvl: &Level<'_, W>,
    root: u64,
    key: u64,
) -> Result<(u64, W)> {
    let mut node = shadow_node(lvl, root)?;
    let removed = remove_descend(lvl, &mut node, key)?;

    match &node.entries {
        Entries::Children(children) if children.len() == 1 => {
            let child = children[0];
            lvl.tm.dec_block(node.header.block)?;
            debug!(old_root = node.header.block, new_root = child, "btree_root_shrink");
            Ok((child, removed))
        }
        _ => Ok((node.header.block, removed)),
    }
}

fn remove_descend<W: ValueType>(lvl: &Level<'_, W>, node: &mut Node<W>, key: u64) -> Result<W> {
    let not_found = || PdError::NotFound(format!("key {key}"));
    let removed = match &mut node.entries {
        Entries::Values(values) => {
            let i = node.keys.binary_search(&key).map_err(|_| not_found())?;
            node.keys.remove(i);
            values.remove(i)
        }
        Entries::Children(children) => {
            if node.keys.first().is_none_or(|first| key < *first) {
                return Err(not_found());
            }
            let idx = child_index(&node.keys, key);
            let mut child = shadow_node(lvl, children[idx])?;
            children[idx] = child.header.block;

            let removed = remove_descend(lvl, &mut child, key)?;
            if child.len() < child.min_entries() || child.is_empty() {
                rebalance_child(lvl, node, idx, child)?;
            }
            removed
        }
    };
    write_node(lvl.tm, node)?;
    Ok(removed)
}

/// Merge the under-populated child at `idx` with a neighbour, or even out
/// their entries when both do not fit one node.
fn rebalance_child<W: ValueType>(
    lvl: &Level<'_, W>,
    parent: &mut Node<W>,
    idx: usize,
    child: Node<W>,
) -> Result<()> {
    let Entries::Children(children) = &mut parent.entries else {
        return Err(PdError::Corruption {
            block: parent.header.block,
            detail: "leaf where an internal node was expected".to_owned(),
        });
    };
    if children.len() < 2 {
        return Ok(());
    }

    let (li, mut left, mut right) = if idx + 1 < children.len() {
        let sibling = shadow_node(lvl, children[idx + 1])?;
        children[idx + 1] = sibling.header.block;
        (idx, child, sibling)
    } else {
        let sibling = shadow_node(lvl, children[idx - 1])?;
        children[idx - 1] = sibling.header.block;
        (idx - 1, sibling, child)
    };

    let right_block = right.header.block;
    if left.len() + right.len() <= left.max_entries() {
        left.append(&mut right)?;
        write_node(lvl.tm, &left)?;
        // Entries moved to the left node; only the emptied block goes.
        lvl.tm.dec_block(right_block)?;
        children.remove(li + 1);
        parent.keys.remove(li + 1);
        trace!(
            left = left.header.block,
            right = right_block,
            entries = left.len(),
            "btree_node_merge"
        );
    } else {
        let target = (left.len() + right.len()) / 2;
        left.append(&mut right)?;
        let refilled = left.split_off(target, right_block);
        write_node(lvl.tm, &left)?;
        write_node(lvl.tm, &refilled)?;
        parent.keys[li + 1] = refilled.keys[0];
        trace!(
            left = left.header.block,
            right = right_block,
            left_entries = left.len(),
            right_entries = refilled.len(),
            "btree_node_redistribute"
        );
    }
    Ok(())
}
