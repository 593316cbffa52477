//! Reference-count policies for leaf values.
//!
//! Whenever a value gains or loses a referrer (inserted, overwritten,
//! removed, or duplicated because a shared leaf was copied) the tree calls
//! the policy chosen for its value type.

use crate::node::{Entries, Node, NodeCheck};
use crate::value::ValueType;
use pd_error::Result;
use pd_tm::TransactionManager;
use std::marker::PhantomData;
use tracing::trace;

pub trait RefCounter<V> {
    fn inc(&self, value: &V) -> Result<()>;
    fn dec(&self, value: &V) -> Result<()>;
}

impl<V, T: RefCounter<V> + ?Sized> RefCounter<V> for &T {
    fn inc(&self, value: &V) -> Result<()> {
        (**self).inc(value)
    }

    fn dec(&self, value: &V) -> Result<()> {
        (**self).dec(value)
    }
}

/// Policy for values that reference nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpRefCounter;

impl<V> RefCounter<V> for NoOpRefCounter {
    fn inc(&self, _value: &V) -> Result<()> {
        Ok(())
    }

    fn dec(&self, _value: &V) -> Result<()> {
        Ok(())
    }
}

/// Policy for values that are roots of nested trees.
///
/// Incrementing takes another reference on the root block. Decrementing
/// drops one and, when none remain, releases the nested tree: its nodes
/// return to the metadata space map and its values are decremented through
/// `value_rc`.
pub struct SubtreeRefCounter<'a, V, RC> {
    tm: &'a TransactionManager,
    /// Number of key levels of the nested tree.
    depth: usize,
    value_rc: RC,
    _value: PhantomData<fn(&V)>,
}

impl<V, RC: Clone> Clone for SubtreeRefCounter<'_, V, RC> {
    fn clone(&self) -> Self {
        Self {
            tm: self.tm,
            depth: self.depth,
            value_rc: self.value_rc.clone(),
            _value: PhantomData,
        }
    }
}

impl<V, RC> std::fmt::Debug for SubtreeRefCounter<'_, V, RC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtreeRefCounter")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl<'a, V, RC> SubtreeRefCounter<'a, V, RC> {
    #[must_use]
    pub fn new(tm: &'a TransactionManager, depth: usize, value_rc: RC) -> Self {
        Self {
            tm,
            depth: depth.max(1),
            value_rc,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub fn value_rc(&self) -> &RC {
        &self.value_rc
    }
}

impl<V: ValueType, RC: RefCounter<V>> RefCounter<u64> for SubtreeRefCounter<'_, V, RC> {
    fn inc(&self, root: &u64) -> Result<()> {
        self.tm.inc_block(*root)?;
        Ok(())
    }

    fn dec(&self, root: &u64) -> Result<()> {
        release_block::<V>(self.tm, *root, self.depth, &self.value_rc)
    }
}

/// Drop one reference on `block`, a node of a tree with `depth` key
/// levels. When the last reference goes, everything the node references
/// loses one reference in turn.
pub(crate) fn release_block<V: ValueType>(
    tm: &TransactionManager,
    block: u64,
    depth: usize,
    rc: &dyn RefCounter<V>,
) -> Result<()> {
    if tm.dec_block(block)? > 0 {
        return Ok(());
    }

    let data = tm.read_block(block)?;
    if depth > 1 {
        let node = Node::<u64>::unpack(block, data.as_slice(), NodeCheck::relaxed())?;
        match node.entries {
            Entries::Children(children) => {
                for child in children {
                    release_block::<V>(tm, child, depth, rc)?;
                }
            }
            Entries::Values(roots) => {
                for root in roots {
                    release_block::<V>(tm, root, depth - 1, rc)?;
                }
            }
        }
    } else {
        let node = Node::<V>::unpack(block, data.as_slice(), NodeCheck::relaxed())?;
        match node.entries {
            Entries::Children(children) => {
                for child in children {
                    release_block::<V>(tm, child, depth, rc)?;
                }
            }
            Entries::Values(values) => {
                for value in &values {
                    rc.dec(value)?;
                }
            }
        }
    }
    trace!(block, depth, "btree_node_release");
    Ok(())
}
