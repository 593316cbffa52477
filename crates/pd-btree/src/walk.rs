//! Damage-tolerant traversal.
//!
//! The walker visits every value in key order, like [`crate::Iter`], but a
//! node that cannot be read or fails validation does not end the traversal
//! outright. The node is reported as damage covering every key it could
//! have held, then:
//!
//! - at the root handed to the walk, the walk always fails;
//! - elsewhere, with `ignore_non_fatal` set, the subtree is skipped and its
//!   siblings are still visited;
//! - elsewhere, without `ignore_non_fatal`, the walk fails right after the
//!   report.
//!
//! A failed walk returns [`PdError::Corruption`] naming the damaged block.
//! Errors returned by the visitor are not damage and propagate unchanged.

use crate::node::{Entries, Node, NodeCheck};
use crate::value::ValueType;
use pd_error::{PdError, Result};
use pd_tm::TransactionManager;
use pd_types::Run;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, warn};

/// Walk behaviour, chosen per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkOptions {
    /// Skip damaged subtrees and keep going; also accept nodes that only
    /// fail the non-fatal checks.
    pub ignore_non_fatal: bool,
}

impl WalkOptions {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            ignore_non_fatal: false,
        }
    }

    #[must_use]
    pub fn tolerant() -> Self {
        Self {
            ignore_non_fatal: true,
        }
    }
}

/// A node the walker could not use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDamage {
    /// Key level of the node, 0 being the outermost.
    pub level: usize,
    /// Keys of the enclosing levels.
    pub path: Vec<u64>,
    /// Keys at `level` the node could have held.
    pub keys: Run,
    pub block: u64,
    /// The node is the root of a nested tree below `path`.
    pub subtree_root: bool,
    pub desc: String,
}

/// Receives each value with its full key path.
pub trait ValueVisitor<V> {
    fn visit(&mut self, path: &[u64], value: &V) -> Result<()>;
}

impl<V, F> ValueVisitor<V> for F
where
    F: FnMut(&[u64], &V) -> Result<()>,
{
    fn visit(&mut self, path: &[u64], value: &V) -> Result<()> {
        self(path, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Top,
    Subtree,
    Child,
}

enum Decoded<V> {
    Upper(Node<u64>),
    Bottom(Node<V>),
}

/// Walk the `levels`-level tree rooted at `root`.
pub fn walk_btree<V: ValueType>(
    tm: &TransactionManager,
    root: u64,
    levels: usize,
    options: WalkOptions,
    visitor: &mut dyn ValueVisitor<V>,
    damage: &mut dyn FnMut(NodeDamage),
) -> Result<()> {
    let mut walker = Walker {
        tm,
        levels: levels.max(1),
        options,
        visitor,
        damage,
        active: HashSet::new(),
        path: Vec::with_capacity(levels),
    };
    walker.walk_node(root, 0, 0, u64::MAX, Role::Top)
}

struct Walker<'w, V> {
    tm: &'w TransactionManager,
    levels: usize,
    options: WalkOptions,
    visitor: &'w mut dyn ValueVisitor<V>,
    damage: &'w mut dyn FnMut(NodeDamage),
    /// Blocks on the current root-to-node path.
    active: HashSet<u64>,
    path: Vec<u64>,
}

impl<V: ValueType> Walker<'_, V> {
    fn walk_node(&mut self, block: u64, level: usize, lo: u64, hi: u64, role: Role) -> Result<()> {
        if !self.active.insert(block) {
            let err = PdError::Corruption {
                block,
                detail: "cycle detected in tree pointers".to_owned(),
            };
            return self.damaged(block, level, lo, hi, role, err);
        }

        let result = match self.decode(block, level, lo, hi, role) {
            Ok(node) => self.visit_node(node, level, lo, hi),
            Err(err) if err.is_structural() => self.damaged(block, level, lo, hi, role, err),
            Err(err) => Err(err),
        };
        self.active.remove(&block);
        result
    }

    fn decode(&self, block: u64, level: usize, lo: u64, hi: u64, role: Role) -> Result<Decoded<V>> {
        let check = NodeCheck {
            ignore_non_fatal: self.options.ignore_non_fatal,
            is_root: role != Role::Child,
        };
        let data = self.tm.read_block(block)?;
        let (decoded, keys) = if level + 1 == self.levels {
            let node = Node::<V>::unpack(block, data.as_slice(), check)?;
            let keys = (node.keys.first().copied(), node.keys.last().copied());
            (Decoded::Bottom(node), keys)
        } else {
            let node = Node::<u64>::unpack(block, data.as_slice(), check)?;
            let keys = (node.keys.first().copied(), node.keys.last().copied());
            (Decoded::Upper(node), keys)
        };

        if let (Some(first), Some(last)) = keys {
            if first < lo || last > hi {
                error!(
                    block,
                    invariant = "keys.within_parent_range",
                    first,
                    last,
                    lo,
                    hi,
                    "btree_invariant_violation"
                );
                return Err(PdError::Corruption {
                    block,
                    detail: format!("keys {first}..={last} outside parent range {lo}..={hi}"),
                });
            }
        }
        Ok(decoded)
    }

    fn visit_node(&mut self, node: Decoded<V>, level: usize, lo: u64, hi: u64) -> Result<()> {
        match node {
            Decoded::Upper(node) => match node.entries {
                Entries::Children(children) => self.visit_children(&node.keys, &children, level, lo, hi),
                Entries::Values(roots) => {
                    for (key, root) in node.keys.iter().zip(roots) {
                        self.path.push(*key);
                        let result = self.walk_node(root, level + 1, 0, u64::MAX, Role::Subtree);
                        self.path.pop();
                        result?;
                    }
                    Ok(())
                }
            },
            Decoded::Bottom(node) => match node.entries {
                Entries::Children(children) => self.visit_children(&node.keys, &children, level, lo, hi),
                Entries::Values(values) => {
                    for (key, value) in node.keys.iter().zip(&values) {
                        self.path.push(*key);
                        let result = self.visitor.visit(&self.path, value);
                        self.path.pop();
                        result?;
                    }
                    Ok(())
                }
            },
        }
    }

    fn visit_children(
        &mut self,
        keys: &[u64],
        children: &[u64],
        level: usize,
        lo: u64,
        hi: u64,
    ) -> Result<()> {
        for (i, child) in children.iter().enumerate() {
            let child_lo = if i == 0 { lo } else { keys[i] };
            let child_hi = keys.get(i + 1).map_or(hi, |next| next - 1);
            self.walk_node(*child, level, child_lo, child_hi, Role::Child)?;
        }
        Ok(())
    }

    fn damaged(
        &mut self,
        block: u64,
        level: usize,
        lo: u64,
        hi: u64,
        role: Role,
        err: PdError,
    ) -> Result<()> {
        let desc = err.to_string();
        warn!(block, level, begin = lo, end = hi, error = %desc, "btree_walk_damage");
        (self.damage)(NodeDamage {
            level,
            path: self.path.clone(),
            keys: Run::new(lo, hi),
            block,
            subtree_root: role == Role::Subtree,
            desc,
        });

        if role == Role::Top || !self.options.ignore_non_fatal {
            return Err(match err {
                err @ PdError::Corruption { .. } => err,
                other => PdError::Corruption {
                    block,
                    detail: other.to_string(),
                },
            });
        }
        Ok(())
    }
}
