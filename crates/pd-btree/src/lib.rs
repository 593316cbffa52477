#![forbid(unsafe_code)]
//! Copy-on-write persistent B-tree.
//!
//! Trees store fixed-width values under keys of one or more `u64`
//! components. A tree with `levels > 1` is a tree of trees: every level but
//! the last maps one key component to the root block of a nested tree, and
//! the last level holds the values. Nested trees are ordinary trees, so a
//! nested root can be shared between several outer entries (thin device
//! snapshots) and opened on its own.
//!
//! Nodes are never modified while more than one reference reaches them.
//! Mutations shadow the path from the root to the affected leaf through the
//! [`TransactionManager`]; a shared node is copied and the copy's children
//! gain a reference. Values are reference counted through the
//! [`RefCounter`] policy the tree was opened with.

mod cow;
pub mod iter;
pub mod node;
pub mod refcount;
pub mod value;
pub mod walk;

pub use iter::Iter;
pub use node::{NODE_HEADER_SIZE, Node, NodeCheck, NodeHeader, NodeKind, calc_max_entries};
pub use refcount::{NoOpRefCounter, RefCounter, SubtreeRefCounter};
pub use value::ValueType;
pub use walk::{NodeDamage, ValueVisitor, WalkOptions, walk_btree};

use cow::Level;
use pd_error::{PdError, Result};
use pd_tm::TransactionManager;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Handle on one tree.
///
/// The handle owns one reference on its root block. Mutations may move the
/// root; [`BTree::root`] always names the current one.
pub struct BTree<'a, V, RC> {
    tm: &'a TransactionManager,
    rc: RC,
    root: u64,
    levels: usize,
    _value: PhantomData<V>,
}

impl<V, RC> std::fmt::Debug for BTree<'_, V, RC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root)
            .field("levels", &self.levels)
            .finish_non_exhaustive()
    }
}

impl<'a, V: ValueType, RC: RefCounter<V>> BTree<'a, V, RC> {
    /// Write a new, empty tree.
    pub fn create(tm: &'a TransactionManager, levels: usize, rc: RC) -> Result<Self> {
        if levels == 0 {
            return Err(PdError::ValueOutOfRange(
                "a tree needs at least one key level".to_owned(),
            ));
        }
        let root = if levels == 1 {
            cow::new_empty_leaf::<V>(tm)?
        } else {
            cow::new_empty_leaf::<u64>(tm)?
        };
        debug!(root, levels, "btree_create");
        Ok(Self::open(tm, root, levels, rc))
    }

    /// Open the tree rooted at `root`. Nothing is read until first use.
    #[must_use]
    pub fn open(tm: &'a TransactionManager, root: u64, levels: usize, rc: RC) -> Self {
        Self {
            tm,
            rc,
            root,
            levels: levels.max(1),
            _value: PhantomData,
        }
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    #[must_use]
    pub fn ref_counter(&self) -> &RC {
        &self.rc
    }

    #[must_use]
    pub fn transaction_manager(&self) -> &'a TransactionManager {
        self.tm
    }

    fn check_key(&self, key: &[u64], expected: usize) -> Result<()> {
        if key.len() != expected {
            return Err(PdError::ValueOutOfRange(format!(
                "key {key:?} has {} components, expected {expected}",
                key.len()
            )));
        }
        Ok(())
    }

    /// Follow `prefix` from the root, one component per level.
    fn resolve(&self, prefix: &[u64]) -> Result<Option<u64>> {
        let mut root = self.root;
        for key in prefix {
            match cow::lookup_raw::<u64>(self.tm, root, *key)? {
                Some(next) => root = next,
                None => return Ok(None),
            }
        }
        Ok(Some(root))
    }

    /// Shadow the upper levels along `prefix`, hand the nested root at the
    /// end to `f`, and store the root `f` returns in its place.
    fn update_subtree(
        &self,
        root: u64,
        level: usize,
        prefix: &[u64],
        create: bool,
        f: &mut dyn FnMut(u64) -> Result<u64>,
    ) -> Result<u64> {
        let Some((&key, rest)) = prefix.split_first() else {
            return f(root);
        };
        let upper_rc = SubtreeRefCounter::<V, _>::new(self.tm, self.levels - level - 1, &self.rc);
        let lvl = Level {
            tm: self.tm,
            rc: &upper_rc,
        };
        let (new_root, _) = cow::insert_raw::<u64, _>(&lvl, root, key, |current| {
            let nested = match current {
                Some(nested) => *nested,
                None if !create => {
                    return Err(PdError::NotFound(format!("key component {key}")));
                }
                None if level + 2 == self.levels => cow::new_empty_leaf::<V>(self.tm)?,
                None => cow::new_empty_leaf::<u64>(self.tm)?,
            };
            self.update_subtree(nested, level + 1, rest, create, f)
        })?;
        Ok(new_root)
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Value stored under `key`, if any.
    pub fn get(&self, key: &[u64]) -> Result<Option<V>> {
        self.check_key(key, self.levels)?;
        let (last, prefix) = key.split_last().ok_or_else(|| {
            PdError::ValueOutOfRange("empty key".to_owned())
        })?;
        match self.resolve(prefix)? {
            Some(root) => cow::lookup_raw::<V>(self.tm, root, *last),
            None => Ok(None),
        }
    }

    /// Value stored under `key`; [`PdError::NotFound`] if absent.
    pub fn lookup(&self, key: &[u64]) -> Result<V> {
        self.get(key)?
            .ok_or_else(|| PdError::NotFound(format!("key {key:?}")))
    }

    // ── Insert / remove ─────────────────────────────────────────────────────

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// The new value gains a reference and a replaced one loses one. A
    /// value the ref-count policy rejects leaves the tree untouched.
    pub fn insert(&mut self, key: &[u64], value: &V) -> Result<()> {
        self.check_key(key, self.levels)?;
        value.check()?;
        let (last, prefix) = key
            .split_last()
            .ok_or_else(|| PdError::ValueOutOfRange("empty key".to_owned()))?;

        // Taken before any node changes: a value the policy rejects never
        // reaches a leaf.
        self.rc.inc(value)?;

        let bottom = Level {
            tm: self.tm,
            rc: &self.rc,
        };
        let mut replaced = None;
        let updated = self.update_subtree(self.root, 0, prefix, true, &mut |nested| {
            let (root, old) = cow::insert_raw(&bottom, nested, *last, |_| Ok(value.clone()))?;
            replaced = old;
            Ok(root)
        });
        let new_root = match updated {
            Ok(root) => root,
            Err(err) => {
                if let Err(undo) = self.rc.dec(value) {
                    warn!(key = ?key, error = %undo, "btree_insert_undo_failed");
                }
                return Err(err);
            }
        };
        self.root = new_root;

        // An equal value names the same referent, so this drop cancels the
        // reference taken above.
        if let Some(old) = replaced {
            self.rc.dec(&old)?;
        }
        Ok(())
    }

    /// Remove `key` and return its value, which loses a reference.
    ///
    /// An absent key fails with [`PdError::NotFound`] and leaves the tree
    /// untouched.
    pub fn remove(&mut self, key: &[u64]) -> Result<V> {
        if self.get(key)?.is_none() {
            return Err(PdError::NotFound(format!("key {key:?}")));
        }
        let (last, prefix) = key
            .split_last()
            .ok_or_else(|| PdError::ValueOutOfRange("empty key".to_owned()))?;

        let bottom = Level {
            tm: self.tm,
            rc: &self.rc,
        };
        let mut removed = None;
        let new_root = self.update_subtree(self.root, 0, prefix, false, &mut |nested| {
            let (root, value) = cow::remove_raw(&bottom, nested, *last)?;
            removed = Some(value);
            Ok(root)
        })?;
        self.root = new_root;

        let value = removed.ok_or_else(|| PdError::NotFound(format!("key {key:?}")))?;
        self.rc.dec(&value)?;
        Ok(value)
    }

    // ── Nested trees ────────────────────────────────────────────────────────

    /// Root of the nested tree below `prefix`, `1 <= prefix.len() < levels`.
    pub fn lookup_subtree(&self, prefix: &[u64]) -> Result<Option<u64>> {
        if prefix.is_empty() || prefix.len() >= self.levels {
            return Err(PdError::ValueOutOfRange(format!(
                "subtree prefix {prefix:?} invalid for a {}-level tree",
                self.levels
            )));
        }
        self.resolve(prefix)
    }

    /// Make `root` the nested tree below `prefix`.
    ///
    /// The caller hands over one reference on `root`. A nested tree already
    /// stored there loses its reference.
    pub fn insert_subtree(&mut self, prefix: &[u64], root: u64) -> Result<()> {
        let (last, upper) = self.split_subtree_prefix(prefix)?;
        let level = upper.len();
        // Roots held at `level` are trees of the remaining levels.
        let rc = SubtreeRefCounter::<V, _>::new(self.tm, self.levels - level - 1, &self.rc);
        let lvl = Level {
            tm: self.tm,
            rc: &rc,
        };
        let mut replaced = None;
        let new_root = self.update_subtree(self.root, 0, upper, true, &mut |nested| {
            let (new_nested, old) = cow::insert_raw::<u64, _>(&lvl, nested, last, |_| Ok(root))?;
            replaced = old;
            Ok(new_nested)
        })?;
        self.root = new_root;

        if let Some(old) = replaced {
            // Releases the displaced tree, or the surplus reference when the
            // same root was stored again.
            rc.dec(&old)?;
        }
        Ok(())
    }

    /// Detach and release the nested tree below `prefix`.
    pub fn remove_subtree(&mut self, prefix: &[u64]) -> Result<()> {
        let (last, upper) = self.split_subtree_prefix(prefix)?;
        if self.resolve(prefix)?.is_none() {
            return Err(PdError::NotFound(format!("subtree {prefix:?}")));
        }
        let level = upper.len();
        // Roots held at `level` are trees of the remaining levels.
        let rc = SubtreeRefCounter::<V, _>::new(self.tm, self.levels - level - 1, &self.rc);
        let lvl = Level {
            tm: self.tm,
            rc: &rc,
        };
        let mut removed = None;
        let new_root = self.update_subtree(self.root, 0, upper, false, &mut |nested| {
            let (new_nested, old) = cow::remove_raw::<u64>(&lvl, nested, last)?;
            removed = Some(old);
            Ok(new_nested)
        })?;
        self.root = new_root;

        if let Some(old) = removed {
            rc.dec(&old)?;
            debug!(prefix = ?prefix, root = old, "btree_subtree_release");
        }
        Ok(())
    }

    fn split_subtree_prefix<'k>(&self, prefix: &'k [u64]) -> Result<(u64, &'k [u64])> {
        match prefix.split_last() {
            Some((last, upper)) if prefix.len() < self.levels => Ok((*last, upper)),
            _ => Err(PdError::ValueOutOfRange(format!(
                "subtree prefix {prefix:?} invalid for a {}-level tree",
                self.levels
            ))),
        }
    }

    // ── Iteration ───────────────────────────────────────────────────────────

    /// Every `(key, value)` in ascending key order.
    #[must_use]
    pub fn iter(&self) -> Iter<'a, V> {
        Iter::new(self.tm, self.root, self.levels, None, None)
    }

    /// Entries with keys `>= start`.
    #[must_use]
    pub fn iter_from(&self, start: &[u64]) -> Iter<'a, V> {
        Iter::new(self.tm, self.root, self.levels, Some(start), None)
    }

    /// Entries with keys in `start..end`.
    #[must_use]
    pub fn range(&self, start: &[u64], end: &[u64]) -> Iter<'a, V> {
        Iter::new(self.tm, self.root, self.levels, Some(start), Some(end))
    }

    /// Damage-tolerant walk of the whole tree; see [`walk_btree`].
    pub fn walk(
        &self,
        options: WalkOptions,
        visitor: &mut dyn ValueVisitor<V>,
        damage: &mut dyn FnMut(NodeDamage),
    ) -> Result<()> {
        walk_btree(self.tm, self.root, self.levels, options, visitor, damage)
    }

    // ── Sharing ─────────────────────────────────────────────────────────────

    /// A second handle sharing every node with this one.
    pub fn snapshot(&self) -> Result<Self>
    where
        RC: Clone,
    {
        self.tm.inc_block(self.root)?;
        debug!(root = self.root, "btree_snapshot");
        Ok(Self::open(self.tm, self.root, self.levels, self.rc.clone()))
    }

    /// Drop this handle's reference on the root. Nodes and values no other
    /// tree reaches are released.
    pub fn release(self) -> Result<()> {
        refcount::release_block::<V>(self.tm, self.root, self.levels, &self.rc)?;
        debug!(root = self.root, "btree_release");
        Ok(())
    }
}
