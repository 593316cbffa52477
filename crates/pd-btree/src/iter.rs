//! Lazy ordered iteration over every key level.

use crate::cow::read_node;
use crate::node::{Entries, child_index};
use crate::value::ValueType;
use pd_error::{PdError, Result};
use pd_tm::TransactionManager;

enum Frame<V> {
    Internal {
        children: Vec<u64>,
        next: usize,
    },
    /// Leaf of an upper level; its values are roots of the next level.
    Upper {
        keys: Vec<u64>,
        roots: Vec<u64>,
        next: usize,
        /// Lower bound for the nested tree under the first entry visited,
        /// applicable only when that entry's key is the first component.
        nested_bound: Option<(u64, Vec<u64>)>,
    },
    Bottom {
        keys: Vec<u64>,
        values: Vec<V>,
        next: usize,
    },
}

enum Step<V> {
    Yield(u64, V),
    Descend(u64, usize, Option<Vec<u64>>),
    Pop,
}

/// Ascending `(key path, value)` pairs.
///
/// Nodes are read as the cursor reaches them. A read failure is yielded
/// once, after which the iterator is exhausted.
pub struct Iter<'t, V> {
    tm: &'t TransactionManager,
    levels: usize,
    stack: Vec<(usize, Frame<V>)>,
    path: Vec<u64>,
    end: Option<Vec<u64>>,
    error: Option<PdError>,
    done: bool,
}

impl<V> std::fmt::Debug for Iter<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("levels", &self.levels)
            .field("depth", &self.stack.len())
            .field("path", &self.path)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'t, V: ValueType> Iter<'t, V> {
    /// Iterate keys in `start..end` of the tree rooted at `root`.
    pub(crate) fn new(
        tm: &'t TransactionManager,
        root: u64,
        levels: usize,
        start: Option<&[u64]>,
        end: Option<&[u64]>,
    ) -> Self {
        let mut iter = Self {
            tm,
            levels,
            stack: Vec::new(),
            path: Vec::with_capacity(levels),
            end: end.map(<[u64]>::to_vec),
            error: None,
            done: false,
        };
        if let Err(err) = iter.push_tree(root, 0, start) {
            iter.stack.clear();
            iter.error = Some(err);
        }
        iter
    }

    /// Descend from `block` at `level` to its first leaf at or after `bound`.
    fn push_tree(&mut self, mut block: u64, level: usize, bound: Option<&[u64]>) -> Result<()> {
        let bound = bound.filter(|b| !b.is_empty());
        let first_at = |keys: &[u64]| bound.map_or(0, |b| keys.partition_point(|k| *k < b[0]));
        loop {
            if level + 1 == self.levels {
                let node = read_node::<V>(self.tm, block)?;
                match node.entries {
                    Entries::Children(children) => {
                        block = self.push_internal(level, &node.keys, children, bound);
                    }
                    Entries::Values(values) => {
                        let next = first_at(&node.keys);
                        self.stack.push((
                            level,
                            Frame::Bottom {
                                keys: node.keys,
                                values,
                                next,
                            },
                        ));
                        return Ok(());
                    }
                }
            } else {
                let node = read_node::<u64>(self.tm, block)?;
                match node.entries {
                    Entries::Children(children) => {
                        block = self.push_internal(level, &node.keys, children, bound);
                    }
                    Entries::Values(roots) => {
                        let next = first_at(&node.keys);
                        let nested_bound = bound.and_then(|b| {
                            node.keys
                                .get(next)
                                .filter(|k| **k == b[0])
                                .map(|k| (*k, b[1..].to_vec()))
                        });
                        self.stack.push((
                            level,
                            Frame::Upper {
                                keys: node.keys,
                                roots,
                                next,
                                nested_bound,
                            },
                        ));
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Push an internal frame and return the child to descend into.
    fn push_internal(
        &mut self,
        level: usize,
        keys: &[u64],
        children: Vec<u64>,
        bound: Option<&[u64]>,
    ) -> u64 {
        let i = bound.map_or(0, |b| child_index(keys, b[0]));
        let child = children[i];
        self.stack.push((level, Frame::Internal { children, next: i + 1 }));
        child
    }

    fn step(&mut self) -> Option<(usize, Step<V>)> {
        let (level, frame) = self.stack.last_mut()?;
        let step = match frame {
            Frame::Bottom { keys, values, next } => {
                if *next < keys.len() {
                    let i = *next;
                    *next += 1;
                    Step::Yield(keys[i], values[i].clone())
                } else {
                    Step::Pop
                }
            }
            Frame::Upper {
                keys,
                roots,
                next,
                nested_bound,
            } => {
                if *next < keys.len() {
                    let i = *next;
                    *next += 1;
                    let key = keys[i];
                    self.path.truncate(*level);
                    self.path.push(key);
                    let bound = nested_bound
                        .take()
                        .and_then(|(k, rest)| (k == key).then_some(rest));
                    Step::Descend(roots[i], *level + 1, bound)
                } else {
                    Step::Pop
                }
            }
            Frame::Internal { children, next } => {
                if *next < children.len() {
                    let child = children[*next];
                    *next += 1;
                    Step::Descend(child, *level, None)
                } else {
                    Step::Pop
                }
            }
        };
        Some((*level, step))
    }
}

impl<V: ValueType> Iterator for Iter<'_, V> {
    type Item = Result<(Vec<u64>, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.done {
            return None;
        }
        loop {
            let Some((level, step)) = self.step() else {
                self.done = true;
                return None;
            };
            match step {
                Step::Yield(key, value) => {
                    let mut path = self.path[..level].to_vec();
                    path.push(key);
                    if self.end.as_deref().is_some_and(|end| path.as_slice() >= end) {
                        self.done = true;
                        self.stack.clear();
                        return None;
                    }
                    return Some(Ok((path, value)));
                }
                Step::Descend(block, child_level, bound) => {
                    if let Err(err) = self.push_tree(block, child_level, bound.as_deref()) {
                        self.done = true;
                        self.stack.clear();
                        return Some(Err(err));
                    }
                }
                Step::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}
