//! Peer identity index.
//!
//! An AVL tree living in the zone, ordered by [`PeerKey`]. Nodes link to each other by
//! zone offset and point at the statistics block of their peer set. Rotations only
//! rewrite node links; statistics blocks never move, so offsets handed out to callers
//! stay valid across rebalancing.
//!
//! Nodes are copied in and out of the zone rather than borrowed, which keeps the
//! rotation code free of aliasing concerns. Every walk is depth-bounded so a corrupted
//! link cannot send a process into unbounded recursion.

use core::cmp::Ordering;
use core::mem;

use vortex_core::PeerKey;

use crate::error::ZoneError;
use crate::offset::{Arena, ZoneOffset};

/// Size of one index node in the zone.
pub const NODE_SIZE: usize = mem::size_of::<IndexNode>();

// An AVL tree addressing u32 offsets is far shallower than this.
const MAX_DEPTH: u32 = 64;

/// Root link and node count, stored in the zone header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IndexRoot {
    root: u32,
    nodes: u32,
}

impl IndexRoot {
    pub(crate) fn nodes(&self) -> u32 {
        self.nodes
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IndexNode {
    pub(crate) key: PeerKey,
    left: u32,
    right: u32,
    height: u32,
    pub(crate) peers: u32,
    pub(crate) block: u32,
    _pad: u32,
}

/// Shape of the tree as found by [`Index::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexShape {
    /// Reachable nodes
    pub nodes: usize,
    /// Height of the root, 0 for an empty tree
    pub height: u32,
}

/// Tree view over a zone, valid while the zone lock is held.
pub(crate) struct Index<'a> {
    arena: &'a Arena,
    root: &'a mut IndexRoot,
}

impl<'a> Index<'a> {
    pub(crate) fn new(arena: &'a Arena, root: &'a mut IndexRoot) -> Self {
        Self { arena, root }
    }

    fn node(&self, at: u32) -> Result<IndexNode, ZoneError> {
        self.arena.load(at)
    }

    fn height(&self, at: u32) -> Result<u32, ZoneError> {
        if at == 0 {
            Ok(0)
        } else {
            Ok(self.node(at)?.height)
        }
    }

    /// Look up `key`.
    pub(crate) fn find(&self, key: &PeerKey) -> Result<Option<(ZoneOffset, IndexNode)>, ZoneError> {
        let mut at = self.root.root;
        for _ in 0..MAX_DEPTH {
            let Some(offset) = ZoneOffset::new(at) else {
                return Ok(None);
            };
            let node = self.node(at)?;
            at = match key.cmp(&node.key) {
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
                Ordering::Equal => return Ok(Some((offset, node))),
            };
        }
        Err(ZoneError::Corrupted("index deeper than any balanced tree"))
    }

    /// Link a freshly allocated node at `at`. The key must not be present.
    pub(crate) fn insert(
        &mut self,
        at: ZoneOffset,
        key: PeerKey,
        peers: u32,
        block: ZoneOffset,
    ) -> Result<(), ZoneError> {
        let node = IndexNode {
            key,
            height: 1,
            peers,
            block: block.get(),
            ..IndexNode::default()
        };
        self.arena.store(at.get(), node)?;
        self.root.root = self.insert_at(self.root.root, at.get(), &key, 0)?;
        self.root.nodes += 1;
        Ok(())
    }

    fn insert_at(&self, at: u32, new: u32, key: &PeerKey, depth: u32) -> Result<u32, ZoneError> {
        if at == 0 {
            return Ok(new);
        }
        if depth > MAX_DEPTH {
            return Err(ZoneError::Corrupted("index deeper than any balanced tree"));
        }

        let mut node = self.node(at)?;
        match key.cmp(&node.key) {
            Ordering::Less => node.left = self.insert_at(node.left, new, key, depth + 1)?,
            Ordering::Greater => node.right = self.insert_at(node.right, new, key, depth + 1)?,
            Ordering::Equal => return Err(ZoneError::Corrupted("duplicate index key")),
        }
        self.arena.store(at, node)?;
        self.rebalance(at)
    }

    /// Unlink `key`, returning the node that held it. The node's memory is left to the
    /// caller.
    pub(crate) fn remove(
        &mut self,
        key: &PeerKey,
    ) -> Result<Option<(ZoneOffset, IndexNode)>, ZoneError> {
        let (root, removed) = self.remove_at(self.root.root, key, 0)?;
        let Some(offset) = removed.and_then(ZoneOffset::new) else {
            return Ok(None);
        };
        let node = self.node(offset.get())?;
        self.root.root = root;
        self.root.nodes = self
            .root
            .nodes
            .checked_sub(1)
            .ok_or(ZoneError::Corrupted("index node count underflow"))?;
        Ok(Some((offset, node)))
    }

    fn remove_at(
        &self,
        at: u32,
        key: &PeerKey,
        depth: u32,
    ) -> Result<(u32, Option<u32>), ZoneError> {
        if at == 0 {
            return Ok((0, None));
        }
        if depth > MAX_DEPTH {
            return Err(ZoneError::Corrupted("index deeper than any balanced tree"));
        }

        let mut node = self.node(at)?;
        let removed = match key.cmp(&node.key) {
            Ordering::Less => {
                let (left, removed) = self.remove_at(node.left, key, depth + 1)?;
                node.left = left;
                removed
            }
            Ordering::Greater => {
                let (right, removed) = self.remove_at(node.right, key, depth + 1)?;
                node.right = right;
                removed
            }
            Ordering::Equal => {
                if node.left == 0 {
                    return Ok((node.right, Some(at)));
                }
                if node.right == 0 {
                    return Ok((node.left, Some(at)));
                }
                let (right, successor) = self.remove_min(node.right, depth + 1)?;
                let mut replacement = self.node(successor)?;
                replacement.left = node.left;
                replacement.right = right;
                self.arena.store(successor, replacement)?;
                return Ok((self.rebalance(successor)?, Some(at)));
            }
        };

        if removed.is_none() {
            return Ok((at, None));
        }
        self.arena.store(at, node)?;
        Ok((self.rebalance(at)?, removed))
    }

    fn remove_min(&self, at: u32, depth: u32) -> Result<(u32, u32), ZoneError> {
        if depth > MAX_DEPTH {
            return Err(ZoneError::Corrupted("index deeper than any balanced tree"));
        }
        let mut node = self.node(at)?;
        if node.left == 0 {
            return Ok((node.right, at));
        }
        let (left, min) = self.remove_min(node.left, depth + 1)?;
        node.left = left;
        self.arena.store(at, node)?;
        Ok((self.rebalance(at)?, min))
    }

    /// Restore the height and balance of `at`, returning the new subtree root.
    fn rebalance(&self, at: u32) -> Result<u32, ZoneError> {
        let mut node = self.node(at)?;
        let left = self.height(node.left)?;
        let right = self.height(node.right)?;

        if left > right + 1 {
            let child = self.node(node.left)?;
            if self.height(child.left)? < self.height(child.right)? {
                node.left = self.rotate_left(node.left)?;
                self.arena.store(at, node)?;
            }
            return self.rotate_right(at);
        }
        if right > left + 1 {
            let child = self.node(node.right)?;
            if self.height(child.right)? < self.height(child.left)? {
                node.right = self.rotate_right(node.right)?;
                self.arena.store(at, node)?;
            }
            return self.rotate_left(at);
        }

        node.height = 1 + left.max(right);
        self.arena.store(at, node)?;
        Ok(at)
    }

    fn rotate_right(&self, at: u32) -> Result<u32, ZoneError> {
        let mut top = self.node(at)?;
        let pivot_at = top.left;
        let mut pivot = self.node(pivot_at)?;

        top.left = pivot.right;
        top.height = 1 + self.height(top.left)?.max(self.height(top.right)?);
        self.arena.store(at, top)?;

        pivot.right = at;
        pivot.height = 1 + self.height(pivot.left)?.max(top.height);
        self.arena.store(pivot_at, pivot)?;
        Ok(pivot_at)
    }

    fn rotate_left(&self, at: u32) -> Result<u32, ZoneError> {
        let mut top = self.node(at)?;
        let pivot_at = top.right;
        let mut pivot = self.node(pivot_at)?;

        top.right = pivot.left;
        top.height = 1 + self.height(top.left)?.max(self.height(top.right)?);
        self.arena.store(at, top)?;

        pivot.left = at;
        pivot.height = 1 + self.height(pivot.right)?.max(top.height);
        self.arena.store(pivot_at, pivot)?;
        Ok(pivot_at)
    }

    /// All nodes in key order.
    pub(crate) fn entries(&self) -> Result<Vec<(ZoneOffset, IndexNode)>, ZoneError> {
        let expected = self.root.nodes as usize;
        let mut out = Vec::with_capacity(expected);
        let mut stack: Vec<u32> = Vec::new();
        let mut at = self.root.root;

        loop {
            while at != 0 {
                if stack.len() as u32 > MAX_DEPTH {
                    return Err(ZoneError::Corrupted("index deeper than any balanced tree"));
                }
                stack.push(at);
                at = self.node(at)?.left;
            }
            let Some(top) = stack.pop() else {
                break;
            };
            let node = self.node(top)?;
            let offset = ZoneOffset::new(top).ok_or(ZoneError::Corrupted("null index link"))?;
            out.push((offset, node));
            if out.len() > expected {
                return Err(ZoneError::Corrupted("index holds more nodes than recorded"));
            }
            at = node.right;
        }
        Ok(out)
    }

    /// Check ordering, heights, balance and the recorded node count.
    pub(crate) fn verify(&self) -> Result<IndexShape, ZoneError> {
        let (height, nodes) = self.verify_at(self.root.root, None, None, 0)?;
        if nodes != self.root.nodes as usize {
            return Err(ZoneError::Corrupted("index node count disagrees with the tree"));
        }
        Ok(IndexShape { nodes, height })
    }

    fn verify_at(
        &self,
        at: u32,
        low: Option<PeerKey>,
        high: Option<PeerKey>,
        depth: u32,
    ) -> Result<(u32, usize), ZoneError> {
        if at == 0 {
            return Ok((0, 0));
        }
        if depth > MAX_DEPTH {
            return Err(ZoneError::Corrupted("index deeper than any balanced tree"));
        }

        let node = self.node(at)?;
        if low.is_some_and(|low| node.key <= low) || high.is_some_and(|high| node.key >= high) {
            return Err(ZoneError::Corrupted("index keys out of order"));
        }

        let (left, left_nodes) = self.verify_at(node.left, low, Some(node.key), depth + 1)?;
        let (right, right_nodes) = self.verify_at(node.right, Some(node.key), high, depth + 1)?;
        if left.abs_diff(right) > 1 {
            return Err(ZoneError::Corrupted("index out of balance"));
        }
        let height = 1 + left.max(right);
        if node.height != height {
            return Err(ZoneError::Corrupted("stale index node height"));
        }
        Ok((height, 1 + left_nodes + right_nodes))
    }
}
