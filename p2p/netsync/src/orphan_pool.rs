//! # Orphan Pool
//!
//! Blocks whose parent we don't have yet. When a block is committed its orphan children are taken
//! out with [`OrphanPool::remove_by_parent`] and committed in turn.
//!
//! The pool is bounded, when full the oldest orphan is evicted whatever its relationship to the
//! others.
use std::{collections::HashMap, sync::Arc, time::Duration};

use indexmap::IndexMap;
use tokio::time::Instant;

use ohmc_p2p_core::PeerId;
use ohmc_types::Block;

/// A block in the [`OrphanPool`].
#[derive(Debug, Clone)]
pub(crate) struct OrphanBlock {
    pub block: Arc<Block>,
    /// The peer that gave us this block, [`None`] if it was submitted locally.
    pub supplier: Option<PeerId>,
    pub received: Instant,
    pub expires: Instant,
}

/// A bounded pool of orphan blocks.
#[derive(Debug)]
pub(crate) struct OrphanPool {
    /// The orphans, in insertion order.
    orphans: IndexMap<[u8; 32], OrphanBlock>,
    /// A map of parent hash to the hashes of orphans with that parent.
    by_parent: HashMap<[u8; 32], Vec<[u8; 32]>>,
    capacity: usize,
    expiry: Duration,
}

impl OrphanPool {
    pub(crate) fn new(capacity: usize, expiry: Duration) -> Self {
        Self {
            orphans: IndexMap::with_capacity(capacity),
            by_parent: HashMap::new(),
            capacity,
            expiry,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.orphans.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub(crate) fn has(&self, hash: &[u8; 32]) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Adds an orphan to the pool, returning the hash of the block evicted to make room, if any.
    ///
    /// Adding a block already in the pool does nothing. With a capacity of 0 the block itself is
    /// returned as evicted.
    pub(crate) fn add(
        &mut self,
        block: Arc<Block>,
        supplier: Option<PeerId>,
        now: Instant,
    ) -> Option<[u8; 32]> {
        self.insert(OrphanBlock {
            block,
            supplier,
            received: now,
            expires: now + self.expiry,
        })
    }

    /// Puts back an orphan taken out with [`OrphanPool::remove_by_parent`], keeping its expiry.
    pub(crate) fn restore(&mut self, orphan: OrphanBlock) -> Option<[u8; 32]> {
        self.insert(orphan)
    }

    fn insert(&mut self, orphan: OrphanBlock) -> Option<[u8; 32]> {
        let hash = orphan.block.hash();

        if self.capacity == 0 {
            return Some(hash);
        }

        if self.has(&hash) {
            return None;
        }

        let evicted = if self.orphans.len() >= self.capacity {
            let oldest = self.orphans.first().map(|(oldest, _)| *oldest);
            if let Some(oldest) = &oldest {
                self.remove(oldest);
            }
            oldest
        } else {
            None
        };

        self.by_parent
            .entry(orphan.block.previous())
            .or_default()
            .push(hash);
        self.orphans.insert(hash, orphan);

        evicted
    }

    /// Removes and returns every orphan whose parent is `parent`, oldest first.
    pub(crate) fn remove_by_parent(&mut self, parent: &[u8; 32]) -> Vec<OrphanBlock> {
        let Some(children) = self.by_parent.remove(parent) else {
            return vec![];
        };

        children
            .into_iter()
            .filter_map(|child| self.orphans.shift_remove(&child))
            .collect()
    }

    /// Returns the parent hash of the orphan with this hash.
    pub(crate) fn parent_of(&self, hash: &[u8; 32]) -> Option<[u8; 32]> {
        self.orphans.get(hash).map(|orphan| orphan.block.previous())
    }

    /// Returns the hash of the oldest ancestor of `hash` that is in the pool.
    ///
    /// If `hash` is not an orphan it is returned as is.
    pub(crate) fn orphan_root(&self, hash: &[u8; 32]) -> [u8; 32] {
        let mut root = *hash;

        while let Some(orphan) = self.orphans.get(&root) {
            let parent = orphan.block.previous();
            if !self.orphans.contains_key(&parent) {
                break;
            }
            root = parent;
        }

        root
    }

    /// Removes every orphan that has expired, returning their hashes.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<[u8; 32]> {
        let expired = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.expires <= now)
            .map(|(hash, _)| *hash)
            .collect::<Vec<_>>();

        for hash in &expired {
            self.remove(hash);
        }

        expired
    }

    /// Removes the orphan with this hash.
    pub(crate) fn remove(&mut self, hash: &[u8; 32]) -> Option<OrphanBlock> {
        let orphan = self.orphans.shift_remove(hash)?;
        let parent = orphan.block.previous();

        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|sibling| sibling != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }

        Some(orphan)
    }
}
