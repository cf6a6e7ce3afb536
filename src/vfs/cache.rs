//! Superblock node cache.
//!
//! Open-addressed hash table keyed by (superblock id, node id) with
//! tombstones. The invariant it maintains: a node is present exactly
//! while its reference count is non-zero.

use super::node::{NodeId, VfsNode};
use crate::error::Result;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

const MIN_CAPACITY: usize = 32;

enum Slot {
    Empty,
    Deleted,
    Present(Arc<VfsNode>),
}

pub struct NodeCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    slots: Vec<Slot>,
    count: usize,
}

fn hash_key(sb_id: usize, node_id: NodeId) -> usize {
    let h1 = (sb_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let h2 = (node_id as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    (h1 ^ h2.rotate_left(31)) as usize
}

fn node_sb_id(node: &Arc<VfsNode>) -> usize {
    node.superblock.upgrade().map(|sb| sb.id).unwrap_or(0)
}

impl CacheInner {
    fn find(&self, sb_id: usize, node_id: NodeId) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mut idx = hash_key(sb_id, node_id) % self.slots.len();
        loop {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Deleted => {}
                Slot::Present(node) => {
                    if node.id() == node_id && node_sb_id(node) == sb_id {
                        return Some(idx);
                    }
                }
            }
            idx = (idx + 1) % self.slots.len();
        }
    }

    fn insert_slot(&mut self, node: Arc<VfsNode>) {
        let key = (node_sb_id(&node), node.id());
        let mut idx = hash_key(key.0, key.1) % self.slots.len();
        loop {
            match &self.slots[idx] {
                Slot::Empty | Slot::Deleted => {
                    self.slots[idx] = Slot::Present(node);
                    self.count += 1;
                    return;
                }
                Slot::Present(_) => idx = (idx + 1) % self.slots.len(),
            }
        }
    }

    fn rebuild(&mut self, new_capacity: usize) {
        let old = core::mem::replace(&mut self.slots, Vec::new());
        self.slots.resize_with(new_capacity, || Slot::Empty);
        self.count = 0;
        for slot in old {
            if let Slot::Present(node) = slot {
                self.insert_slot(node);
            }
        }
    }

    fn maybe_resize(&mut self) {
        let capacity = self.slots.len();
        if capacity < MIN_CAPACITY {
            self.rebuild(MIN_CAPACITY);
        } else if capacity > MIN_CAPACITY && self.count * 4 < capacity {
            self.rebuild(capacity / 2);
        } else if self.count * 3 > capacity * 2 {
            self.rebuild(capacity + capacity / 2);
        }
    }
}

impl NodeCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                slots: Vec::new(),
                count: 0,
            }),
        }
    }

    /// Look up a node and take a reference under the cache lock.
    pub fn get(&self, sb_id: usize, node_id: NodeId) -> Option<Arc<VfsNode>> {
        let inner = self.inner.lock();
        let idx = inner.find(sb_id, node_id)?;
        if let Slot::Present(node) = &inner.slots[idx] {
            node.ref_count.fetch_add(1, Ordering::AcqRel);
            Some(node.clone())
        } else {
            None
        }
    }

    /// Hit: reference taken. Miss: `read` runs under the cache lock so a
    /// node is never read from storage twice, then the fresh node is
    /// registered with one reference.
    pub fn get_or_read(
        &self,
        sb_id: usize,
        node_id: NodeId,
        read: impl FnOnce() -> Result<Arc<VfsNode>>,
    ) -> Result<(Arc<VfsNode>, bool)> {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.find(sb_id, node_id) {
            if let Slot::Present(node) = &inner.slots[idx] {
                node.ref_count.fetch_add(1, Ordering::AcqRel);
                return Ok((node.clone(), false));
            }
        }
        let node = read()?;
        node.ref_count.store(1, Ordering::Release);
        inner.maybe_resize();
        inner.insert_slot(node.clone());
        Ok((node, true))
    }

    /// Take one more reference on an already-cached node.
    pub fn retain(&self, node: &Arc<VfsNode>) -> usize {
        let _inner = self.inner.lock();
        node.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; at zero the node leaves the cache. Returns the
    /// remaining count.
    pub fn release(&self, node: &Arc<VfsNode>) -> usize {
        let mut inner = self.inner.lock();
        let remaining = node.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            if let Some(idx) = inner.find(node_sb_id(node), node.id()) {
                inner.slots[idx] = Slot::Deleted;
                inner.count -= 1;
            }
        }
        remaining
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::{NodeOps, VfsStat};
    use alloc::boxed::Box;
    use alloc::sync::Weak;

    struct NullOps;
    impl NodeOps for NullOps {}

    fn make_node(id: NodeId) -> Arc<VfsNode> {
        let stat = VfsStat {
            id,
            ..VfsStat::default()
        };
        VfsNode::new(Weak::new(), stat, Box::new(NullOps))
    }

    #[test]
    fn miss_reads_once_then_hits() {
        let cache = NodeCache::new();
        let (node, inserted) = cache.get_or_read(0, 7, || Ok(make_node(7))).unwrap();
        assert!(inserted);
        assert_eq!(node.ref_count.load(Ordering::Acquire), 1);
        let (again, inserted) = cache
            .get_or_read(0, 7, || panic!("must not re-read"))
            .unwrap();
        assert!(!inserted);
        assert!(Arc::ptr_eq(&node, &again));
        assert_eq!(node.ref_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn release_at_zero_evicts() {
        let cache = NodeCache::new();
        let (node, _) = cache.get_or_read(0, 9, || Ok(make_node(9))).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.release(&node), 0);
        assert_eq!(cache.len(), 0);
        assert!(cache.get(0, 9).is_none());
    }

    #[test]
    fn survives_growth() {
        let cache = NodeCache::new();
        let mut nodes = Vec::new();
        for id in 1..200 {
            let (node, _) = cache.get_or_read(0, id, || Ok(make_node(id))).unwrap();
            nodes.push(node);
        }
        for id in 1..200 {
            assert!(cache.get(0, id).is_some(), "id {}", id);
        }
    }
}
