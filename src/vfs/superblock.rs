//! Mounted filesystem instances.
//!
//! The superblock owns its root node and the node cache; nodes reach
//! back through weak references. Explicit reference counting decides
//! when write-back, storage free and superblock teardown happen; the
//! `Arc`s only keep memory alive.

use super::cache::NodeCache;
use super::node::{NodeId, VfsNode};
use crate::error::{Errno, Result};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Backend operations for one mounted filesystem.
pub trait SuperOps: Send + Sync {
    /// Materialize the node `id` from storage.
    fn read_node(&self, sb: &Arc<VfsSuperblock>, id: NodeId) -> Result<Arc<VfsNode>>;

    /// Allocate a fresh node id on storage.
    fn new_node(&self, sb: &Arc<VfsSuperblock>) -> Result<NodeId>;
}

static NEXT_SB_ID: AtomicUsize = AtomicUsize::new(1);

pub struct VfsSuperblock {
    pub id: usize,
    pub ref_count: AtomicUsize,
    root: Mutex<Option<Arc<VfsNode>>>,
    pub cache: NodeCache,
    pub ops: Box<dyn SuperOps>,
}

impl VfsSuperblock {
    /// A new superblock starts with the creation reference.
    pub fn new(ops: Box<dyn SuperOps>) -> Arc<VfsSuperblock> {
        Arc::new(VfsSuperblock {
            id: NEXT_SB_ID.fetch_add(1, Ordering::Relaxed),
            ref_count: AtomicUsize::new(1),
            root: Mutex::new(None),
            cache: NodeCache::new(),
            ops,
        })
    }

    pub fn set_root(&self, node: Arc<VfsNode>) {
        *self.root.lock() = Some(node);
    }

    pub fn root_node(&self) -> Arc<VfsNode> {
        self.root.lock().clone().expect("superblock has no root")
    }

    /// Nodes other callers still hold references into.
    pub fn busy_nodes(&self) -> usize {
        let root_refs = self
            .root
            .lock()
            .as_ref()
            .map(|root| root.ref_count.load(Ordering::Acquire))
            .unwrap_or(0);
        self.cache.len() + root_refs
    }
}

pub fn super_get(sb: &Arc<VfsSuperblock>) {
    sb.ref_count.fetch_add(1, Ordering::AcqRel);
}

/// Drop one superblock reference. The storage handle goes away with the
/// last one; by then only the unreferenced root node remains.
pub fn super_put(sb: &Arc<VfsSuperblock>) {
    if sb.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        *sb.root.lock() = None;
    }
}

/// Read a node through the cache, taking a reference. The root is pinned
/// and served directly.
pub fn read_node(sb: &Arc<VfsSuperblock>, id: NodeId) -> Result<Arc<VfsNode>> {
    let root = sb.root_node();
    if root.id() == id {
        node_get(&root);
        return Ok(root);
    }
    let (node, inserted) = sb
        .cache
        .get_or_read(sb.id, id, || sb.ops.read_node(sb, id))?;
    if inserted {
        // The first reference into a cached node pins the superblock.
        super_get(sb);
    }
    Ok(node)
}

/// Allocate a node on storage and hand back its in-memory handle.
pub fn new_node(sb: &Arc<VfsSuperblock>) -> Result<Arc<VfsNode>> {
    let id = sb.ops.new_node(sb)?;
    read_node(sb, id)
}

/// Take a reference on a node obtained elsewhere.
pub fn node_get(node: &Arc<VfsNode>) {
    match node.superblock.upgrade() {
        None => {
            node.ref_count.fetch_add(1, Ordering::AcqRel);
        }
        Some(sb) => {
            if sb.cache.retain(node) == 1 {
                super_get(&sb);
            }
        }
    }
}

/// Drop a node reference. The last one triggers eviction, storage free
/// for unlinked nodes, write-back for dirty ones, and releases the
/// superblock pin.
pub fn node_put(node: &Arc<VfsNode>) {
    let sb = match node.superblock.upgrade() {
        None => {
            // Special overlay node: on the last put, release the real
            // inode underneath.
            if node.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(real) = node.real.lock().take() {
                    node_put(&real);
                }
            }
            return;
        }
        Some(sb) => sb,
    };
    let is_root = {
        let root = sb.root_node();
        Arc::ptr_eq(&root, node)
    };
    if is_root {
        if node.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // The root is never evicted while mounted; just unpin.
            super_put(&sb);
        }
        return;
    }
    if sb.cache.release(node) == 0 {
        let nlinks = node.stat.lock().nlinks;
        if nlinks == 0 {
            if let Err(err) = node.ops.free_storage(node) {
                crate::warn!("dropping unlinked node {}: {:?}", node.id(), err);
            }
        } else if node.dirty.load(Ordering::Acquire) {
            if let Err(err) = node.ops.write_back(node) {
                crate::warn!("write-back of node {} failed: {:?}", node.id(), err);
            }
        }
        super_put(&sb);
    }
}

/// Record a metadata change; real write-back happens on the last close.
pub fn write_node(node: &Arc<VfsNode>) -> Result<()> {
    if node.superblock.upgrade().is_none() {
        return Ok(());
    }
    node.mark_dirty();
    Ok(())
}

/// Free a node's storage immediately (last link gone while unreferenced).
pub fn free_node(node: &Arc<VfsNode>) -> Result<()> {
    if node.superblock.upgrade().is_none() {
        return Err(Errno::EINVAL);
    }
    node.trunc(0)?;
    node.ops.free_storage(node)
}
