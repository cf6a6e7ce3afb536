//! Mount composition.
//!
//! The root superblock anchors every absolute walk; further filesystems
//! attach by setting a directory node's `mounted` slot. Unmounting is
//! refused while anything inside the mounted filesystem is still
//! referenced.

use super::node::VfsNode;
use super::superblock::{node_put, super_put, VfsSuperblock};
use crate::error::{Errno, Result};
use crate::process::Credentials;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct MountPoint {
    path: String,
    node: Arc<VfsNode>,
    sb: Arc<VfsSuperblock>,
}

static ROOT: Mutex<Option<Arc<VfsSuperblock>>> = Mutex::new(None);
static MOUNTS: Mutex<Vec<MountPoint>> = Mutex::new(Vec::new());

pub fn root_superblock() -> Option<Arc<VfsSuperblock>> {
    ROOT.lock().clone()
}

/// Install the root filesystem. The superblock's creation reference is
/// what keeps it alive.
pub fn mount_root(sb: Arc<VfsSuperblock>) -> Result<()> {
    let mut root = ROOT.lock();
    if root.is_some() {
        return Err(Errno::EBUSY);
    }
    *root = Some(sb);
    Ok(())
}

/// Mount `sb` over the directory at `path`. Takes over the superblock's
/// creation reference.
pub fn mount_at(
    creds: Option<&Credentials>,
    cwd: &str,
    path: &str,
    sb: Arc<VfsSuperblock>,
) -> Result<()> {
    if let Some(creds) = creds {
        if creds.euid != 0 {
            return Err(Errno::EPERM);
        }
    }
    let abs = super::path::absolute_path(cwd, path);
    let node = super::lookup_abs(&abs, creds)?;
    if !node.is_dir() {
        node_put(&node);
        return Err(Errno::ENOTDIR);
    }
    {
        let mut mounted = node.mounted.lock();
        if mounted.is_some() {
            drop(mounted);
            node_put(&node);
            return Err(Errno::EBUSY);
        }
        *mounted = Some(sb.clone());
    }
    crate::info!("mounted filesystem {} at {}", sb.id, abs);
    MOUNTS.lock().push(MountPoint {
        path: abs,
        node,
        sb,
    });
    Ok(())
}

/// Detach the filesystem mounted at `path`. Fails with EBUSY while nodes
/// of the mounted filesystem are still referenced.
pub fn umount(creds: Option<&Credentials>, cwd: &str, path: &str) -> Result<()> {
    if let Some(creds) = creds {
        if creds.euid != 0 {
            return Err(Errno::EPERM);
        }
    }
    let abs = super::path::absolute_path(cwd, path);
    let mut mounts = MOUNTS.lock();
    let index = mounts
        .iter()
        .position(|mp| mp.path == abs)
        .ok_or(Errno::ENOENT)?;
    if mounts[index].sb.busy_nodes() > 0 {
        return Err(Errno::EBUSY);
    }
    let mp = mounts.remove(index);
    drop(mounts);
    *mp.node.mounted.lock() = None;
    super_put(&mp.sb);
    node_put(&mp.node);
    crate::info!("unmounted {}", abs);
    Ok(())
}

/// Number of attached filesystems (excluding the root).
pub fn mount_count() -> usize {
    MOUNTS.lock().len()
}
