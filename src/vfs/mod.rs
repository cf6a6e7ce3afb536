//! Virtual file system.
//!
//! Uniform access to on-disk filesystems, device nodes, pipes and fifos.
//! Paths are reduced, walked from the root (or the caller's cwd) with a
//! parent stack, and every step first follows mount points. Reference
//! counts on nodes, files and superblocks drive cache eviction and
//! write-back.

pub mod blkfile;
pub mod cache;
pub mod chrfile;
pub mod file;
pub mod mount;
pub mod node;
pub mod path;
pub mod pipe;
pub mod superblock;

pub use file::{FileFlags, OpenFlags, SeekWhence, VfsFile};
pub use node::{DirEntry, FileType, NodeId, NodeOps, VfsNode, VfsStat};
pub use superblock::{SuperOps, VfsSuperblock};

use crate::error::{Errno, Result};
use crate::process::Credentials;
use crate::time::get_time;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use superblock::{node_get, node_put, read_node, write_node};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const DIR = 1 << 3;
        const REG = 1 << 4;
    }
}

/// Mode-bit permission check. Kernel callers (`None`) and uid 0 bypass.
pub fn can_access(stat: &VfsStat, creds: Option<&Credentials>, access: AccessFlags) -> bool {
    use node::*;
    let creds = match creds {
        None => return type_matches(stat, access),
        Some(creds) if creds.euid == 0 => return type_matches(stat, access),
        Some(creds) => creds,
    };
    let mode = stat.mode;
    let owner = stat.uid == creds.euid;
    let group = stat.gid == creds.egid;
    let allowed = |all: u16, grp: u16, own: u16| {
        mode & all != 0 || (group && mode & grp != 0) || (owner && mode & own != 0)
    };
    if access.contains(AccessFlags::READ) && !allowed(MODE_ALL_R, MODE_GROUP_R, MODE_OWNER_R) {
        return false;
    }
    if access.contains(AccessFlags::WRITE) && !allowed(MODE_ALL_W, MODE_GROUP_W, MODE_OWNER_W) {
        return false;
    }
    if access.contains(AccessFlags::EXEC) && !allowed(MODE_ALL_X, MODE_GROUP_X, MODE_OWNER_X) {
        return false;
    }
    type_matches(stat, access)
}

fn type_matches(stat: &VfsStat, access: AccessFlags) -> bool {
    if access.contains(AccessFlags::DIR) && stat.file_type() != FileType::Dir {
        return false;
    }
    if access.contains(AccessFlags::REG) && stat.file_type() != FileType::Regular {
        return false;
    }
    true
}

/// Substitute the root of whatever is mounted over `node`. Consumes the
/// caller's reference and returns an owned one.
fn follow_mounts(node: Arc<VfsNode>) -> Arc<VfsNode> {
    let mounted = node.mounted.lock().clone();
    match mounted {
        Some(sb) => {
            let root = sb.root_node();
            node_get(&root);
            node_put(&node);
            root
        }
        None => node,
    }
}

/// Walk `path` segments from `start` (an owned reference, consumed).
/// `.` and `..` are resolved structurally with a parent stack.
pub fn lookup_from(
    start: Arc<VfsNode>,
    path: &str,
    creds: Option<&Credentials>,
) -> Result<Arc<VfsNode>> {
    let mut parents: Vec<Arc<VfsNode>> = Vec::new();
    let mut current = start;
    let mut failed = None;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if let Some(parent) = parents.pop() {
                    node_put(&current);
                    current = parent;
                }
            }
            name => {
                current = follow_mounts(current);
                let stat = *current.stat.lock();
                if !can_access(&stat, creds, AccessFlags::EXEC | AccessFlags::DIR) {
                    failed = Some(if stat.file_type() == FileType::Dir {
                        Errno::EACCES
                    } else {
                        Errno::ENOTDIR
                    });
                    break;
                }
                let sb = match current.superblock.upgrade() {
                    Some(sb) => sb,
                    None => {
                        failed = Some(Errno::ENOTDIR);
                        break;
                    }
                };
                let id = match current.lookup_id(name) {
                    Ok(id) => id,
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                };
                let next = match read_node(&sb, id) {
                    Ok(next) => next,
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                };
                parents.push(current);
                current = next;
            }
        }
    }
    for parent in parents {
        node_put(&parent);
    }
    match failed {
        Some(err) => {
            node_put(&current);
            Err(err)
        }
        None => Ok(follow_mounts(current)),
    }
}

/// Walk an absolute, reduced path from the filesystem root.
pub fn lookup_abs(path: &str, creds: Option<&Credentials>) -> Result<Arc<VfsNode>> {
    let root_sb = mount::root_superblock().ok_or(Errno::ENOENT)?;
    let root = root_sb.root_node();
    node_get(&root);
    lookup_from(root, path, creds)
}

/// Create a node at `abs` in its parent's filesystem. Returns an owned
/// reference to the freshly linked node.
fn create_at(
    abs: &str,
    mode: u16,
    rdev: usize,
    creds: Option<&Credentials>,
) -> Result<Arc<VfsNode>> {
    let (parent_path, name) = path::split_parent(abs).ok_or(Errno::EEXIST)?;
    if name.len() >= 60 {
        return Err(Errno::EINVAL);
    }
    let parent = lookup_abs(&parent_path, creds)?;
    let parent_stat = *parent.stat.lock();
    if !can_access(
        &parent_stat,
        creds,
        AccessFlags::WRITE | AccessFlags::DIR,
    ) {
        node_put(&parent);
        return Err(Errno::EACCES);
    }
    let sb = match parent.superblock.upgrade() {
        Some(sb) => sb,
        None => {
            node_put(&parent);
            return Err(Errno::EINVAL);
        }
    };
    let node = match superblock::new_node(&sb) {
        Ok(node) => node,
        Err(err) => {
            node_put(&parent);
            return Err(err);
        }
    };
    {
        let mut stat = node.stat.lock();
        let now = get_time();
        stat.mode = mode;
        stat.uid = creds.map(|c| c.euid).unwrap_or(0);
        stat.gid = creds.map(|c| c.egid).unwrap_or(0);
        stat.nlinks = 0;
        stat.size = 0;
        stat.rdev = rdev;
        stat.atime = now;
        stat.mtime = now;
        stat.ctime = now;
    }
    let _ = write_node(&node);
    if let Err(err) = parent.link(name, &node) {
        node_put(&node);
        node_put(&parent);
        return Err(err);
    }
    node_put(&parent);
    Ok(node)
}

/// Wrap special-file nodes (devices, fifos) in their overlay node.
/// Consumes the walk reference, returns the node to hang the file on
/// plus the shared pipe state for fifos.
fn materialize_special(
    node: Arc<VfsNode>,
    abs: &str,
    flags: OpenFlags,
) -> Result<(Arc<VfsNode>, Option<Arc<pipe::PipeShared>>)> {
    match node.file_type() {
        FileType::Char => {
            let rdev = node.stat.lock().rdev;
            let device = crate::dev::char_device(rdev).ok_or(Errno::ENOENT);
            match device {
                Ok(device) => Ok((chrfile::create_tty_node(device, node), None)),
                Err(err) => {
                    node_put(&node);
                    Err(err)
                }
            }
        }
        FileType::Block => {
            let rdev = node.stat.lock().rdev;
            let device = crate::dev::block_device(rdev).ok_or(Errno::ENOENT);
            match device {
                Ok(device) => Ok((blkfile::create_block_node(device, node), None)),
                Err(err) => {
                    node_put(&node);
                    Err(err)
                }
            }
        }
        FileType::Fifo => {
            if flags.contains(OpenFlags::READ | OpenFlags::WRITE) {
                node_put(&node);
                return Err(Errno::EINVAL);
            }
            let shared = pipe::fifo_shared(abs);
            let stat = *node.stat.lock();
            let overlay = VfsNode::new(
                alloc::sync::Weak::new(),
                stat,
                alloc::boxed::Box::new(pipe::PipeNodeOps {
                    shared: shared.clone(),
                }),
            );
            overlay
                .ref_count
                .store(1, core::sync::atomic::Ordering::Release);
            *overlay.real.lock() = Some(node);
            Ok((overlay, Some(shared)))
        }
        _ => Ok((node, None)),
    }
}

/// The open path: walk, create on demand, check types and permissions,
/// wrap specials, honor TRUNC.
pub fn open(
    creds: Option<&Credentials>,
    umask: u16,
    cwd: &str,
    user_path: &str,
    flags: OpenFlags,
    mode: u16,
) -> Result<Arc<VfsFile>> {
    let abs = path::absolute_path(cwd, user_path);
    let node = match lookup_abs(&abs, creds) {
        Ok(node) => {
            if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                node_put(&node);
                return Err(Errno::EEXIST);
            }
            node
        }
        Err(Errno::ENOENT) if flags.contains(OpenFlags::CREATE) => {
            let file_mode = FileType::Regular.to_mode() | (mode & 0o777 & !umask);
            create_at(&abs, file_mode, 0, creds)?
        }
        Err(err) => return Err(err),
    };

    let stat = *node.stat.lock();
    let mut access = AccessFlags::empty();
    if flags.contains(OpenFlags::READ) {
        access |= AccessFlags::READ;
    }
    if flags.contains(OpenFlags::WRITE) {
        access |= AccessFlags::WRITE;
    }
    if flags.contains(OpenFlags::EXECUTE) {
        access |= AccessFlags::EXEC;
    }
    if flags.contains(OpenFlags::DIRECTORY) {
        access |= AccessFlags::DIR;
    }
    if flags.contains(OpenFlags::REGULAR) {
        access |= AccessFlags::REG;
    }
    if !can_access(&stat, creds, access) {
        let err = if !type_matches(&stat, access) {
            if stat.file_type() == FileType::Dir {
                Errno::EISDIR
            } else {
                Errno::ENOTDIR
            }
        } else {
            Errno::EACCES
        };
        node_put(&node);
        return Err(err);
    }
    if stat.file_type() == FileType::Dir && flags.contains(OpenFlags::WRITE) {
        node_put(&node);
        return Err(Errno::EISDIR);
    }

    let (node, fifo) = materialize_special(node, &abs, flags)?;
    if flags.contains(OpenFlags::TRUNC)
        && flags.contains(OpenFlags::WRITE)
        && node.file_type() == FileType::Regular
    {
        if let Err(err) = node.trunc(0) {
            node_put(&node);
            return Err(err);
        }
    }

    let file_flags = flags.file_flags();
    if let Some(shared) = fifo {
        let write_end = flags.contains(OpenFlags::WRITE);
        shared.add_end(write_end);
        return Ok(VfsFile::new_pipe(node, abs, file_flags, shared, write_end));
    }
    Ok(VfsFile::new(node, abs, file_flags))
}

/// Create a filesystem object without opening it (mknod).
pub fn mknod(
    creds: Option<&Credentials>,
    umask: u16,
    cwd: &str,
    user_path: &str,
    mode: u16,
    rdev: usize,
) -> Result<()> {
    let abs = path::absolute_path(cwd, user_path);
    match lookup_abs(&abs, creds) {
        Ok(node) => {
            node_put(&node);
            Err(Errno::EEXIST)
        }
        Err(Errno::ENOENT) => {
            let mode = if mode & node::MODE_TYPE_MASK == 0 {
                FileType::Regular.to_mode() | (mode & 0o777 & !umask)
            } else {
                (mode & node::MODE_TYPE_MASK) | (mode & 0o777 & !umask)
            };
            let node = create_at(&abs, mode, rdev, creds)?;
            node_put(&node);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn dir_is_empty(node: &Arc<VfsNode>) -> Result<bool> {
    let mut offset = 0;
    loop {
        match node.readdir_at(offset)? {
            None => return Ok(true),
            Some(entry) => {
                if entry.name != "." && entry.name != ".." {
                    return Ok(false);
                }
                offset = entry.offset;
            }
        }
    }
}

/// Remove a directory entry; storage is released once the last reference
/// and link are gone.
pub fn unlink(creds: Option<&Credentials>, cwd: &str, user_path: &str) -> Result<()> {
    let abs = path::absolute_path(cwd, user_path);
    let (parent_path, name) = path::split_parent(&abs).ok_or(Errno::EBUSY)?;
    if name == "." || name == ".." {
        return Err(Errno::EINVAL);
    }
    let parent = lookup_abs(&parent_path, creds)?;
    let result = (|| {
        let parent_stat = *parent.stat.lock();
        if !can_access(&parent_stat, creds, AccessFlags::WRITE | AccessFlags::DIR) {
            return Err(Errno::EACCES);
        }
        let sb = parent.superblock.upgrade().ok_or(Errno::EINVAL)?;
        let id = parent.lookup_id(name)?;
        let child = read_node(&sb, id)?;
        let child_result = (|| {
            if child.is_dir() && !dir_is_empty(&child)? {
                return Err(Errno::ENOTEMPTY);
            }
            parent.unlink(name, &child)
        })();
        node_put(&child);
        child_result
    })();
    node_put(&parent);
    result
}

/// Hard-link `old` at `new`. Both must live on the same filesystem.
pub fn link(creds: Option<&Credentials>, cwd: &str, old: &str, new: &str) -> Result<()> {
    let old_abs = path::absolute_path(cwd, old);
    let new_abs = path::absolute_path(cwd, new);
    let node = lookup_abs(&old_abs, creds)?;
    let result = (|| {
        if node.is_dir() {
            return Err(Errno::EPERM);
        }
        let (parent_path, name) = path::split_parent(&new_abs).ok_or(Errno::EEXIST)?;
        let parent = lookup_abs(&parent_path, creds)?;
        let link_result = (|| {
            let parent_stat = *parent.stat.lock();
            if !can_access(&parent_stat, creds, AccessFlags::WRITE | AccessFlags::DIR) {
                return Err(Errno::EACCES);
            }
            let parent_sb = parent.superblock.upgrade().ok_or(Errno::EINVAL)?;
            let node_sb = node.superblock.upgrade().ok_or(Errno::EXDEV)?;
            if parent_sb.id != node_sb.id {
                return Err(Errno::EXDEV);
            }
            if parent.lookup_id(name).is_ok() {
                return Err(Errno::EEXIST);
            }
            parent.link(name, &node)
        })();
        node_put(&parent);
        link_result
    })();
    node_put(&node);
    result
}

/// Rename as link-then-unlink; an existing target is replaced.
pub fn rename(creds: Option<&Credentials>, cwd: &str, old: &str, new: &str) -> Result<()> {
    let old_abs = path::absolute_path(cwd, old);
    let new_abs = path::absolute_path(cwd, new);
    if old_abs == new_abs {
        return Ok(());
    }
    let node = lookup_abs(&old_abs, creds)?;
    let result = (|| {
        let (new_parent_path, new_name) = path::split_parent(&new_abs).ok_or(Errno::EEXIST)?;
        let (old_parent_path, old_name) = path::split_parent(&old_abs).ok_or(Errno::EBUSY)?;
        let new_parent = lookup_abs(&new_parent_path, creds)?;
        let rename_result = (|| {
            let parent_stat = *new_parent.stat.lock();
            if !can_access(&parent_stat, creds, AccessFlags::WRITE | AccessFlags::DIR) {
                return Err(Errno::EACCES);
            }
            let new_sb = new_parent.superblock.upgrade().ok_or(Errno::EINVAL)?;
            let node_sb = node.superblock.upgrade().ok_or(Errno::EXDEV)?;
            if new_sb.id != node_sb.id {
                return Err(Errno::EXDEV);
            }
            if new_parent.lookup_id(new_name).is_ok() {
                unlink(creds, cwd, &new_abs)?;
            }
            new_parent.link(new_name, &node)?;
            let old_parent = lookup_abs(&old_parent_path, creds)?;
            let unlink_result = old_parent.unlink(old_name, &node);
            node_put(&old_parent);
            unlink_result
        })();
        node_put(&new_parent);
        rename_result
    })();
    node_put(&node);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::*;

    fn stat_with(mode: u16, uid: u32, gid: u32) -> VfsStat {
        VfsStat {
            mode,
            uid,
            gid,
            ..VfsStat::default()
        }
    }

    fn creds(euid: u32, egid: u32) -> Credentials {
        Credentials {
            ruid: euid,
            euid,
            suid: euid,
            rgid: egid,
            egid,
            sgid: egid,
        }
    }

    #[test]
    fn root_and_kernel_bypass_permissions() {
        let stat = stat_with(FileType::Regular.to_mode(), 10, 10);
        assert!(can_access(&stat, None, AccessFlags::WRITE));
        assert!(can_access(&stat, Some(&creds(0, 0)), AccessFlags::WRITE));
        assert!(!can_access(&stat, Some(&creds(7, 7)), AccessFlags::WRITE));
    }

    #[test]
    fn owner_group_other_bits() {
        let mode = FileType::Regular.to_mode() | MODE_OWNER_RW | MODE_GROUP_R;
        let stat = stat_with(mode, 10, 20);
        // Owner reads and writes.
        assert!(can_access(
            &stat,
            Some(&creds(10, 99)),
            AccessFlags::READ | AccessFlags::WRITE
        ));
        // Group member reads only.
        assert!(can_access(&stat, Some(&creds(11, 20)), AccessFlags::READ));
        assert!(!can_access(&stat, Some(&creds(11, 20)), AccessFlags::WRITE));
        // Others get nothing.
        assert!(!can_access(&stat, Some(&creds(11, 21)), AccessFlags::READ));
    }

    #[test]
    fn type_constraints() {
        let dir = stat_with(FileType::Dir.to_mode() | MODE_ALL_R, 0, 0);
        assert!(can_access(
            &dir,
            Some(&creds(5, 5)),
            AccessFlags::READ | AccessFlags::DIR
        ));
        assert!(!can_access(&dir, Some(&creds(5, 5)), AccessFlags::REG));
    }
}
