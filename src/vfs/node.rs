//! In-memory filesystem nodes.
//!
//! A node is the runtime handle for one filesystem object. Real nodes
//! belong to a superblock and live in its cache; special nodes (pipe,
//! fifo, tty, block wrapper) have no superblock and point at the real
//! inode they overlay through `real`.

use super::superblock::VfsSuperblock;
use crate::error::{Errno, Result};
use crate::time::{get_time, Time};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicUsize};
use spin::Mutex;

pub type NodeId = usize;

/// File type nibble stored in mode bits 12..15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FileType {
    Unknown = 0,
    Fifo = 1,
    Char = 2,
    Dir = 4,
    Block = 6,
    Regular = 8,
    Link = 10,
    Socket = 12,
}

impl FileType {
    pub fn from_mode(mode: u16) -> FileType {
        match mode >> 12 {
            1 => FileType::Fifo,
            2 => FileType::Char,
            4 => FileType::Dir,
            6 => FileType::Block,
            8 => FileType::Regular,
            10 => FileType::Link,
            12 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn to_mode(self) -> u16 {
        (self as u16) << 12
    }
}

// Permission bits as used on disk and in the syscall ABI.
pub const MODE_ALL_X: u16 = 1 << 0;
pub const MODE_ALL_W: u16 = 1 << 1;
pub const MODE_ALL_R: u16 = 1 << 2;
pub const MODE_GROUP_X: u16 = 1 << 3;
pub const MODE_GROUP_W: u16 = 1 << 4;
pub const MODE_GROUP_R: u16 = 1 << 5;
pub const MODE_OWNER_X: u16 = 1 << 6;
pub const MODE_OWNER_W: u16 = 1 << 7;
pub const MODE_OWNER_R: u16 = 1 << 8;
pub const MODE_STICKY: u16 = 1 << 9;
pub const MODE_SETUID: u16 = 1 << 10;
pub const MODE_SETGID: u16 = 1 << 11;
pub const MODE_TYPE_MASK: u16 = 0xf << 12;

pub const MODE_ALL_RW: u16 = MODE_ALL_R | MODE_ALL_W;
pub const MODE_GROUP_RW: u16 = MODE_GROUP_R | MODE_GROUP_W;
pub const MODE_OWNER_RW: u16 = MODE_OWNER_R | MODE_OWNER_W;

#[derive(Debug, Clone, Copy, Default)]
pub struct VfsStat {
    pub dev: usize,
    pub id: NodeId,
    pub mode: u16,
    pub nlinks: usize,
    pub uid: u32,
    pub gid: u32,
    pub rdev: usize,
    pub size: usize,
    pub block_size: usize,
    pub blocks: usize,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

impl VfsStat {
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// A directory record as handed to readdir.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub id: NodeId,
    pub offset: usize,
    pub file_type: FileType,
    pub name: String,
}

/// Node operations vtable. Backends implement what they support; the
/// defaults reject the operation.
pub trait NodeOps: Send + Sync {
    fn read_at(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize> {
        let _ = (node, buf, offset);
        Err(Errno::EINVAL)
    }

    fn write_at(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize> {
        let _ = (node, buf, offset);
        Err(Errno::EINVAL)
    }

    fn trunc(&self, node: &VfsNode, length: usize) -> Result<()> {
        let _ = (node, length);
        Err(Errno::EINVAL)
    }

    /// Read one directory record at `offset`; None at end.
    fn readdir_at(&self, node: &VfsNode, offset: usize) -> Result<Option<DirEntry>> {
        let _ = (node, offset);
        Err(Errno::ENOTDIR)
    }

    fn lookup(&self, node: &VfsNode, name: &str) -> Result<NodeId> {
        let _ = (node, name);
        Err(Errno::ENOTDIR)
    }

    fn link(&self, node: &VfsNode, name: &str, entry: &VfsNode) -> Result<()> {
        let _ = (node, name, entry);
        Err(Errno::ENOTSUP)
    }

    fn unlink(&self, node: &VfsNode, name: &str) -> Result<()> {
        let _ = (node, name);
        Err(Errno::ENOTSUP)
    }

    fn ioctl(&self, node: &VfsNode, request: usize, arg: usize) -> Result<isize> {
        let _ = (node, request, arg);
        Err(Errno::ENOTSUP)
    }

    /// Would a read (or write) complete without blocking?
    fn is_ready(&self, node: &VfsNode, write: bool) -> bool {
        let _ = (node, write);
        true
    }

    /// Park `task` on this node's wait list until data arrives.
    fn register_waiter(&self, node: &VfsNode, task: &alloc::sync::Arc<crate::task::Task>) {
        let _ = (node, task);
    }

    /// Flush the node's metadata to storage.
    fn write_back(&self, node: &VfsNode) -> Result<()> {
        let _ = node;
        Ok(())
    }

    /// Release backing storage once the last link and reference are gone.
    fn free_storage(&self, node: &VfsNode) -> Result<()> {
        let _ = node;
        Ok(())
    }
}

pub struct VfsNode {
    pub stat: Mutex<VfsStat>,
    pub superblock: Weak<VfsSuperblock>,
    pub ref_count: AtomicUsize,
    /// Superblock mounted over this node, if any.
    pub mounted: Mutex<Option<Arc<VfsSuperblock>>>,
    /// The underlying real inode for special-file overlay nodes.
    pub real: Mutex<Option<Arc<VfsNode>>>,
    pub dirty: AtomicBool,
    pub ops: Box<dyn NodeOps>,
}

impl VfsNode {
    pub fn new(
        superblock: Weak<VfsSuperblock>,
        stat: VfsStat,
        ops: Box<dyn NodeOps>,
    ) -> Arc<VfsNode> {
        Arc::new(VfsNode {
            stat: Mutex::new(stat),
            superblock,
            ref_count: AtomicUsize::new(0),
            mounted: Mutex::new(None),
            real: Mutex::new(None),
            dirty: AtomicBool::new(false),
            ops,
        })
    }

    pub fn id(&self) -> NodeId {
        self.stat.lock().id
    }

    pub fn file_type(&self) -> FileType {
        self.stat.lock().file_type()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Dir
    }

    pub fn size(&self) -> usize {
        self.stat.lock().size
    }

    /// The node stat calls should report: special nodes pass through to
    /// the inode they overlay.
    pub fn real_node(self: &Arc<Self>) -> Arc<VfsNode> {
        self.real.lock().clone().unwrap_or_else(|| self.clone())
    }

    /// Mark metadata changed; flushed when the last reference drops.
    pub fn mark_dirty(&self) {
        self.stat.lock().ctime = get_time();
        self.dirty.store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.stat.lock().atime = get_time();
        self.ops.read_at(self, buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize> {
        {
            let mut stat = self.stat.lock();
            let now = get_time();
            stat.atime = now;
            stat.mtime = now;
        }
        self.ops.write_at(self, buf, offset)
    }

    pub fn trunc(&self, length: usize) -> Result<()> {
        self.ops.trunc(self, length)
    }

    pub fn lookup_id(&self, name: &str) -> Result<NodeId> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.ops.lookup(self, name)
    }

    pub fn readdir_at(&self, offset: usize) -> Result<Option<DirEntry>> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.ops.readdir_at(self, offset)
    }

    /// Add a directory entry for `entry` and bump its link count.
    pub fn link(&self, name: &str, entry: &Arc<VfsNode>) -> Result<()> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.ops.link(self, name, entry)?;
        entry.stat.lock().nlinks += 1;
        entry.mark_dirty();
        Ok(())
    }

    /// Remove the entry `name` pointing at `entry`; drops its link count.
    pub fn unlink(&self, name: &str, entry: &Arc<VfsNode>) -> Result<()> {
        if !self.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.ops.unlink(self, name)?;
        {
            let mut stat = entry.stat.lock();
            stat.nlinks = stat.nlinks.saturating_sub(1);
        }
        entry.mark_dirty();
        Ok(())
    }

    pub fn ioctl(&self, request: usize, arg: usize) -> Result<isize> {
        self.ops.ioctl(self, request, arg)
    }

    pub fn is_ready(&self, write: bool) -> bool {
        self.ops.is_ready(self, write)
    }
}

impl core::fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let stat = self.stat.lock();
        f.debug_struct("VfsNode")
            .field("id", &stat.id)
            .field("type", &stat.file_type())
            .field("nlinks", &stat.nlinks)
            .field("size", &stat.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_type_round_trip() {
        for file_type in [
            FileType::Fifo,
            FileType::Char,
            FileType::Dir,
            FileType::Block,
            FileType::Regular,
            FileType::Link,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_mode(file_type.to_mode() | 0o644), file_type);
        }
        assert_eq!(FileType::from_mode(0o644), FileType::Unknown);
    }
}
