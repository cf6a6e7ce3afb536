//! Open files.
//!
//! A `VfsFile` couples a node reference with an offset and the open
//! flags. Files are shared between descriptors (dup, fork), so they
//! carry their own reference count; the node reference is released with
//! the last file reference.

use super::node::{FileType, VfsNode, VfsStat};
use super::pipe::{PipeEnd, PipeShared};
use super::superblock;
use crate::error::{Errno, Result};
use crate::process::Credentials;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

bitflags::bitflags! {
    /// Open flags as they appear in the syscall ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const APPEND = 0x0008;
        const CREATE = 0x0200;
        const TRUNC = 0x0400;
        const EXCL = 0x0800;
        const CLOEXEC = 0x40000;
        const EXECUTE = 0x100000;
        const DIRECTORY = 0x200000;
        const REGULAR = 0x400000;
    }
}

bitflags::bitflags! {
    /// Per-open-file state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const NONBLOCK = 1 << 2;
        const APPEND = 1 << 3;
    }
}

impl OpenFlags {
    pub fn file_flags(self) -> FileFlags {
        let mut flags = FileFlags::empty();
        if self.contains(OpenFlags::READ) {
            flags |= FileFlags::READ;
        }
        if self.contains(OpenFlags::WRITE) {
            flags |= FileFlags::WRITE;
        }
        if self.contains(OpenFlags::APPEND) {
            flags |= FileFlags::APPEND;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl SeekWhence {
    pub fn from_usize(value: usize) -> Result<SeekWhence> {
        match value {
            0 => Ok(SeekWhence::Set),
            1 => Ok(SeekWhence::Cur),
            2 => Ok(SeekWhence::End),
            _ => Err(Errno::EINVAL),
        }
    }
}

pub struct VfsFile {
    pub node: Arc<VfsNode>,
    /// Reduced absolute path this file was opened under.
    pub path: String,
    pub ref_count: AtomicUsize,
    offset: Mutex<usize>,
    flags: Mutex<FileFlags>,
    /// Set for pipe and fifo files.
    pub pipe: Option<PipeEnd>,
}

impl VfsFile {
    /// Wrap a node the caller already holds a reference on.
    pub fn new(node: Arc<VfsNode>, path: String, flags: FileFlags) -> Arc<VfsFile> {
        Arc::new(VfsFile {
            node,
            path,
            ref_count: AtomicUsize::new(1),
            offset: Mutex::new(0),
            flags: Mutex::new(flags),
            pipe: None,
        })
    }

    pub fn new_pipe(
        node: Arc<VfsNode>,
        path: String,
        flags: FileFlags,
        shared: Arc<PipeShared>,
        write_end: bool,
    ) -> Arc<VfsFile> {
        Arc::new(VfsFile {
            node,
            path,
            ref_count: AtomicUsize::new(1),
            offset: Mutex::new(0),
            flags: Mutex::new(flags),
            pipe: Some(PipeEnd { shared, write_end }),
        })
    }

    pub fn flags(&self) -> FileFlags {
        *self.flags.lock()
    }

    pub fn set_nonblock(&self, nonblock: bool) {
        let mut flags = self.flags.lock();
        if nonblock {
            *flags |= FileFlags::NONBLOCK;
        } else {
            *flags -= FileFlags::NONBLOCK;
        }
    }

    pub fn offset(&self) -> usize {
        *self.offset.lock()
    }

    pub fn readable(&self) -> bool {
        self.flags().contains(FileFlags::READ)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(FileFlags::WRITE)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.readable() {
            return Err(Errno::EBADF);
        }
        let mut offset = self.offset.lock();
        let read = self.node.read_at(buf, *offset)?;
        *offset += read;
        Ok(read)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(Errno::EBADF);
        }
        let mut offset = self.offset.lock();
        if self.flags().contains(FileFlags::APPEND) {
            *offset = self.node.size();
        }
        let written = self.node.write_at(buf, *offset)?;
        *offset += written;
        superblock::write_node(&self.node)?;
        Ok(written)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.node.read_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let written = self.node.write_at(buf, offset)?;
        superblock::write_node(&self.node)?;
        Ok(written)
    }

    pub fn seek(&self, offset: isize, whence: SeekWhence) -> Result<usize> {
        if self.pipe.is_some() {
            return Err(Errno::EINVAL);
        }
        let mut position = self.offset.lock();
        let base = match whence {
            SeekWhence::Set => 0isize,
            SeekWhence::Cur => *position as isize,
            SeekWhence::End => self.node.size() as isize,
        };
        let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        *position = target as usize;
        Ok(*position)
    }

    /// Stat reports the real inode for special overlay files.
    pub fn stat(self: &Arc<Self>) -> VfsStat {
        *self.node.real_node().stat.lock()
    }

    pub fn trunc(&self, length: usize) -> Result<()> {
        if !self.writable() {
            return Err(Errno::EBADF);
        }
        self.node.trunc(length)?;
        superblock::write_node(&self.node)
    }

    /// chmod goes to the real inode; the file type nibble is preserved.
    pub fn chmod(self: &Arc<Self>, creds: &Credentials, mode: u16) -> Result<()> {
        let node = self.node.real_node();
        {
            let mut stat = node.stat.lock();
            if creds.euid != 0 && creds.euid != stat.uid {
                return Err(Errno::EPERM);
            }
            stat.mode = (stat.mode & super::node::MODE_TYPE_MASK)
                | (mode & !super::node::MODE_TYPE_MASK);
        }
        superblock::write_node(&node)
    }

    pub fn chown(self: &Arc<Self>, creds: &Credentials, uid: i32, gid: i32) -> Result<()> {
        let node = self.node.real_node();
        {
            let mut stat = node.stat.lock();
            if creds.euid != 0 {
                return Err(Errno::EPERM);
            }
            if uid >= 0 {
                stat.uid = uid as u32;
            }
            if gid >= 0 {
                stat.gid = gid as u32;
            }
        }
        superblock::write_node(&node)
    }

    /// Read the next directory record, advancing the file offset.
    pub fn readdir(&self) -> Result<Option<super::node::DirEntry>> {
        let mut offset = self.offset.lock();
        let entry = self.node.readdir_at(*offset)?;
        if let Some(entry) = &entry {
            *offset = entry.offset;
        }
        Ok(entry)
    }

    pub fn ioctl(&self, request: usize, arg: usize) -> Result<isize> {
        self.node.ioctl(request, arg)
    }

    pub fn is_ready(&self, write: bool) -> bool {
        if let Some(end) = &self.pipe {
            return end.is_ready(write);
        }
        self.node.is_ready(write)
    }

    pub fn file_type(&self) -> FileType {
        self.node.file_type()
    }
}

pub fn file_get(file: &Arc<VfsFile>) {
    file.ref_count.fetch_add(1, Ordering::AcqRel);
}

/// Drop one file reference; the last one releases the node (and closes
/// the pipe end).
pub fn file_put(file: &Arc<VfsFile>) {
    if file.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(end) = &file.pipe {
            end.close();
            if !file.path.is_empty() {
                // Named pipe: drop the registry entry with the last end.
                super::pipe::fifo_gc(&file.path);
            }
        }
        superblock::node_put(&file.node);
    }
}

impl core::fmt::Debug for VfsFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VfsFile")
            .field("path", &self.path)
            .field("offset", &self.offset())
            .field("flags", &self.flags())
            .finish()
    }
}
