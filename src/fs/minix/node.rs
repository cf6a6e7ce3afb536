//! MINIX node operations: the zone walk and everything built on it.
//!
//! A recursive walk visits the inode's zone slots in file order: direct
//! slots 0..6, then the single-, double- and triple-indirect trees. The
//! visitor runs three times per slot: `pre` before descent (zone
//! allocation during writes), the leaf call for the actual transfer, and
//! `post` after descent (zone release during truncate). Indirect tables
//! are read into a scratch buffer and rewritten only when the visitor
//! changed them.

use super::{maps, MinixDirEntry, MinixFs, BLOCK_SIZE, DIRENT_SIZE, IPTRS_LOG2, IPTRS_PER_BLOCK};
use crate::error::{Errno, Result};
use crate::time::NANOS_PER_SEC;
use crate::vfs::node::{DirEntry, FileType, NodeId, NodeOps, VfsNode};
use alloc::sync::Arc;
use alloc::vec;
use core::ops::ControlFlow;
use spin::Mutex;

/// Directory scan chunk (64 KiB).
const MAX_LOOKUP_READ: usize = 1 << 16;

/// Visitor contract: (zone slot, table-changed flag, position, span,
/// pre, post) -> continue or stop the walk.
type Visitor<'a> =
    &'a mut dyn FnMut(&mut u32, &mut bool, usize, usize, bool, bool) -> Result<ControlFlow<()>>;

pub struct MinixNodeOps {
    pub fs: Arc<MinixFs>,
    pub zones: Mutex<[u32; 10]>,
    /// Serializes zone-structure changes on this node.
    lock: Mutex<()>,
}

fn scan_slots(
    fs: &MinixFs,
    position: &mut usize,
    offset: usize,
    depth: usize,
    table: &mut [u32],
    changed: &mut bool,
    visitor: Visitor<'_>,
) -> Result<ControlFlow<()>> {
    for slot in table.iter_mut() {
        let span = BLOCK_SIZE << (IPTRS_LOG2 * depth);
        if offset < *position + span {
            if visitor(slot, changed, *position, span, true, false)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if depth == 0 || *slot == 0 {
                let flow = visitor(slot, changed, *position, span, false, false)?;
                *position += span;
                if flow.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            } else if descend(fs, position, offset, depth - 1, *slot, visitor)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if visitor(slot, changed, *position - span, span, false, true)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        } else {
            *position += span;
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Walk one indirect table block, writing it back if modified.
fn descend(
    fs: &MinixFs,
    position: &mut usize,
    offset: usize,
    depth: usize,
    table_zone: u32,
    visitor: Visitor<'_>,
) -> Result<ControlFlow<()>> {
    let mut bytes = vec![0u8; BLOCK_SIZE];
    let read = fs
        .device
        .read_at(&mut bytes, MinixFs::zone_offset(table_zone as usize))?;
    if read != BLOCK_SIZE {
        return Err(Errno::EIO);
    }
    let mut table = [0u32; IPTRS_PER_BLOCK];
    for (i, entry) in table.iter_mut().enumerate() {
        *entry = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    let mut changed = false;
    let flow = scan_slots(fs, position, offset, depth, &mut table, &mut changed, visitor);
    if changed {
        for (i, entry) in table.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }
        fs.device
            .write_at(&bytes, MinixFs::zone_offset(table_zone as usize))?;
    }
    flow
}

impl MinixNodeOps {
    pub fn new(fs: Arc<MinixFs>, zones: [u32; 10]) -> MinixNodeOps {
        MinixNodeOps {
            fs,
            zones: Mutex::new(zones),
            lock: Mutex::new(()),
        }
    }

    /// Walk every zone overlapping `[offset, ..)` in file order. Rewrites
    /// the inode when a direct slot changed.
    fn zone_walk(&self, node: &VfsNode, offset: usize, visitor: Visitor<'_>) -> Result<()> {
        let mut zones = self.zones.lock();
        let mut position = 0;
        let mut changed = false;
        let mut flow =
            scan_slots(&self.fs, &mut position, offset, 0, &mut zones[0..7], &mut changed, visitor)?;
        for (index, depth) in [(7usize, 1usize), (8, 2), (9, 3)] {
            if flow.is_break() {
                break;
            }
            flow = scan_slots(
                &self.fs,
                &mut position,
                offset,
                depth,
                &mut zones[index..index + 1],
                &mut changed,
                visitor,
            )?;
        }
        if changed {
            let record = self.compose_inode(node, &zones);
            self.fs.write_inode(node.stat.lock().id as u32, &record)?;
        }
        Ok(())
    }

    fn compose_inode(&self, node: &VfsNode, zones: &[u32; 10]) -> super::DiskInode {
        let stat = node.stat.lock();
        let mut record = super::DiskInode {
            mode: stat.mode,
            nlinks: stat.nlinks as u16,
            uid: stat.uid as u16,
            gid: stat.gid as u16,
            size: stat.size as u32,
            atime: (stat.atime / NANOS_PER_SEC) as u32,
            mtime: (stat.mtime / NANOS_PER_SEC) as u32,
            ctime: (stat.ctime / NANOS_PER_SEC) as u32,
            zones: *zones,
        };
        // Device nodes keep their device id in the first zone slot.
        let file_type = stat.file_type();
        if file_type == FileType::Char || file_type == FileType::Block {
            record.zones[0] = stat.rdev as u32;
        }
        record
    }

    fn read_into(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize> {
        let _guard = self.lock.lock();
        let size = node.stat.lock().size;
        let length = if offset >= size {
            0
        } else {
            buf.len().min(size - offset)
        };
        if length == 0 {
            return Ok(0);
        }
        let fs = self.fs.clone();
        let mut done = 0usize;
        self.zone_walk(node, offset, &mut |zone, _changed, position, span, pre, post| {
            if pre || post || done >= length {
                return Ok(if done >= length {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                });
            }
            let file_offset = offset.max(position);
            let chunk = (length - done).min(position + span - file_offset);
            if *zone == 0 {
                // Holes read as zeros.
                buf[done..done + chunk].fill(0);
            } else {
                let block_offset = file_offset - position;
                let read = fs.device.read_at(
                    &mut buf[done..done + chunk],
                    MinixFs::zone_offset(*zone as usize) + block_offset,
                )?;
                if read != chunk {
                    return Err(Errno::EIO);
                }
            }
            done += chunk;
            Ok(if done >= length {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;
        Ok(done)
    }

    fn write_from(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize> {
        let _guard = self.lock.lock();
        let length = buf.len();
        if length == 0 {
            return Ok(0);
        }
        let fs = self.fs.clone();
        let zero_block = [0u8; BLOCK_SIZE];
        let mut done = 0usize;
        self.zone_walk(node, offset, &mut |zone, changed, position, span, pre, post| {
            if pre {
                if *zone == 0 && done < length {
                    // Allocate and disk-zero a fresh zone (or indirect
                    // table) before anything descends into it.
                    let new_zone = maps::alloc_zone(&fs)?;
                    let written = fs
                        .device
                        .write_at(&zero_block, MinixFs::zone_offset(new_zone))?;
                    if written != BLOCK_SIZE {
                        return Err(Errno::EIO);
                    }
                    *zone = new_zone as u32;
                    *changed = true;
                }
                return Ok(ControlFlow::Continue(()));
            }
            if post || done >= length {
                return Ok(if done >= length {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                });
            }
            let file_offset = offset.max(position);
            let chunk = (length - done).min(position + span - file_offset);
            let block_offset = file_offset - position;
            let written = fs.device.write_at(
                &buf[done..done + chunk],
                MinixFs::zone_offset(*zone as usize) + block_offset,
            )?;
            if written != chunk {
                return Err(Errno::EIO);
            }
            done += chunk;
            Ok(if done >= length {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })?;
        {
            let mut stat = node.stat.lock();
            if offset + done > stat.size {
                stat.size = offset + done;
            }
        }
        let zones = *self.zones.lock();
        let record = self.compose_inode(node, &zones);
        self.fs.write_inode(node.stat.lock().id as u32, &record)?;
        Ok(done)
    }
}

impl NodeOps for MinixNodeOps {
    fn read_at(&self, node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.read_into(node, buf, offset)
    }

    fn write_at(&self, node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize> {
        self.write_from(node, buf, offset)
    }

    fn trunc(&self, node: &VfsNode, length: usize) -> Result<()> {
        let _guard = self.lock.lock();
        let fs = self.fs.clone();
        let zero_block = [0u8; BLOCK_SIZE];
        self.zone_walk(node, length, &mut |zone, changed, position, span, pre, post| {
            if *zone == 0 || pre {
                return Ok(ControlFlow::Continue(()));
            }
            if post {
                if length <= position {
                    // Entirely past the cut: release the zone (indirect
                    // tables fall here once their children are gone).
                    maps::free_zone(&fs, *zone as usize)?;
                    *zone = 0;
                    *changed = true;
                }
                return Ok(ControlFlow::Continue(()));
            }
            // Leaf straddling the cut: zero the tail on disk.
            if length > position && length < position + span {
                let block_offset = length - position;
                let written = fs.device.write_at(
                    &zero_block[..BLOCK_SIZE - block_offset],
                    MinixFs::zone_offset(*zone as usize) + block_offset,
                )?;
                if written != BLOCK_SIZE - block_offset {
                    return Err(Errno::EIO);
                }
            }
            Ok(ControlFlow::Continue(()))
        })?;
        {
            let mut stat = node.stat.lock();
            stat.size = length;
        }
        let zones = *self.zones.lock();
        let record = self.compose_inode(node, &zones);
        self.fs.write_inode(node.stat.lock().id as u32, &record)
    }

    fn lookup(&self, node: &VfsNode, name: &str) -> Result<NodeId> {
        self.find_entry(node, name).map(|(inode, _)| inode as NodeId)
    }

    fn readdir_at(&self, node: &VfsNode, mut offset: usize) -> Result<Option<DirEntry>> {
        let size = node.stat.lock().size;
        loop {
            if offset >= size {
                return Ok(None);
            }
            let mut bytes = [0u8; DIRENT_SIZE];
            let read = self.read_into(node, &mut bytes, offset)?;
            if read != DIRENT_SIZE {
                return Err(Errno::EIO);
            }
            offset += DIRENT_SIZE;
            let entry = MinixDirEntry::parse(&bytes);
            if entry.inode == 0 {
                continue;
            }
            return Ok(Some(DirEntry {
                id: entry.inode as NodeId,
                offset,
                file_type: FileType::Unknown,
                name: alloc::string::String::from(entry.name_str()),
            }));
        }
    }

    fn link(&self, node: &VfsNode, name: &str, entry: &VfsNode) -> Result<()> {
        if self.find_entry(node, name).is_ok() {
            return Err(Errno::EEXIST);
        }
        let record = MinixDirEntry::new(entry.stat.lock().id as u32, name);
        let size = node.stat.lock().size;
        let written = self.write_from(node, &record.to_bytes(), size)?;
        if written != DIRENT_SIZE {
            return Err(Errno::EIO);
        }
        Ok(())
    }

    fn unlink(&self, node: &VfsNode, name: &str) -> Result<()> {
        let (_, entry_offset) = self.find_entry(node, name)?;
        let size = node.stat.lock().size;
        // Swap the tail record into the vacated slot, then cut the tail.
        let mut tail = [0u8; DIRENT_SIZE];
        let read = self.read_into(node, &mut tail, size - DIRENT_SIZE)?;
        if read != DIRENT_SIZE {
            return Err(Errno::EIO);
        }
        if entry_offset != size - DIRENT_SIZE {
            let written = self.write_from(node, &tail, entry_offset)?;
            if written != DIRENT_SIZE {
                return Err(Errno::EIO);
            }
        }
        self.trunc(node, size - DIRENT_SIZE)
    }

    fn write_back(&self, node: &VfsNode) -> Result<()> {
        let zones = *self.zones.lock();
        let record = self.compose_inode(node, &zones);
        self.fs.write_inode(node.stat.lock().id as u32, &record)
    }

    fn free_storage(&self, node: &VfsNode) -> Result<()> {
        self.trunc(node, 0)?;
        maps::free_inode(&self.fs, node.stat.lock().id as u32)
    }
}

impl MinixNodeOps {
    /// Scan the directory in 64 KiB chunks for `name`; returns the inode
    /// number and the record's file offset.
    fn find_entry(&self, node: &VfsNode, name: &str) -> Result<(u32, usize)> {
        let size = node.stat.lock().size;
        let mut offset = 0;
        let mut buffer = vec![0u8; MAX_LOOKUP_READ.min(size.max(DIRENT_SIZE))];
        while offset < size {
            let chunk = (size - offset).min(MAX_LOOKUP_READ);
            let read = self.read_into(node, &mut buffer[..chunk], offset)?;
            if read == 0 {
                return Err(Errno::EIO);
            }
            for index in 0..read / DIRENT_SIZE {
                let entry =
                    MinixDirEntry::parse(&buffer[index * DIRENT_SIZE..(index + 1) * DIRENT_SIZE]);
                if entry.inode != 0 && entry.name_str() == name {
                    return Ok((entry.inode, offset + index * DIRENT_SIZE));
                }
            }
            offset += read;
        }
        Err(Errno::ENOENT)
    }
}
