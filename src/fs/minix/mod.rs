//! MINIX3 filesystem.
//!
//! On-disk layout with 1024-byte blocks: boot block, superblock, inode
//! bitmap, zone bitmap, inode table, data zones. An inode carries ten
//! zone slots: seven direct, then single-, double- and triple-indirect
//! tables of 256 zone pointers each. All fields are little-endian.

pub mod maps;
pub mod node;
pub mod superblock;

pub use superblock::create_minix_superblock;

use crate::error::{Errno, Result};
use crate::vfs::file::VfsFile;
use alloc::sync::Arc;
use spin::Mutex;

pub const MINIX_MAGIC: u16 = 0x4d5a;
pub const BLOCK_SIZE: usize = 1024;
/// Zone pointers per indirect block.
pub const IPTRS_PER_BLOCK: usize = 256;
pub const IPTRS_LOG2: usize = 8;
pub const INODE_SIZE: usize = 64;
pub const DIRENT_SIZE: usize = 64;
pub const NAME_LEN: usize = 60;
/// Direct zone slots in an inode.
pub const DIRECT_ZONES: usize = 7;

/// Block 1 of the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSuperblock {
    pub ninodes: u32,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    pub first_data_zone: u16,
    pub log_zone_size: u16,
    pub max_size: u32,
    pub zones: u32,
    pub magic: u16,
    pub block_size: u16,
    pub disk_version: u8,
}

impl DiskSuperblock {
    pub fn parse(bytes: &[u8]) -> DiskSuperblock {
        let u16_at = |off: usize| u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        DiskSuperblock {
            ninodes: u32_at(0),
            imap_blocks: u16_at(6),
            zmap_blocks: u16_at(8),
            first_data_zone: u16_at(10),
            log_zone_size: u16_at(12),
            max_size: u32_at(16),
            zones: u32_at(20),
            magic: u16_at(24),
            block_size: u16_at(28),
            disk_version: bytes[30],
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[0..4].copy_from_slice(&self.ninodes.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.imap_blocks.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.zmap_blocks.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.first_data_zone.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.log_zone_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.max_size.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.zones.to_le_bytes());
        bytes[24..26].copy_from_slice(&self.magic.to_le_bytes());
        bytes[28..30].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[30] = self.disk_version;
        bytes
    }
}

/// One on-disk inode record. Times are unix seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub nlinks: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub zones: [u32; 10],
}

impl DiskInode {
    pub fn parse(bytes: &[u8]) -> DiskInode {
        let u16_at = |off: usize| u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let mut zones = [0u32; 10];
        for (i, zone) in zones.iter_mut().enumerate() {
            *zone = u32_at(24 + i * 4);
        }
        DiskInode {
            mode: u16_at(0),
            nlinks: u16_at(2),
            uid: u16_at(4),
            gid: u16_at(6),
            size: u32_at(8),
            atime: u32_at(12),
            mtime: u32_at(16),
            ctime: u32_at(20),
            zones,
        }
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut bytes = [0u8; INODE_SIZE];
        bytes[0..2].copy_from_slice(&self.mode.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.nlinks.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.uid.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.gid.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.atime.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.mtime.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.ctime.to_le_bytes());
        for (i, zone) in self.zones.iter().enumerate() {
            bytes[24 + i * 4..28 + i * 4].copy_from_slice(&zone.to_le_bytes());
        }
        bytes
    }
}

/// A 64-byte directory record: inode number plus NUL-terminated name.
#[derive(Debug, Clone, Copy)]
pub struct MinixDirEntry {
    pub inode: u32,
    pub name: [u8; NAME_LEN],
}

impl MinixDirEntry {
    pub fn new(inode: u32, name: &str) -> MinixDirEntry {
        let mut entry = MinixDirEntry {
            inode,
            name: [0; NAME_LEN],
        };
        let len = name.len().min(NAME_LEN - 1);
        entry.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        entry
    }

    pub fn parse(bytes: &[u8]) -> MinixDirEntry {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&bytes[4..DIRENT_SIZE]);
        MinixDirEntry {
            inode: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            name,
        }
    }

    pub fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes[0..4].copy_from_slice(&self.inode.to_le_bytes());
        bytes[4..DIRENT_SIZE].copy_from_slice(&self.name);
        bytes
    }

    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Shared per-mount state: the backing block-device file, the parsed
/// superblock and the bitmap lock.
pub struct MinixFs {
    pub device: Arc<VfsFile>,
    pub sb: DiskSuperblock,
    pub maps_lock: Mutex<()>,
}

impl Drop for MinixFs {
    fn drop(&mut self) {
        crate::vfs::file::file_put(&self.device);
    }
}

impl MinixFs {
    pub fn inode_offset(&self, inode: u32) -> usize {
        (2 + self.sb.imap_blocks as usize + self.sb.zmap_blocks as usize) * BLOCK_SIZE
            + (inode as usize - 1) * INODE_SIZE
    }

    pub fn zone_offset(zone: usize) -> usize {
        zone * BLOCK_SIZE
    }

    pub fn read_inode(&self, inode: u32) -> Result<DiskInode> {
        if inode == 0 || inode > self.sb.ninodes {
            return Err(Errno::ENOENT);
        }
        let mut bytes = [0u8; INODE_SIZE];
        let read = self.device.read_at(&mut bytes, self.inode_offset(inode))?;
        if read != INODE_SIZE {
            return Err(Errno::EIO);
        }
        Ok(DiskInode::parse(&bytes))
    }

    pub fn write_inode(&self, inode: u32, record: &DiskInode) -> Result<()> {
        let written = self
            .device
            .write_at(&record.to_bytes(), self.inode_offset(inode))?;
        if written != INODE_SIZE {
            return Err(Errno::EIO);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testfs {
    //! In-memory image builder for the unit tests.

    use super::*;
    use crate::dev::ram::RamDisk;
    use crate::vfs::blkfile::anonymous_block_node;
    use crate::vfs::file::{FileFlags, VfsFile};
    use crate::vfs::node::FileType;
    use alloc::string::String;
    use alloc::vec;

    /// Build a fresh filesystem image and hand back the device file.
    /// Inode 1 is an empty root directory.
    pub fn mkfs(total_blocks: usize, ninodes: u32) -> Arc<VfsFile> {
        let inode_blocks = (ninodes as usize * INODE_SIZE + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let first_data = 2 + 1 + 1 + inode_blocks;
        let sb = DiskSuperblock {
            ninodes,
            imap_blocks: 1,
            zmap_blocks: 1,
            first_data_zone: first_data as u16,
            log_zone_size: 0,
            max_size: u32::MAX,
            zones: total_blocks as u32,
            magic: MINIX_MAGIC,
            block_size: BLOCK_SIZE as u16,
            disk_version: 3,
        };
        let mut image = vec![0u8; total_blocks * BLOCK_SIZE];
        image[BLOCK_SIZE..BLOCK_SIZE + 32].copy_from_slice(&sb.to_bytes());
        // Inode map: bit 0 reserved, bit 1 the root inode.
        image[2 * BLOCK_SIZE] = 0b11;
        // Zone map: everything below the first data zone is taken.
        for zone in 0..first_data {
            image[3 * BLOCK_SIZE + zone / 8] |= 1 << (zone % 8);
        }
        // Root inode record.
        let root = DiskInode {
            mode: FileType::Dir.to_mode() | 0o755,
            nlinks: 1,
            ..DiskInode::default()
        };
        let root_offset = 4 * BLOCK_SIZE;
        image[root_offset..root_offset + INODE_SIZE].copy_from_slice(&root.to_bytes());

        let disk = Arc::new(RamDisk::from_image(BLOCK_SIZE, image));
        let node = anonymous_block_node(disk);
        VfsFile::new(node, String::new(), FileFlags::READ | FileFlags::WRITE)
    }
}
