//! Block device files.
//!
//! Wraps a `BlockDevice` in a node so filesystems and user programs can
//! address it bytewise. Whole-sector spans go straight to the device;
//! unaligned heads and tails are read-modify-written through a bounce
//! sector.

use super::node::{NodeOps, VfsNode, VfsStat};
use super::superblock::node_get;
use crate::dev::BlockDevice;
use crate::error::Result;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;

pub struct BlockNodeOps {
    device: Arc<dyn BlockDevice>,
}

impl NodeOps for BlockNodeOps {
    fn read_at(&self, _node: &VfsNode, buf: &mut [u8], offset: usize) -> Result<usize> {
        let block_size = self.device.block_size();
        let mut bounce = vec![0u8; block_size];
        let total = buf.len();
        let mut position = 0;
        while position < total {
            let at = offset + position;
            let left = total - position;
            if at % block_size == 0 && left >= block_size {
                let span = left / block_size * block_size;
                self.device.read(&mut buf[position..position + span], at)?;
                position += span;
            } else {
                let sector_start = at / block_size * block_size;
                let inner = at % block_size;
                let span = left.min(block_size - inner);
                self.device.read(&mut bounce, sector_start)?;
                buf[position..position + span].copy_from_slice(&bounce[inner..inner + span]);
                position += span;
            }
        }
        Ok(total)
    }

    fn write_at(&self, _node: &VfsNode, buf: &[u8], offset: usize) -> Result<usize> {
        let block_size = self.device.block_size();
        let mut bounce = vec![0u8; block_size];
        let total = buf.len();
        let mut position = 0;
        while position < total {
            let at = offset + position;
            let left = total - position;
            if at % block_size == 0 && left >= block_size {
                let span = left / block_size * block_size;
                self.device.write(&buf[position..position + span], at)?;
                position += span;
            } else {
                // Partial sector: read, patch, write back.
                let sector_start = at / block_size * block_size;
                let inner = at % block_size;
                let span = left.min(block_size - inner);
                self.device.read(&mut bounce, sector_start)?;
                bounce[inner..inner + span].copy_from_slice(&buf[position..position + span]);
                self.device.write(&bounce, sector_start)?;
                position += span;
            }
        }
        Ok(total)
    }
}

/// Overlay a block device on top of the on-disk inode `real`.
pub fn create_block_node(device: Arc<dyn BlockDevice>, real: Arc<VfsNode>) -> Arc<VfsNode> {
    let stat = {
        let real_stat = real.stat.lock();
        VfsStat {
            size: device.size(),
            block_size: device.block_size(),
            blocks: device.size() / device.block_size(),
            ..*real_stat
        }
    };
    node_get(&real);
    let node = VfsNode::new(Weak::new(), stat, Box::new(BlockNodeOps { device }));
    node.ref_count
        .store(1, core::sync::atomic::Ordering::Release);
    *node.real.lock() = Some(real);
    node
}

/// A bare block node with no underlying inode (early boot, tests).
pub fn anonymous_block_node(device: Arc<dyn BlockDevice>) -> Arc<VfsNode> {
    use super::node::FileType;
    let stat = VfsStat {
        mode: FileType::Block.to_mode() | super::node::MODE_OWNER_RW,
        nlinks: 1,
        size: device.size(),
        block_size: device.block_size(),
        blocks: device.size() / device.block_size(),
        ..VfsStat::default()
    };
    let node = VfsNode::new(Weak::new(), stat, Box::new(BlockNodeOps { device }));
    node.ref_count
        .store(1, core::sync::atomic::Ordering::Release);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::ram::RamDisk;
    use alloc::vec::Vec;

    #[test]
    fn unaligned_write_read_round_trip() {
        let disk = Arc::new(RamDisk::new(512, 8));
        let node = anonymous_block_node(disk);
        let payload = b"spans a sector boundary";
        // 500 is mid-sector; the span crosses into sector 1.
        assert_eq!(node.write_at(payload, 500).unwrap(), payload.len());
        let mut back = [0u8; 23];
        assert_eq!(node.read_at(&mut back, 500).unwrap(), back.len());
        assert_eq!(&back, payload);
        // Bytes around the span stay zero.
        let mut guard = [0u8; 4];
        node.read_at(&mut guard, 496).unwrap();
        assert_eq!(guard, [0, 0, 0, 0]);
    }

    #[test]
    fn aligned_write_uses_whole_sectors() {
        let disk = Arc::new(RamDisk::new(512, 8));
        let node = anonymous_block_node(disk);
        let payload: Vec<u8> = vec![0x5au8; 1024];
        assert_eq!(node.write_at(&payload, 512).unwrap(), 1024);
        let mut back = vec![0u8; 1024];
        node.read_at(&mut back, 512).unwrap();
        assert_eq!(back, payload);
    }
}
