//! Mounting a MINIX filesystem: superblock parsing and node I/O.

use super::node::MinixNodeOps;
use super::{maps, DiskInode, MinixFs, BLOCK_SIZE, INODE_SIZE, MINIX_MAGIC};
use crate::error::{Errno, Result};
use crate::time::NANOS_PER_SEC;
use crate::vfs::file::{file_get, VfsFile};
use crate::vfs::node::{FileType, NodeId, VfsNode, VfsStat};
use crate::vfs::superblock::{SuperOps, VfsSuperblock};
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

struct MinixSuperOps {
    fs: Arc<MinixFs>,
}

/// Build the in-memory node for `id` from its on-disk record.
fn node_from_record(
    fs: &Arc<MinixFs>,
    sb: &Arc<VfsSuperblock>,
    id: u32,
    record: DiskInode,
) -> Arc<VfsNode> {
    let mut stat = VfsStat {
        dev: sb.id,
        id: id as NodeId,
        mode: record.mode,
        nlinks: record.nlinks as usize,
        uid: record.uid as u32,
        gid: record.gid as u32,
        rdev: 0,
        size: record.size as usize,
        block_size: BLOCK_SIZE,
        blocks: 0,
        atime: record.atime as u64 * NANOS_PER_SEC,
        mtime: record.mtime as u64 * NANOS_PER_SEC,
        ctime: record.ctime as u64 * NANOS_PER_SEC,
    };
    let file_type = stat.file_type();
    if file_type == FileType::Char || file_type == FileType::Block {
        // Device nodes carry the device id in the first zone slot.
        stat.rdev = record.zones[0] as usize;
    }
    VfsNode::new(
        Arc::downgrade(sb),
        stat,
        Box::new(MinixNodeOps::new(fs.clone(), record.zones)),
    )
}

impl SuperOps for MinixSuperOps {
    fn read_node(&self, sb: &Arc<VfsSuperblock>, id: NodeId) -> Result<Arc<VfsNode>> {
        let record = self.fs.read_inode(id as u32)?;
        Ok(node_from_record(&self.fs, sb, id as u32, record))
    }

    fn new_node(&self, _sb: &Arc<VfsSuperblock>) -> Result<NodeId> {
        let inode = maps::alloc_inode(&self.fs)?;
        // Zero the record so stale zone pointers never resurface.
        self.fs.write_inode(inode, &DiskInode::default())?;
        Ok(inode as NodeId)
    }
}

/// Read and validate the superblock of the filesystem behind
/// `device` and assemble the mountable instance. Keeps its own
/// reference on the device file.
pub fn create_minix_superblock(device: Arc<VfsFile>) -> Result<Arc<VfsSuperblock>> {
    let mut bytes = [0u8; 32];
    let read = device.read_at(&mut bytes, BLOCK_SIZE)?;
    if read != bytes.len() {
        return Err(Errno::EIO);
    }
    let disk_sb = super::DiskSuperblock::parse(&bytes);
    if disk_sb.magic != MINIX_MAGIC {
        return Err(Errno::EINVAL);
    }
    if disk_sb.block_size as usize != BLOCK_SIZE {
        return Err(Errno::EINVAL);
    }
    file_get(&device);
    let fs = Arc::new(MinixFs {
        device,
        sb: disk_sb,
        maps_lock: Mutex::new(()),
    });
    let sb = VfsSuperblock::new(Box::new(MinixSuperOps { fs: fs.clone() }));
    let root_record = fs.read_inode(1)?;
    if FileType::from_mode(root_record.mode) != FileType::Dir {
        return Err(Errno::EINVAL);
    }
    let root = node_from_record(&fs, &sb, 1, root_record);
    sb.set_root(root);
    crate::debug!(
        "minix: {} inodes, {} zones, first data zone {}",
        disk_sb.ninodes,
        disk_sb.zones,
        disk_sb.first_data_zone
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::super::testfs::mkfs;
    use super::*;
    use crate::vfs::node::{MODE_OWNER_RW, MODE_OWNER_R};
    use crate::vfs::superblock::{new_node, node_put, read_node};
    use alloc::vec;
    use alloc::vec::Vec;

    fn fresh_fs() -> Arc<VfsSuperblock> {
        create_minix_superblock(mkfs(4096, 64)).unwrap()
    }

    fn make_file(sb: &Arc<VfsSuperblock>, name: &str) -> Arc<VfsNode> {
        let node = new_node(sb).unwrap();
        {
            let mut stat = node.stat.lock();
            stat.mode = FileType::Regular.to_mode() | MODE_OWNER_RW | MODE_OWNER_R;
        }
        let root = sb.root_node();
        root.link(name, &node).unwrap();
        node
    }

    #[test]
    fn mount_rejects_bad_magic() {
        let device = mkfs(64, 16);
        let garbage = [0u8; 32];
        device.write_at(&garbage, BLOCK_SIZE).unwrap();
        assert!(create_minix_superblock(device).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let sb = fresh_fs();
        let node = make_file(&sb, "data.bin");
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(node.write_at(&payload, 0).unwrap(), payload.len());
        assert_eq!(node.size(), payload.len());
        let mut back = vec![0u8; payload.len()];
        assert_eq!(node.read_at(&mut back, 0).unwrap(), payload.len());
        assert_eq!(back, payload);
        // Offsets inside the file work too.
        let mut mid = [0u8; 100];
        assert_eq!(node.read_at(&mut mid, 1234).unwrap(), 100);
        assert_eq!(&mid[..], &payload[1234..1334]);
        node_put(&node);
    }

    #[test]
    fn holes_read_as_zeros() {
        let sb = fresh_fs();
        let node = make_file(&sb, "sparse");
        // Write beyond the first block, leaving a hole at the start.
        node.write_at(b"tail", 3000).unwrap();
        assert_eq!(node.size(), 3004);
        let mut head = [0xffu8; 64];
        assert_eq!(node.read_at(&mut head, 0).unwrap(), 64);
        assert!(head.iter().all(|&b| b == 0));
        let mut tail = [0u8; 4];
        node.read_at(&mut tail, 3000).unwrap();
        assert_eq!(&tail, b"tail");
        node_put(&node);
    }

    #[test]
    fn single_indirect_files_work() {
        let sb = fresh_fs();
        let node = make_file(&sb, "big");
        // Past the 7 direct zones (7 KiB) into the single-indirect range.
        let payload: Vec<u8> = (0..40_000usize).map(|i| (i % 251) as u8).collect();
        assert_eq!(node.write_at(&payload, 0).unwrap(), payload.len());
        let mut back = vec![0u8; payload.len()];
        assert_eq!(node.read_at(&mut back, 0).unwrap(), payload.len());
        assert_eq!(back, payload);
        node_put(&node);
    }

    #[test]
    fn truncate_releases_zones_and_zeroes_tail() {
        let sb = fresh_fs();
        let node = make_file(&sb, "shrink");
        let payload = vec![0xabu8; 8192];
        node.write_at(&payload, 0).unwrap();
        node.trunc(1500).unwrap();
        assert_eq!(node.size(), 1500);
        // Growing the file again exposes zeros, not stale bytes.
        node.write_at(&[0xcd], 4000).unwrap();
        let mut tail = vec![0u8; 2000];
        assert_eq!(node.read_at(&mut tail, 1500).unwrap(), 2000);
        assert!(tail.iter().all(|&b| b == 0), "stale data after truncate");
        node_put(&node);
    }

    #[test]
    fn directory_link_lookup_unlink() {
        let sb = fresh_fs();
        let root = sb.root_node();
        let a = make_file(&sb, "a.txt");
        let b = make_file(&sb, "b.txt");
        assert_eq!(root.lookup_id("a.txt").unwrap(), a.id());
        assert_eq!(root.lookup_id("b.txt").unwrap(), b.id());
        assert_eq!(root.lookup_id("missing"), Err(Errno::ENOENT));
        assert_eq!(a.stat.lock().nlinks, 1);

        root.unlink("a.txt", &a).unwrap();
        assert_eq!(root.lookup_id("a.txt"), Err(Errno::ENOENT));
        assert_eq!(a.stat.lock().nlinks, 0);
        // b survives the tail-swap compaction.
        assert_eq!(root.lookup_id("b.txt").unwrap(), b.id());
        node_put(&a);
        node_put(&b);
    }

    #[test]
    fn node_survives_cache_eviction_via_disk() {
        let sb = fresh_fs();
        let id = {
            let node = make_file(&sb, "persist");
            node.write_at(b"written once", 0).unwrap();
            let id = node.id();
            node_put(&node);
            id
        };
        // Re-read from disk through the cache.
        let node = read_node(&sb, id).unwrap();
        let mut back = [0u8; 12];
        node.read_at(&mut back, 0).unwrap();
        assert_eq!(&back, b"written once");
        node_put(&node);
    }
}
