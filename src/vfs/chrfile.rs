//! Character device (tty) files.
//!
//! A thin pass-through node over a `CharDevice`. An empty device returns
//! EAGAIN; the syscall layer parks blocking readers on the device's
//! waiter list, and the interrupt side wakes them through `data_ready`.

use super::node::{NodeOps, VfsNode, VfsStat};
use super::superblock::node_get;
use crate::dev::CharDevice;
use crate::error::Result;
use crate::task::Task;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

pub struct TtyNodeOps {
    device: Arc<dyn CharDevice>,
}

impl TtyNodeOps {
    pub fn add_waiter(&self, task: &Arc<Task>) {
        self.device.add_waiter(task);
    }
}

impl NodeOps for TtyNodeOps {
    fn read_at(&self, _node: &VfsNode, buf: &mut [u8], _offset: usize) -> Result<usize> {
        self.device.read(buf)
    }

    fn write_at(&self, _node: &VfsNode, buf: &[u8], _offset: usize) -> Result<usize> {
        self.device.write(buf)
    }

    fn is_ready(&self, _node: &VfsNode, write: bool) -> bool {
        if write {
            true
        } else {
            self.device.is_ready()
        }
    }

    fn register_waiter(&self, _node: &VfsNode, task: &Arc<Task>) {
        self.device.add_waiter(task);
    }
}

/// Overlay a character device on top of the on-disk inode `real`.
pub fn create_tty_node(device: Arc<dyn CharDevice>, real: Arc<VfsNode>) -> Arc<VfsNode> {
    let stat = {
        let real_stat = real.stat.lock();
        VfsStat {
            size: 0,
            block_size: 0,
            blocks: 0,
            ..*real_stat
        }
    };
    node_get(&real);
    let node = VfsNode::new(Weak::new(), stat, Box::new(TtyNodeOps { device }));
    node.ref_count
        .store(1, core::sync::atomic::Ordering::Release);
    *node.real.lock() = Some(real);
    node
}

/// A console node not backed by any filesystem inode.
pub fn anonymous_tty_node(device: Arc<dyn CharDevice>) -> Arc<VfsNode> {
    use super::node::FileType;
    let stat = VfsStat {
        mode: FileType::Char.to_mode()
            | super::node::MODE_OWNER_RW
            | super::node::MODE_GROUP_RW
            | super::node::MODE_ALL_RW,
        nlinks: 1,
        ..VfsStat::default()
    };
    let node = VfsNode::new(Weak::new(), stat, Box::new(TtyNodeOps { device }));
    node.ref_count
        .store(1, core::sync::atomic::Ordering::Release);
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::ram::EchoConsole;
    use crate::error::Errno;

    #[test]
    fn tty_passes_bytes_through() {
        let console = Arc::new(EchoConsole::new());
        let node = anonymous_tty_node(console.clone());
        assert_eq!(node.write_at(b"hi", 0).unwrap(), 2);
        assert_eq!(console.take_output(), b"hi");

        let mut buf = [0u8; 4];
        assert_eq!(node.read_at(&mut buf, 0), Err(Errno::EAGAIN));
        console.push_input(b"ok");
        assert!(node.is_ready(false));
        assert_eq!(node.read_at(&mut buf, 0).unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
    }
}
