// Device capability layer.
//
// Concrete MMIO drivers live outside the core; the kernel sees them only
// through these capability traits and the id registry. Special VFS nodes
// (block and tty wrappers) are materialized from registered devices.

pub mod ram;

use crate::error::{Errno, Result};
use crate::task::Task;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// A device addressed in fixed-size sectors.
///
/// `read`/`write` take byte offsets and lengths that are whole multiples of
/// `block_size`; unaligned access is the block file wrapper's job.
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> usize;
    fn size(&self) -> usize;
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<()>;
    fn write(&self, buf: &[u8], offset: usize) -> Result<()>;
}

/// A byte-stream device. Reads on an empty device return `EAGAIN`; the
/// caller decides whether to park.
pub trait CharDevice: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, buf: &[u8]) -> Result<usize>;
    fn is_ready(&self) -> bool;
    /// Park a task on this device until data arrives.
    fn add_waiter(&self, task: &Arc<Task>) {
        let _ = task;
    }
}

/// Receive ring shared by character devices.
///
/// The interrupt path calls `data_ready` to drain hardware bytes into the
/// ring and wake every parked task; the ring grows as needed.
pub struct CharRing {
    inner: Mutex<RingInner>,
}

struct RingInner {
    buf: VecDeque<u8>,
    waiters: Vec<Weak<Task>>,
}

impl CharRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                buf: VecDeque::new(),
                waiters: Vec::new(),
            }),
        }
    }

    /// Called from interrupt context with freshly received bytes.
    pub fn data_ready(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.buf.extend(bytes.iter().copied());
        let waiters = core::mem::take(&mut inner.waiters);
        drop(inner);
        for waiter in waiters {
            if let Some(task) = waiter.upgrade() {
                crate::task::sched::wake_task(&task);
            }
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.buf.is_empty() {
            return Err(Errno::EAGAIN);
        }
        let count = buf.len().min(inner.buf.len());
        for slot in buf.iter_mut().take(count) {
            *slot = inner.buf.pop_front().unwrap();
        }
        Ok(count)
    }

    pub fn is_ready(&self) -> bool {
        !self.inner.lock().buf.is_empty()
    }

    pub fn add_waiter(&self, task: &Arc<Task>) {
        self.inner.lock().waiters.push(Arc::downgrade(task));
    }
}

static NEXT_DEVICE_ID: AtomicUsize = AtomicUsize::new(1);

static BLOCK_DEVICES: Mutex<Vec<(usize, Arc<dyn BlockDevice>)>> = Mutex::new(Vec::new());
static CHAR_DEVICES: Mutex<Vec<(usize, Arc<dyn CharDevice>)>> = Mutex::new(Vec::new());

pub fn register_block_device(device: Arc<dyn BlockDevice>) -> usize {
    let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
    BLOCK_DEVICES.lock().push((id, device));
    id
}

pub fn register_char_device(device: Arc<dyn CharDevice>) -> usize {
    let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
    CHAR_DEVICES.lock().push((id, device));
    id
}

pub fn block_device(id: usize) -> Option<Arc<dyn BlockDevice>> {
    BLOCK_DEVICES
        .lock()
        .iter()
        .find(|(dev_id, _)| *dev_id == id)
        .map(|(_, dev)| dev.clone())
}

pub fn char_device(id: usize) -> Option<Arc<dyn CharDevice>> {
    CHAR_DEVICES
        .lock()
        .iter()
        .find(|(dev_id, _)| *dev_id == id)
        .map(|(_, dev)| dev.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_ring_orders_bytes() {
        let ring = CharRing::new();
        assert_eq!(ring.read(&mut [0u8; 4]), Err(Errno::EAGAIN));
        ring.data_ready(b"ab");
        ring.data_ready(b"cd");
        let mut buf = [0u8; 3];
        assert_eq!(ring.read(&mut buf), Ok(3));
        assert_eq!(&buf, b"abc");
        let mut buf = [0u8; 3];
        assert_eq!(ring.read(&mut buf), Ok(1));
        assert_eq!(buf[0], b'd');
        assert!(!ring.is_ready());
    }

    #[test]
    fn device_registry_hands_back_by_id() {
        let disk = Arc::new(ram::RamDisk::new(512, 8));
        let id = register_block_device(disk);
        assert!(block_device(id).is_some());
        assert!(block_device(id + 10_000).is_none());
    }
}
