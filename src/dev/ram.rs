// Memory-backed devices.
//
// The RAM disk backs the root filesystem during early bring-up and gives
// the unit tests a real `BlockDevice`. The echo console does the same for
// `CharDevice` consumers.

use super::{BlockDevice, CharDevice, CharRing};
use crate::error::{Errno, Result};
use crate::task::Task;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub struct RamDisk {
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0; block_size * blocks]),
        }
    }

    pub fn from_image(block_size: usize, image: Vec<u8>) -> Self {
        assert!(image.len() % block_size == 0);
        Self {
            block_size,
            data: Mutex::new(image),
        }
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        if offset % self.block_size != 0 || buf.len() % self.block_size != 0 {
            return Err(Errno::EINVAL);
        }
        let data = self.data.lock();
        let end = offset.checked_add(buf.len()).ok_or(Errno::EINVAL)?;
        if end > data.len() {
            return Err(Errno::EIO);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write(&self, buf: &[u8], offset: usize) -> Result<()> {
        if offset % self.block_size != 0 || buf.len() % self.block_size != 0 {
            return Err(Errno::EINVAL);
        }
        let mut data = self.data.lock();
        let end = offset.checked_add(buf.len()).ok_or(Errno::EINVAL)?;
        if end > data.len() {
            return Err(Errno::EIO);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Console that collects written bytes and feeds reads from its ring.
pub struct EchoConsole {
    ring: CharRing,
    written: Mutex<Vec<u8>>,
}

impl EchoConsole {
    pub fn new() -> Self {
        Self {
            ring: CharRing::new(),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Inject input as the interrupt handler of a real UART would.
    pub fn push_input(&self, bytes: &[u8]) {
        self.ring.data_ready(bytes);
    }

    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut self.written.lock())
    }
}

impl CharDevice for EchoConsole {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ring.read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn is_ready(&self) -> bool {
        self.ring.is_ready()
    }

    fn add_waiter(&self, task: &Arc<Task>) {
        self.ring.add_waiter(task);
    }
}
