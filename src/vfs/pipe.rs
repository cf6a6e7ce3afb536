//! Pipes and named fifos.
//!
//! Both ends share one fixed-capacity ring plus two ordered lists of
//! waiting operations. A central loop alternates between satisfying
//! reads and writes until neither side can make progress; an operation
//! that cannot finish stays queued and its task parks on the op's done
//! flag. Closing the last end of one side completes the other side's
//! queue (EOF for readers, EPIPE for writers).

use super::node::{FileType, NodeOps, VfsNode, VfsStat, MODE_ALL_RW, MODE_GROUP_RW, MODE_OWNER_RW};
use crate::error::{Errno, Result};
use crate::task::Task;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

/// Ring capacity per pipe.
pub const PIPE_CAPACITY: usize = 4096;

struct OpState {
    data: Vec<u8>,
    progress: usize,
    result: Option<Result<usize>>,
}

/// How a completed operation reaches its parked task: the completer
/// copies read data into the caller's buffer and deposits the result in
/// a0 before waking it.
pub struct PipeDelivery {
    pub task: Arc<Task>,
    /// Destination user buffer for read operations.
    pub read_into: Option<(usize, Arc<crate::mm::AddressSpace>)>,
}

/// One queued read or write with its progress counter.
pub struct PipeOp {
    write_op: bool,
    state: Mutex<OpState>,
    done: AtomicBool,
    delivery: Mutex<Option<PipeDelivery>>,
}

impl PipeOp {
    fn new_read(len: usize) -> Arc<PipeOp> {
        Arc::new(PipeOp {
            write_op: false,
            state: Mutex::new(OpState {
                data: vec![0; len],
                progress: 0,
                result: None,
            }),
            done: AtomicBool::new(false),
            delivery: Mutex::new(None),
        })
    }

    fn new_write(data: Vec<u8>) -> Arc<PipeOp> {
        Arc::new(PipeOp {
            write_op: true,
            state: Mutex::new(OpState {
                data,
                progress: 0,
                result: None,
            }),
            done: AtomicBool::new(false),
            delivery: Mutex::new(None),
        })
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn set_delivery(&self, delivery: PipeDelivery) {
        *self.delivery.lock() = Some(delivery);
    }

    /// Result plus, for reads, the bytes gathered so far.
    pub fn take_result(&self) -> (Result<usize>, Vec<u8>) {
        let mut state = self.state.lock();
        let result = state.result.take().unwrap_or(Ok(state.progress));
        let data = core::mem::take(&mut state.data);
        (result, data)
    }

    fn perform_delivery(&self) {
        let delivery = match self.delivery.lock().take() {
            Some(delivery) => delivery,
            None => return,
        };
        let (result, progress) = {
            let state = self.state.lock();
            (state.result.unwrap_or(Ok(state.progress)), state.progress)
        };
        let value = match result {
            Ok(n) => {
                if let Some((addr, space)) = &delivery.read_into {
                    let state = self.state.lock();
                    let copied =
                        crate::syscall::uaccess::copy_to_user(space, *addr, &state.data[..progress]);
                    match copied {
                        Ok(()) => n as isize,
                        Err(err) => err.as_isize(),
                    }
                } else {
                    n as isize
                }
            }
            Err(Errno::EPIPE) => {
                if let Some(process) = delivery.task.process() {
                    crate::process::signal::send_signal(
                        &process,
                        crate::process::signal::Signal::SIGPIPE,
                    );
                }
                Errno::EPIPE.as_isize()
            }
            Err(err) => err.as_isize(),
        };
        delivery.task.frame.lock().set_return(value);
        crate::task::sched::wake_task(&delivery.task);
    }

    /// Submitter-side race closure: if the op finished between submit and
    /// park setup, deliver now.
    pub fn flush_delivery(&self) {
        if self.is_done() {
            self.perform_delivery();
        }
    }

    fn complete(&self, result: Result<usize>) {
        {
            let mut state = self.state.lock();
            state.result = Some(result);
        }
        self.done.store(true, Ordering::Release);
        self.perform_delivery();
    }
}

struct PipeInner {
    buf: Vec<u8>,
    read_pos: usize,
    count: usize,
    readers: usize,
    writers: usize,
    read_ops: VecDeque<Arc<PipeOp>>,
    write_ops: VecDeque<Arc<PipeOp>>,
}

pub struct PipeShared {
    inner: Mutex<PipeInner>,
}

impl PipeShared {
    pub fn new() -> Arc<PipeShared> {
        Arc::new(PipeShared {
            inner: Mutex::new(PipeInner {
                buf: vec![0; PIPE_CAPACITY],
                read_pos: 0,
                count: 0,
                readers: 0,
                writers: 0,
                read_ops: VecDeque::new(),
                write_ops: VecDeque::new(),
            }),
        })
    }

    pub fn add_end(&self, write_end: bool) {
        let mut inner = self.inner.lock();
        if write_end {
            inner.writers += 1;
        } else {
            inner.readers += 1;
        }
    }

    pub fn close_end(&self, write_end: bool) {
        let completed = {
            let mut inner = self.inner.lock();
            if write_end {
                inner.writers = inner.writers.saturating_sub(1);
            } else {
                inner.readers = inner.readers.saturating_sub(1);
            }
            run_ops(&mut inner)
        };
        finish(completed);
    }

    pub fn ends(&self) -> usize {
        let inner = self.inner.lock();
        inner.readers + inner.writers
    }

    pub fn bytes_available(&self) -> usize {
        self.inner.lock().count
    }

    pub fn read_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.count > 0 || inner.writers == 0
    }

    pub fn write_ready(&self) -> bool {
        let inner = self.inner.lock();
        inner.count < PIPE_CAPACITY || inner.readers == 0
    }

    /// Queue a read of up to `len` bytes and let the loop run.
    pub fn submit_read(&self, len: usize) -> Arc<PipeOp> {
        let op = PipeOp::new_read(len);
        let completed = {
            let mut inner = self.inner.lock();
            inner.read_ops.push_back(op.clone());
            run_ops(&mut inner)
        };
        finish(completed);
        op
    }

    /// Queue a write of `data` and let the loop run.
    pub fn submit_write(&self, data: Vec<u8>) -> Arc<PipeOp> {
        let op = PipeOp::new_write(data);
        let completed = {
            let mut inner = self.inner.lock();
            inner.write_ops.push_back(op.clone());
            run_ops(&mut inner)
        };
        finish(completed);
        op
    }

    /// Abandon a queued operation (nonblocking caller); completes it with
    /// whatever progress it made.
    pub fn cancel(&self, op: &Arc<PipeOp>) {
        let mut inner = self.inner.lock();
        let queue = if op.write_op {
            &mut inner.write_ops
        } else {
            &mut inner.read_ops
        };
        if let Some(pos) = queue.iter().position(|other| Arc::ptr_eq(other, op)) {
            queue.remove(pos);
        }
    }
}

/// The central transfer loop. Returns the operations completed in this
/// pass; callers finish them after dropping the pipe lock.
fn run_ops(inner: &mut PipeInner) -> Vec<(Arc<PipeOp>, Result<usize>)> {
    let mut completed = Vec::new();
    loop {
        // Satisfy the oldest read while data is available.
        if inner.count > 0 {
            if let Some(op) = inner.read_ops.front().cloned() {
                let mut state = op.state.lock();
                let remaining = state.data.len() - state.progress;
                let take = remaining.min(inner.count);
                for i in 0..take {
                    let progress = state.progress;
                    state.data[progress + i] = inner.buf[(inner.read_pos + i) % PIPE_CAPACITY];
                }
                inner.read_pos = (inner.read_pos + take) % PIPE_CAPACITY;
                inner.count -= take;
                state.progress += take;
                let finished = state.progress == state.data.len() || inner.write_ops.is_empty();
                let progress = state.progress;
                drop(state);
                if finished {
                    inner.read_ops.pop_front();
                    completed.push((op, Ok(progress)));
                }
                continue;
            }
        }
        // Drain the oldest write while space is available.
        if inner.count < PIPE_CAPACITY {
            if let Some(op) = inner.write_ops.front().cloned() {
                let mut state = op.state.lock();
                let remaining = state.data.len() - state.progress;
                let space = PIPE_CAPACITY - inner.count;
                let put = remaining.min(space);
                if put > 0 {
                    let write_pos = (inner.read_pos + inner.count) % PIPE_CAPACITY;
                    for i in 0..put {
                        inner.buf[(write_pos + i) % PIPE_CAPACITY] = state.data[state.progress + i];
                    }
                    inner.count += put;
                    state.progress += put;
                }
                let finished = state.progress == state.data.len();
                let progress = state.progress;
                drop(state);
                if finished {
                    inner.write_ops.pop_front();
                    completed.push((op, Ok(progress)));
                    continue;
                }
                if put > 0 {
                    continue;
                }
            }
        }
        break;
    }
    if inner.writers == 0 && inner.count == 0 {
        // End of stream: every queued read completes with its progress.
        while let Some(op) = inner.read_ops.pop_front() {
            let progress = op.state.lock().progress;
            completed.push((op, Ok(progress)));
        }
    }
    if inner.readers == 0 {
        while let Some(op) = inner.write_ops.pop_front() {
            completed.push((op, Err(Errno::EPIPE)));
        }
    }
    completed
}

fn finish(completed: Vec<(Arc<PipeOp>, Result<usize>)>) {
    for (op, result) in completed {
        op.complete(result);
    }
}

/// One file's handle on a pipe.
pub struct PipeEnd {
    pub shared: Arc<PipeShared>,
    pub write_end: bool,
}

impl PipeEnd {
    pub fn is_ready(&self, write: bool) -> bool {
        if write {
            self.shared.write_ready()
        } else {
            self.shared.read_ready()
        }
    }

    pub fn close(&self) {
        self.shared.close_end(self.write_end);
    }
}

/// The node behind pipe and fifo files. Read/write here are the
/// immediate nonblocking paths used by in-kernel callers.
pub struct PipeNodeOps {
    pub shared: Arc<PipeShared>,
}

impl NodeOps for PipeNodeOps {
    fn read_at(&self, _node: &VfsNode, buf: &mut [u8], _offset: usize) -> Result<usize> {
        let op = self.shared.submit_read(buf.len());
        if !op.is_done() {
            self.shared.cancel(&op);
        }
        let (result, data) = op.take_result();
        let read = result?;
        if read == 0 && !self.shared.read_ready() {
            return Err(Errno::EAGAIN);
        }
        buf[..read].copy_from_slice(&data[..read]);
        Ok(read)
    }

    fn write_at(&self, _node: &VfsNode, buf: &[u8], _offset: usize) -> Result<usize> {
        let op = self.shared.submit_write(buf.to_vec());
        if !op.is_done() {
            self.shared.cancel(&op);
        }
        let (result, _) = op.take_result();
        let written = result?;
        if written == 0 {
            return Err(Errno::EAGAIN);
        }
        Ok(written)
    }

    fn is_ready(&self, _node: &VfsNode, write: bool) -> bool {
        if write {
            self.shared.write_ready()
        } else {
            self.shared.read_ready()
        }
    }
}

pub fn pipe_stat(uid: u32, gid: u32) -> VfsStat {
    VfsStat {
        mode: FileType::Fifo.to_mode() | MODE_OWNER_RW | MODE_GROUP_RW | MODE_ALL_RW,
        nlinks: 1,
        uid,
        gid,
        ..VfsStat::default()
    }
}

/// Build the read and write files of a fresh anonymous pipe.
pub fn create_pipe(uid: u32, gid: u32) -> (Arc<super::file::VfsFile>, Arc<super::file::VfsFile>) {
    use super::file::{FileFlags, VfsFile};
    let shared = PipeShared::new();
    shared.add_end(false);
    shared.add_end(true);
    let read_node = VfsNode::new(
        Weak::new(),
        pipe_stat(uid, gid),
        alloc::boxed::Box::new(PipeNodeOps {
            shared: shared.clone(),
        }),
    );
    read_node.ref_count.store(1, Ordering::Release);
    let write_node = VfsNode::new(
        Weak::new(),
        pipe_stat(uid, gid),
        alloc::boxed::Box::new(PipeNodeOps {
            shared: shared.clone(),
        }),
    );
    write_node.ref_count.store(1, Ordering::Release);
    let read_file = VfsFile::new_pipe(
        read_node,
        String::new(),
        FileFlags::READ,
        shared.clone(),
        false,
    );
    let write_file = VfsFile::new_pipe(write_node, String::new(), FileFlags::WRITE, shared, true);
    (read_file, write_file)
}

lazy_static! {
    /// Named pipes: path to live shared state.
    static ref FIFOS: Mutex<BTreeMap<String, Arc<PipeShared>>> = Mutex::new(BTreeMap::new());
}

/// Get or create the shared pipe behind a fifo path.
pub fn fifo_shared(path: &str) -> Arc<PipeShared> {
    let mut fifos = FIFOS.lock();
    if let Some(shared) = fifos.get(path) {
        return shared.clone();
    }
    let shared = PipeShared::new();
    fifos.insert(String::from(path), shared.clone());
    shared
}

/// Drop the registry entry once no end keeps the fifo alive.
pub fn fifo_gc(path: &str) {
    let mut fifos = FIFOS.lock();
    if let Some(shared) = fifos.get(path) {
        if shared.ends() == 0 {
            fifos.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let pipe = PipeShared::new();
        pipe.add_end(false);
        pipe.add_end(true);
        let write = pipe.submit_write(b"HELLO".to_vec());
        assert!(write.is_done());
        assert_eq!(write.take_result().0, Ok(5));
        let read = pipe.submit_read(16);
        assert!(read.is_done());
        let (result, data) = read.take_result();
        assert_eq!(result, Ok(5));
        assert_eq!(&data[..5], b"HELLO");
    }

    #[test]
    fn queued_read_completes_when_data_arrives() {
        let pipe = PipeShared::new();
        pipe.add_end(false);
        pipe.add_end(true);
        let read = pipe.submit_read(5);
        assert!(!read.is_done());
        let _ = pipe.submit_write(b"HELLO".to_vec());
        assert!(read.is_done());
        let (result, data) = read.take_result();
        assert_eq!(result, Ok(5));
        assert_eq!(&data[..5], b"HELLO");
    }

    #[test]
    fn large_write_flows_through_in_chunks() {
        let pipe = PipeShared::new();
        pipe.add_end(false);
        pipe.add_end(true);
        let payload: Vec<u8> = (0..3 * PIPE_CAPACITY).map(|i| i as u8).collect();
        let write = pipe.submit_write(payload.clone());
        assert!(!write.is_done());
        let mut collected = Vec::new();
        while collected.len() < payload.len() {
            let read = pipe.submit_read(1000);
            assert!(read.is_done());
            let (result, data) = read.take_result();
            let n = result.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&data[..n]);
        }
        assert!(write.is_done());
        assert_eq!(collected, payload);
    }

    #[test]
    fn reader_sees_eof_after_writer_closes() {
        let pipe = PipeShared::new();
        pipe.add_end(false);
        pipe.add_end(true);
        let _ = pipe.submit_write(b"xy".to_vec());
        pipe.close_end(true);
        let read = pipe.submit_read(8);
        assert!(read.is_done());
        let (result, data) = read.take_result();
        assert_eq!(result, Ok(2));
        assert_eq!(&data[..2], b"xy");
        let read = pipe.submit_read(8);
        assert!(read.is_done());
        assert_eq!(read.take_result().0, Ok(0));
    }

    #[test]
    fn writer_fails_with_epipe_after_reader_closes() {
        let pipe = PipeShared::new();
        pipe.add_end(false);
        pipe.add_end(true);
        pipe.close_end(false);
        let write = pipe.submit_write(b"data".to_vec());
        assert!(write.is_done());
        assert_eq!(write.take_result().0, Err(Errno::EPIPE));
    }

    #[test]
    fn fifo_registry_shares_by_path() {
        let a = fifo_shared("/tmp/fifo-test");
        let b = fifo_shared("/tmp/fifo-test");
        assert!(Arc::ptr_eq(&a, &b));
        a.add_end(true);
        let _ = a.submit_write(b"z".to_vec());
        assert_eq!(b.bytes_available(), 1);
        a.close_end(true);
        fifo_gc("/tmp/fifo-test");
        let c = fifo_shared("/tmp/fifo-test");
        assert!(!Arc::ptr_eq(&a, &c));
        fifo_gc("/tmp/fifo-test");
    }
}
