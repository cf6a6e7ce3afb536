//! Per-hart state.
//!
//! Every hart owns an identifier, an idle task, and a ready queue. Harts
//! form a ring so an idle hart can pull runnable work from its neighbors.

use super::sched::SchedQueue;
use super::{Task, LOWEST_PRIORITY};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Stack for the idle loop (8 KiB is plenty: it only halts).
const IDLE_STACK_SIZE: usize = 8192;

pub struct Hart {
    pub id: usize,
    pub index: usize,
    pub queue: SchedQueue,
    pub idle: Arc<Task>,
}

static HARTS: Mutex<Vec<Arc<Hart>>> = Mutex::new(Vec::new());
static CURRENT: Mutex<Vec<Option<Arc<Task>>>> = Mutex::new(Vec::new());
static BOOT_HART: AtomicUsize = AtomicUsize::new(usize::MAX);

extern "C" fn idle_loop() {
    loop {
        #[cfg(target_arch = "riscv64")]
        riscv::asm::wfi();
        #[cfg(not(target_arch = "riscv64"))]
        core::hint::spin_loop();
    }
}

/// Register a hart and hand back its frame. The first caller becomes the
/// boot hart.
pub fn setup_hart(id: usize) -> Arc<Hart> {
    let idle = Task::kernel(idle_loop as usize, IDLE_STACK_SIZE, LOWEST_PRIORITY);
    let mut harts = HARTS.lock();
    let index = harts.len();
    let hart = Arc::new(Hart {
        id,
        index,
        queue: SchedQueue::new(),
        idle,
    });
    harts.push(hart.clone());
    CURRENT.lock().push(None);
    BOOT_HART.compare_exchange(usize::MAX, id, Ordering::AcqRel, Ordering::Acquire)
        .ok();
    hart
}

pub fn hart_count() -> usize {
    HARTS.lock().len()
}

/// The hart that booted the kernel.
pub fn boot_hart_id() -> usize {
    BOOT_HART.load(Ordering::Acquire)
}

pub fn hart_by_index(index: usize) -> Option<Arc<Hart>> {
    HARTS.lock().get(index).cloned()
}

pub fn hart_by_id(id: usize) -> Option<Arc<Hart>> {
    HARTS.lock().iter().find(|hart| hart.id == id).cloned()
}

/// The hart after `index` in the ring.
pub fn next_hart(index: usize) -> Option<Arc<Hart>> {
    let harts = HARTS.lock();
    if harts.is_empty() {
        return None;
    }
    let next = (index + 1) % harts.len();
    harts.get(next).cloned()
}

pub fn current_hart_index() -> usize {
    // The boot glue keeps the hart index in tp while in kernel mode; the
    // host build runs everything on a single logical hart.
    #[cfg(target_arch = "riscv64")]
    {
        let tp: usize;
        unsafe { core::arch::asm!("mv {}, tp", out(reg) tp) };
        tp
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

pub fn current_hart() -> Option<Arc<Hart>> {
    hart_by_index(current_hart_index())
}

pub fn set_current_task(index: usize, task: Option<Arc<Task>>) {
    let mut current = CURRENT.lock();
    if index < current.len() {
        current[index] = task;
    }
}

pub fn current_task_on(index: usize) -> Option<Arc<Task>> {
    CURRENT.lock().get(index).and_then(|slot| slot.clone())
}

pub fn current_task() -> Option<Arc<Task>> {
    current_task_on(current_hart_index())
}
