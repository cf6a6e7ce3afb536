//! Tasks and their trap frames.
//!
//! A task is the unit of scheduling: a kernel stack, a saved register
//! frame, a scheduling descriptor, and optionally the process it belongs
//! to. The frame's hart slot doubles as the discriminator the trap entry
//! relies on: zero means a bare hart context, anything else is a task
//! running on hart `slot - 1`.

pub mod hart;
pub mod ipi;
pub mod sched;

use crate::process::Process;
use crate::time::Time;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

pub const MAX_PRIORITY: usize = 40;
pub const HIGHEST_PRIORITY: Priority = 0;
pub const LOWEST_PRIORITY: Priority = (MAX_PRIORITY - 1) as Priority;
pub const DEFAULT_PRIORITY: Priority = (MAX_PRIORITY / 2) as Priority;

pub type Priority = u8;

/// Default kernel stack size (64 KiB).
pub const KERNEL_STACK_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to be put on a run queue.
    Enquable,
    /// Sitting on a run queue.
    Ready,
    Running,
    /// Blocked; woken explicitly by a completion or a signal.
    Waiting,
    /// Blocked in wait() until a child reports.
    WaitChld,
    /// Blocked until a deadline.
    Sleeping,
    /// Blocked until any signal arrives.
    Paused,
    /// Dead, resources still attached.
    Terminated,
    /// Dead and stripped of stack and descriptor.
    Freed,
}

/// Integer register indices within the trap frame, in RISC-V ABI order
/// (x1..x31; x0 is not stored).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Ra = 0,
    Sp = 1,
    Gp = 2,
    Tp = 3,
    T0 = 4,
    T1 = 5,
    T2 = 6,
    S0 = 7,
    S1 = 8,
    A0 = 9,
    A1 = 10,
    A2 = 11,
    A3 = 12,
    A4 = 13,
    A5 = 14,
    A6 = 15,
    A7 = 16,
    S2 = 17,
    S3 = 18,
    S4 = 19,
    S5 = 20,
    S6 = 21,
    S7 = 22,
    S8 = 23,
    S9 = 24,
    S10 = 25,
    S11 = 26,
    T3 = 27,
    T4 = 28,
    T5 = 29,
    T6 = 30,
}

/// Saved machine state. Layout is shared with the assembly trap entry:
/// the hart slot must stay the first field.
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    /// Hart index plus one; zero for a bare hart context.
    pub hart: usize,
    pub regs: [usize; 31],
    pub fregs: [f64; 32],
    pub pc: usize,
    pub satp: usize,
}

impl TrapFrame {
    pub fn new() -> Self {
        Self {
            hart: 0,
            regs: [0; 31],
            fregs: [0.0; 32],
            pc: 0,
            satp: 0,
        }
    }

    pub fn get(&self, reg: Reg) -> usize {
        self.regs[reg as usize]
    }

    pub fn set(&mut self, reg: Reg, value: usize) {
        self.regs[reg as usize] = value;
    }

    /// Syscall argument `n` (0-based; arguments start at a1).
    pub fn arg(&self, n: usize) -> usize {
        self.regs[Reg::A1 as usize + n]
    }

    /// Deposit a syscall result in a0.
    pub fn set_return(&mut self, value: isize) {
        self.regs[Reg::A0 as usize] = value as usize;
    }
}

pub type WakeupFn = Box<dyn Fn(&Task) -> bool + Send + Sync>;

pub struct SchedInfo {
    pub priority: Priority,
    /// Maximum of `priority`, pushed down over time by aging.
    pub queue_priority: Priority,
    pub runs: u16,
    pub state: TaskState,
    pub sleeping_until: Time,
    /// Consulted by the scheduler when revisiting a blocked task.
    pub wakeup: Option<WakeupFn>,
}

pub struct Task {
    pub frame: Mutex<TrapFrame>,
    pub sched: Mutex<SchedInfo>,
    pub process: Mutex<Option<Arc<Process>>>,
    stack: Mutex<Option<Vec<u8>>>,
    /// Re-issue the trapped ecall instead of resuming after it.
    pub restart: AtomicBool,
    /// When the task last entered a hart.
    pub entered: AtomicU64,
}

impl Task {
    pub fn new(priority: Priority) -> Arc<Task> {
        Arc::new(Task {
            frame: Mutex::new(TrapFrame::new()),
            sched: Mutex::new(SchedInfo {
                priority,
                queue_priority: priority,
                runs: 0,
                state: TaskState::Enquable,
                sleeping_until: 0,
                wakeup: None,
            }),
            process: Mutex::new(None),
            stack: Mutex::new(None),
            restart: AtomicBool::new(false),
            entered: AtomicU64::new(0),
        })
    }

    /// A task running kernel code on its own stack.
    pub fn kernel(entry: usize, stack_size: usize, priority: Priority) -> Arc<Task> {
        let task = Task::new(priority);
        let stack = vec![0u8; stack_size];
        {
            let mut frame = task.frame.lock();
            frame.pc = entry;
            frame.set(Reg::Sp, stack.as_ptr() as usize + stack_size);
        }
        *task.stack.lock() = Some(stack);
        task
    }

    /// Give the task a kernel stack without touching its frame (user
    /// tasks trap onto this stack).
    pub fn attach_stack(&self, stack_size: usize) {
        *self.stack.lock() = Some(vec![0u8; stack_size]);
    }

    pub fn state(&self) -> TaskState {
        self.sched.lock().state
    }

    pub fn set_state(&self, state: TaskState) {
        self.sched.lock().state = state;
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().clone()
    }

    pub fn stack_top(&self) -> Option<usize> {
        self.stack
            .lock()
            .as_ref()
            .map(|stack| stack.as_ptr() as usize + stack.len())
    }

    /// Copy another task's kernel stack (kernel-task fork).
    pub fn copy_stack_from(&self, other: &Task) {
        let src = other.stack.lock();
        if let Some(src) = src.as_ref() {
            *self.stack.lock() = Some(src.clone());
        }
    }

    /// Strip the stack once the task is reaped.
    pub fn release_resources(&self) {
        *self.stack.lock() = None;
        let mut sched = self.sched.lock();
        sched.state = TaskState::Freed;
        sched.wakeup = None;
    }

    /// Park the task in `state`, optionally with a wakeup predicate.
    pub fn park(&self, state: TaskState, deadline: Time, wakeup: Option<WakeupFn>) {
        let mut sched = self.sched.lock();
        sched.state = state;
        sched.sleeping_until = deadline;
        sched.wakeup = wakeup;
    }
}
