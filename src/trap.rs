//! Trap dispatch.
//!
//! The assembly vector saves registers into the current trap frame and
//! calls in here with the decoded cause. Interrupt context never blocks:
//! timer ticks drive the scheduler, external interrupts fan out through
//! the PLIC handler registry, and ecalls run the syscall table on the
//! trapping task.

use crate::syscall::{self, SyscallReturn};
use crate::task::hart::Hart;
use crate::task::{sched, Task, TaskState};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    UserEcall,
    KernelEcall,
    TimerInterrupt,
    SoftwareInterrupt,
    ExternalInterrupt(u32),
    LoadPageFault(usize),
    StorePageFault(usize),
    InstructionPageFault(usize),
    IllegalInstruction,
    Breakpoint,
    Unknown(usize),
}

/// What the assembly glue should do on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Restore the trapped context and continue.
    Resume,
    /// The task gave up the hart; run the scheduler.
    Schedule,
}

type IrqHandler = fn();

static IRQ_HANDLERS: Mutex<Vec<(u32, IrqHandler)>> = Mutex::new(Vec::new());

/// Register a handler for an external interrupt line.
pub fn register_irq_handler(irq: u32, handler: IrqHandler) {
    IRQ_HANDLERS.lock().push((irq, handler));
}

fn dispatch_irq(irq: u32) {
    let handlers: Vec<IrqHandler> = IRQ_HANDLERS
        .lock()
        .iter()
        .filter(|(line, _)| *line == irq)
        .map(|(_, handler)| *handler)
        .collect();
    if handlers.is_empty() {
        crate::warn!("unhandled external interrupt {}", irq);
    }
    for handler in handlers {
        handler();
    }
}

/// Entry for a trap taken while a task was running.
pub fn handle_task_trap(hart: &Arc<Hart>, task: &Arc<Task>, cause: TrapCause) -> TrapOutcome {
    match cause {
        TrapCause::UserEcall | TrapCause::KernelEcall => {
            // Step past the ecall; a parked restart rewinds this.
            {
                let mut frame = task.frame.lock();
                frame.pc += 4;
            }
            let is_kernel = cause == TrapCause::KernelEcall;
            match syscall::dispatch(task, is_kernel) {
                SyscallReturn::Continue => TrapOutcome::Resume,
                SyscallReturn::Park => {
                    sched::enqueue_task_on(hart, task.clone());
                    crate::task::hart::set_current_task(hart.index, None);
                    TrapOutcome::Schedule
                }
            }
        }
        TrapCause::TimerInterrupt => {
            sched::timer_tick(hart);
            TrapOutcome::Schedule
        }
        TrapCause::SoftwareInterrupt => {
            crate::task::ipi::handle_message(hart.id);
            TrapOutcome::Resume
        }
        TrapCause::ExternalInterrupt(irq) => {
            dispatch_irq(irq);
            TrapOutcome::Resume
        }
        TrapCause::LoadPageFault(addr)
        | TrapCause::StorePageFault(addr)
        | TrapCause::InstructionPageFault(addr) => handle_page_fault(hart, task, addr),
        TrapCause::IllegalInstruction => fault_task(hart, task, crate::process::signal::Signal::SIGILL),
        TrapCause::Breakpoint => fault_task(hart, task, crate::process::signal::Signal::SIGTRAP),
        TrapCause::Unknown(code) => {
            crate::panic::kernel_panic(format_args!("unknown trap cause {:#x}", code));
            TrapOutcome::Schedule
        }
    }
}

/// Entry for a trap taken in a bare hart context (no task).
pub fn handle_hart_trap(hart: &Arc<Hart>, cause: TrapCause) -> TrapOutcome {
    match cause {
        TrapCause::TimerInterrupt => {
            sched::timer_tick(hart);
            TrapOutcome::Schedule
        }
        TrapCause::SoftwareInterrupt => {
            crate::task::ipi::handle_message(hart.id);
            TrapOutcome::Resume
        }
        TrapCause::ExternalInterrupt(irq) => {
            dispatch_irq(irq);
            TrapOutcome::Resume
        }
        other => {
            crate::panic::kernel_panic(format_args!(
                "fault in kernel context on hart {}: {:?}",
                hart.id, other
            ));
            TrapOutcome::Schedule
        }
    }
}

/// Memory faults: copy-on-write resolution first; anything else is a
/// SIGSEGV for user code and a panic for the kernel.
fn handle_page_fault(hart: &Arc<Hart>, task: &Arc<Task>, addr: usize) -> TrapOutcome {
    if let Some(process) = task.process() {
        if process.space().handle_page_fault(addr) {
            return TrapOutcome::Resume;
        }
        crate::debug!(
            "segfault in pid {} at {:#x}",
            process.pid,
            addr
        );
        return fault_task(hart, task, crate::process::signal::Signal::SIGSEGV);
    }
    crate::panic::kernel_panic(format_args!("kernel page fault at {:#x}", addr));
    TrapOutcome::Schedule
}

fn fault_task(
    hart: &Arc<Hart>,
    task: &Arc<Task>,
    sig: crate::process::signal::Signal,
) -> TrapOutcome {
    match task.process() {
        Some(process) => {
            crate::process::signal::send_signal(&process, sig);
            // Delivery happens before the task re-enters user code.
            if task.state() == TaskState::Running {
                task.set_state(TaskState::Enquable);
            }
            sched::enqueue_task_on(hart, task.clone());
            crate::task::hart::set_current_task(hart.index, None);
            TrapOutcome::Schedule
        }
        None => {
            crate::panic::kernel_panic(format_args!("fault in kernel task: {:?}", sig));
            TrapOutcome::Schedule
        }
    }
}
