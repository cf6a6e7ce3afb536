//! Process, signal and time syscalls.

use super::uaccess::{self, MAX_USER_STRING};
use super::{complete, SyscallReturn};
use crate::error::{Errno, Result};
use crate::process::signal::{self, SigAction, Signal};
use crate::process::{self, wait, Pid, Process};
use crate::task::{Reg, Task, TaskState, KERNEL_STACK_SIZE};
use crate::time::{get_time, NANOS_PER_SEC};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

fn process_of(task: &Arc<Task>) -> Result<Arc<Process>> {
    task.process().ok_or(Errno::EINVAL)
}

/// exit(code): never returns to the caller.
pub fn sys_exit(task: &Arc<Task>) -> SyscallReturn {
    match task.process() {
        Some(process) => {
            let code = { task.frame.lock().arg(0) as i32 };
            process::exit_process(&process, process::exit_status(code));
        }
        None => {
            task.set_state(TaskState::Terminated);
        }
    }
    SyscallReturn::Park
}

/// yield(): give up the remainder of the slice.
pub fn sys_yield(task: &Arc<Task>) -> SyscallReturn {
    task.frame.lock().set_return(0);
    task.set_state(TaskState::Enquable);
    SyscallReturn::Park
}

/// sleep(seconds) -> seconds left when interrupted, else 0.
pub fn sys_sleep(task: &Arc<Task>) -> SyscallReturn {
    let seconds = { task.frame.lock().arg(0) as u64 };
    let deadline = get_time() + seconds * NANOS_PER_SEC;
    task.restart.store(false, Ordering::Release);
    task.park(TaskState::Sleeping, deadline, None);
    SyscallReturn::Park
}

/// fork(): user processes clone copy-on-write; a bare kernel task gets a
/// twin with a copied stack.
pub fn sys_fork(task: &Arc<Task>) -> SyscallReturn {
    match task.process() {
        Some(parent_process) => {
            let result = (|| {
                let child_process = Process::fork_from(&parent_process)?;
                let priority = { task.sched.lock().priority };
                let child_task = Task::new(priority);
                child_task.attach_stack(KERNEL_STACK_SIZE);
                {
                    let parent_frame = task.frame.lock();
                    let mut child_frame = child_task.frame.lock();
                    *child_frame = parent_frame.clone();
                    child_frame.hart = 0;
                    child_frame.set(Reg::A0, 0);
                    child_frame.satp = child_process.space().satp(child_process.pid as usize);
                }
                *child_task.process.lock() = Some(child_process.clone());
                *child_process.task.lock() = Arc::downgrade(&child_task);
                crate::task::sched::enqueue_task(child_task);
                Ok(child_process.pid as isize)
            })();
            complete(task, result)
        }
        None => {
            // Kernel-task fork: twin task, same pc, copied stack. The
            // caller sees 0, the twin sees 1.
            let priority = { task.sched.lock().priority };
            let child = Task::new(priority);
            child.copy_stack_from(task);
            {
                let parent_frame = task.frame.lock();
                let mut child_frame = child.frame.lock();
                *child_frame = parent_frame.clone();
                child_frame.hart = 0;
                child_frame.set(Reg::A0, 1);
                // Relocate sp into the copied stack.
                if let (Some(parent_top), Some(child_top)) =
                    (task.stack_top(), child.stack_top())
                {
                    let used = parent_top - parent_frame.get(Reg::Sp);
                    child_frame.set(Reg::Sp, child_top - used);
                }
            }
            crate::task::sched::enqueue_task(child);
            complete(task, Ok(0))
        }
    }
}

pub fn sys_getpid(task: &Arc<Task>) -> SyscallReturn {
    let result = process_of(task).map(|process| process.pid as isize);
    complete(task, result)
}

pub fn sys_getppid(task: &Arc<Task>) -> SyscallReturn {
    let result = process_of(task).map(|process| process.tree.lock().parent as isize);
    complete(task, result)
}

/// wait(pid, status, options)
pub fn sys_wait(task: &Arc<Task>) -> SyscallReturn {
    let process = match process_of(task) {
        Ok(process) => process,
        Err(err) => return complete(task, Err(err)),
    };
    wait::execute_wait(task, &process);
    if task.state() == TaskState::WaitChld {
        SyscallReturn::Park
    } else {
        SyscallReturn::Continue
    }
}

/// kill(pid, signal)
pub fn sys_kill(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (pid, signo) = {
            let frame = task.frame.lock();
            (frame.arg(0) as Pid, frame.arg(1) as u32)
        };
        let sig = Signal::from_u32(signo).ok_or(Errno::EINVAL)?;
        process::kill(&process, pid, sig)?;
        Ok(0)
    })();
    complete(task, result)
}

/// sigaction(sig, new, old)
pub fn sys_sigaction(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (signo, new_addr, old_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0) as u32, frame.arg(1), frame.arg(2))
        };
        let sig = Signal::from_u32(signo).ok_or(Errno::EINVAL)?;
        if sig.is_unblockable() {
            return Err(Errno::EINVAL);
        }
        let space = process.space();
        let old = process.signals.handler(sig);
        if new_addr != 0 {
            let mut bytes = [0u8; 32];
            uaccess::copy_from_user(&space, new_addr, &mut bytes)?;
            process.signals.set_handler(sig, SigAction::from_bytes(&bytes));
        }
        if old_addr != 0 {
            uaccess::copy_to_user(&space, old_addr, &old.to_bytes())?;
        }
        Ok(0)
    })();
    complete(task, result)
}

/// sigreturn(): pop the handler frame; EINVAL outside a handler.
pub fn sys_sigreturn(task: &Arc<Task>) -> SyscallReturn {
    let result: crate::error::Result<()> = (|| {
        let process = process_of(task)?;
        signal::sigreturn(task, &process)?;
        // a0 was restored from the frame; don't overwrite it.
        Ok(())
    })();
    if let Err(err) = result {
        task.frame.lock().set_return(err.as_isize());
    }
    SyscallReturn::Continue
}

pub fn sys_sigpending(task: &Arc<Task>) -> SyscallReturn {
    let result = process_of(task).map(|process| process.signals.pending_set() as isize);
    complete(task, result)
}

/// sigprocmask(how, set) -> previous mask
pub fn sys_sigprocmask(task: &Arc<Task>) -> SyscallReturn {
    const SIG_SETMASK: usize = 0;
    const SIG_BLOCK: usize = 1;
    const SIG_UNBLOCK: usize = 2;
    let result = (|| {
        let process = process_of(task)?;
        let (how, set) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1) as u64)
        };
        let old = match how {
            SIG_SETMASK => process.signals.set_mask(set),
            SIG_BLOCK => process.signals.block(set),
            SIG_UNBLOCK => process.signals.unblock(set),
            _ => return Err(Errno::EINVAL),
        };
        Ok(old as isize)
    })();
    complete(task, result)
}

/// pause(): park until any signal arrives; always returns -EINTR.
pub fn sys_pause(task: &Arc<Task>) -> SyscallReturn {
    let process = match process_of(task) {
        Ok(process) => process,
        Err(err) => return complete(task, Err(err)),
    };
    task.frame.lock().set_return(Errno::EINTR.as_isize());
    task.restart.store(false, Ordering::Release);
    let watched = process.clone();
    task.park(
        TaskState::Paused,
        0,
        Some(Box::new(move |_task: &Task| watched.signals.has_deliverable())),
    );
    SyscallReturn::Park
}

/// alarm(seconds) -> seconds left on the previous alarm.
pub fn sys_alarm(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let seconds = { task.frame.lock().arg(0) as u64 };
        let at = if seconds == 0 {
            0
        } else {
            get_time() + seconds * NANOS_PER_SEC
        };
        let previous = process.signals.set_alarm(at);
        let now = get_time();
        let left = if previous == 0 {
            0
        } else if previous <= now {
            1
        } else {
            ((previous - now) / NANOS_PER_SEC).max(1)
        };
        Ok(left as isize)
    })();
    complete(task, result)
}

/// times(buf): user, system, child user, child system times.
pub fn sys_times(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let buf_addr = { task.frame.lock().arg(0) };
        let times = *process.times.lock();
        if buf_addr != 0 {
            let mut bytes = [0u8; 32];
            bytes[0..8].copy_from_slice(&times.user_time.to_le_bytes());
            bytes[8..16].copy_from_slice(&times.system_time.to_le_bytes());
            bytes[16..24].copy_from_slice(&times.user_child_time.to_le_bytes());
            bytes[24..32].copy_from_slice(&times.system_child_time.to_le_bytes());
            uaccess::copy_to_user(&process.space(), buf_addr, &bytes)?;
        }
        Ok(get_time() as isize)
    })();
    complete(task, result)
}

pub fn sys_getuid(task: &Arc<Task>) -> SyscallReturn {
    let result = process_of(task).map(|process| process.user.lock().ruid as isize);
    complete(task, result)
}

pub fn sys_getgid(task: &Arc<Task>) -> SyscallReturn {
    let result = process_of(task).map(|process| process.user.lock().rgid as isize);
    complete(task, result)
}

/// setuid: root sets all three ids; others may switch between their real
/// and saved ids.
pub fn sys_setuid(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let uid = { task.frame.lock().arg(0) as u32 };
        let mut user = process.user.lock();
        if user.euid == 0 {
            user.ruid = uid;
            user.euid = uid;
            user.suid = uid;
            Ok(0)
        } else if user.ruid == uid || user.suid == uid {
            user.euid = uid;
            Ok(0)
        } else {
            Err(Errno::EPERM)
        }
    })();
    complete(task, result)
}

pub fn sys_setgid(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let gid = { task.frame.lock().arg(0) as u32 };
        let mut user = process.user.lock();
        if user.euid == 0 {
            user.rgid = gid;
            user.egid = gid;
            user.sgid = gid;
            Ok(0)
        } else if user.rgid == gid || user.sgid == gid {
            user.egid = gid;
            Ok(0)
        } else {
            Err(Errno::EPERM)
        }
    })();
    complete(task, result)
}

/// Read a NULL-terminated pointer array of strings from user space.
fn read_string_array(
    space: &crate::mm::AddressSpace,
    mut addr: usize,
) -> Result<Vec<String>> {
    let mut strings = Vec::new();
    if addr == 0 {
        return Ok(strings);
    }
    loop {
        let ptr = uaccess::read_user_usize(space, addr)?;
        if ptr == 0 {
            return Ok(strings);
        }
        strings.push(uaccess::read_user_cstr(space, ptr, MAX_USER_STRING)?);
        addr += 8;
        if strings.len() > 1024 {
            return Err(Errno::EINVAL);
        }
    }
}

/// execve(path, argv, envp)
pub fn sys_execve(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (path_addr, argv_addr, envp_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1), frame.arg(2))
        };
        let space = process.space();
        let path = uaccess::read_user_cstr(&space, path_addr, MAX_USER_STRING)?;
        let argv = read_string_array(&space, argv_addr)?;
        let envp = read_string_array(&space, envp_addr)?;
        crate::process::exec::execve(task, &process, &path, &argv, &envp)
    })();
    match result {
        // The frame now points at the fresh image; a0 holds argc.
        Ok(()) => SyscallReturn::Continue,
        Err(err) => complete(task, Err(err)),
    }
}
