//! Syscall dispatch.
//!
//! ABI: a0 carries the syscall number, a1..a6 the arguments, and the
//! result returns in a0 (negative errno on failure). Numbers are fixed;
//! kernel-only calls start at 1024. A handler either completes
//! (`Continue`) or parks its task (`Park`); parked syscalls with the
//! restart flag re-issue the trapped ecall on wakeup.

pub mod fs;
pub mod mem;
pub mod proc;
pub mod uaccess;

use crate::error::Errno;
use crate::task::{Reg, Task, TaskState};
use crate::vfs::file::VfsFile;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

pub const SYSCALL_PRINT: usize = 0;
pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_YIELD: usize = 2;
pub const SYSCALL_FORK: usize = 3;
pub const SYSCALL_SLEEP: usize = 4;
pub const SYSCALL_OPEN: usize = 5;
pub const SYSCALL_LINK: usize = 6;
pub const SYSCALL_UNLINK: usize = 7;
pub const SYSCALL_RENAME: usize = 8;
pub const SYSCALL_CLOSE: usize = 9;
pub const SYSCALL_READ: usize = 10;
pub const SYSCALL_WRITE: usize = 11;
pub const SYSCALL_SEEK: usize = 12;
pub const SYSCALL_STAT: usize = 13;
pub const SYSCALL_DUP: usize = 14;
pub const SYSCALL_TRUNC: usize = 15;
pub const SYSCALL_CHMOD: usize = 16;
pub const SYSCALL_CHOWN: usize = 17;
pub const SYSCALL_MOUNT: usize = 18;
pub const SYSCALL_UMOUNT: usize = 19;
pub const SYSCALL_EXECVE: usize = 20;
pub const SYSCALL_READDIR: usize = 21;
pub const SYSCALL_GETPID: usize = 22;
pub const SYSCALL_GETPPID: usize = 23;
pub const SYSCALL_WAIT: usize = 24;
pub const SYSCALL_SBRK: usize = 25;
pub const SYSCALL_PROTECT: usize = 26;
pub const SYSCALL_SIGACTION: usize = 27;
pub const SYSCALL_SIGRETURN: usize = 28;
pub const SYSCALL_KILL: usize = 29;
pub const SYSCALL_GETUID: usize = 30;
pub const SYSCALL_GETGID: usize = 31;
pub const SYSCALL_SETUID: usize = 32;
pub const SYSCALL_SETGID: usize = 33;
pub const SYSCALL_CHDIR: usize = 34;
pub const SYSCALL_GETCWD: usize = 35;
pub const SYSCALL_PIPE: usize = 36;
pub const SYSCALL_TIMES: usize = 37;
pub const SYSCALL_PAUSE: usize = 38;
pub const SYSCALL_ALARM: usize = 39;
pub const SYSCALL_SIGPENDING: usize = 40;
pub const SYSCALL_SIGPROCMASK: usize = 41;
pub const SYSCALL_MKNOD: usize = 42;

/// Kernel-only syscalls live past this offset.
pub const KERNEL_ONLY_OFFSET: usize = 1024;
pub const SYSCALL_CRITICAL: usize = KERNEL_ONLY_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// The handler finished; resume the task.
    Continue,
    /// The task parked (or died); schedule something else.
    Park,
}

/// Route one trapped ecall. `is_kernel` is true when the ecall came from
/// supervisor mode; kernel-only numbers are rejected otherwise.
pub fn dispatch(task: &Arc<Task>, is_kernel: bool) -> SyscallReturn {
    let nr = { task.frame.lock().get(Reg::A0) };
    #[cfg(feature = "syscall-verbose")]
    crate::debug!("syscall {} from {:?} task", nr, task.state());
    if nr >= KERNEL_ONLY_OFFSET && !is_kernel {
        task.frame.lock().set_return(Errno::EINVAL.as_isize());
        return SyscallReturn::Continue;
    }
    match nr {
        SYSCALL_PRINT => fs::sys_print(task),
        SYSCALL_EXIT => proc::sys_exit(task),
        SYSCALL_YIELD => proc::sys_yield(task),
        SYSCALL_FORK => proc::sys_fork(task),
        SYSCALL_SLEEP => proc::sys_sleep(task),
        SYSCALL_OPEN => fs::sys_open(task),
        SYSCALL_LINK => fs::sys_link(task),
        SYSCALL_UNLINK => fs::sys_unlink(task),
        SYSCALL_RENAME => fs::sys_rename(task),
        SYSCALL_CLOSE => fs::sys_close(task),
        SYSCALL_READ => fs::sys_read(task),
        SYSCALL_WRITE => fs::sys_write(task),
        SYSCALL_SEEK => fs::sys_seek(task),
        SYSCALL_STAT => fs::sys_stat(task),
        SYSCALL_DUP => fs::sys_dup(task),
        SYSCALL_TRUNC => fs::sys_trunc(task),
        SYSCALL_CHMOD => fs::sys_chmod(task),
        SYSCALL_CHOWN => fs::sys_chown(task),
        SYSCALL_MOUNT => fs::sys_mount(task),
        SYSCALL_UMOUNT => fs::sys_umount(task),
        SYSCALL_EXECVE => proc::sys_execve(task),
        SYSCALL_READDIR => fs::sys_readdir(task),
        SYSCALL_GETPID => proc::sys_getpid(task),
        SYSCALL_GETPPID => proc::sys_getppid(task),
        SYSCALL_WAIT => proc::sys_wait(task),
        SYSCALL_SBRK => mem::sys_sbrk(task),
        SYSCALL_PROTECT => mem::sys_protect(task),
        SYSCALL_SIGACTION => proc::sys_sigaction(task),
        SYSCALL_SIGRETURN => proc::sys_sigreturn(task),
        SYSCALL_KILL => proc::sys_kill(task),
        SYSCALL_GETUID => proc::sys_getuid(task),
        SYSCALL_GETGID => proc::sys_getgid(task),
        SYSCALL_SETUID => proc::sys_setuid(task),
        SYSCALL_SETGID => proc::sys_setgid(task),
        SYSCALL_CHDIR => fs::sys_chdir(task),
        SYSCALL_GETCWD => fs::sys_getcwd(task),
        SYSCALL_PIPE => fs::sys_pipe(task),
        SYSCALL_TIMES => proc::sys_times(task),
        SYSCALL_PAUSE => proc::sys_pause(task),
        SYSCALL_ALARM => proc::sys_alarm(task),
        SYSCALL_SIGPENDING => proc::sys_sigpending(task),
        SYSCALL_SIGPROCMASK => proc::sys_sigprocmask(task),
        SYSCALL_MKNOD => fs::sys_mknod(task),
        _ => {
            task.frame.lock().set_return(Errno::EINVAL.as_isize());
            SyscallReturn::Continue
        }
    }
}

/// Deposit a result and finish.
pub(crate) fn complete(task: &Arc<Task>, result: crate::error::Result<isize>) -> SyscallReturn {
    let value = match result {
        Ok(value) => value,
        Err(err) => err.as_isize(),
    };
    task.frame.lock().set_return(value);
    SyscallReturn::Continue
}

/// Park the task until `file` becomes ready, re-issuing the ecall on
/// wakeup. Registers the task with the device's waiter list.
pub(crate) fn park_on_file(task: &Arc<Task>, file: Arc<VfsFile>, write: bool) -> SyscallReturn {
    file.node.ops.register_waiter(&file.node, task);
    task.restart.store(true, Ordering::Release);
    let watched = file.clone();
    task.park(
        TaskState::Waiting,
        0,
        Some(Box::new(move |_task: &Task| watched.is_ready(write))),
    );
    SyscallReturn::Park
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DEFAULT_PRIORITY;

    #[test]
    fn unknown_numbers_return_einval() {
        let task = Task::new(DEFAULT_PRIORITY);
        task.frame.lock().set(Reg::A0, 999);
        assert_eq!(dispatch(&task, false), SyscallReturn::Continue);
        assert_eq!(
            task.frame.lock().get(Reg::A0) as isize,
            Errno::EINVAL.as_isize()
        );
    }

    #[test]
    fn kernel_only_numbers_rejected_from_user() {
        let task = Task::new(DEFAULT_PRIORITY);
        task.frame.lock().set(Reg::A0, SYSCALL_CRITICAL);
        dispatch(&task, false);
        assert_eq!(
            task.frame.lock().get(Reg::A0) as isize,
            Errno::EINVAL.as_isize()
        );
    }
}
