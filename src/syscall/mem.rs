//! Memory syscalls: the heap break and page protections.

use super::{complete, SyscallReturn};
use crate::error::{Errno, Result};
use crate::mm::address_space::MapPerms;
use crate::mm::PAGE_SIZE;
use crate::task::Task;
use alloc::sync::Arc;

pub const PROT_READ: usize = 1;
pub const PROT_WRITE: usize = 2;
pub const PROT_EXEC: usize = 4;

/// sbrk(increment) -> previous break
pub fn sys_sbrk(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = task.process().ok_or(Errno::EINVAL)?;
        let increment = { task.frame.lock().arg(0) as isize };
        let space = process.space();
        let old_brk = space.brk();
        space.sbrk(increment)?;
        Ok(old_brk as isize)
    })();
    complete(task, result)
}

/// protect(addr, len, prot)
pub fn sys_protect(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = task.process().ok_or(Errno::EINVAL)?;
        let (addr, len, prot) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1), frame.arg(2))
        };
        if addr % PAGE_SIZE != 0 || len == 0 {
            return Err(Errno::EINVAL);
        }
        let mut perms = MapPerms::empty();
        if prot & PROT_READ != 0 {
            perms |= MapPerms::READ;
        }
        if prot & PROT_WRITE != 0 {
            perms |= MapPerms::WRITE;
        }
        if prot & PROT_EXEC != 0 {
            perms |= MapPerms::EXEC;
        }
        process.space().protect(addr, len, perms)?;
        Ok(0)
    })();
    complete(task, result)
}
