//! wait(): reaping child results.
//!
//! Exit stores an immutable result in the parent; wait consumes it. The
//! pid selector follows POSIX: -1 any child, 0 the caller's process
//! group, > 0 one specific child.

use super::{Pid, Process};
use crate::error::Errno;
use crate::syscall::uaccess;
use crate::task::{Task, TaskState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

pub const WNOHANG: usize = 1;

fn selector_matches(selector: Pid, own_pgid: Pid, result_pid: Pid, result_pgid: Pid) -> bool {
    selector == -1
        || (selector == 0 && result_pgid == own_pgid)
        || (selector > 0 && result_pid == selector)
        || (selector < -1 && result_pgid == -selector)
}

/// Consume a matching wait result, accumulate the child's times and
/// write the status word out. Returns the reaped pid.
fn consume_wait(process: &Arc<Process>, selector: Pid, status_addr: usize) -> Option<Pid> {
    let own_pgid = process.pgid();
    let result = {
        let mut tree = process.tree.lock();
        let pos = tree
            .waits
            .iter()
            .position(|w| selector_matches(selector, own_pgid, w.pid, w.pgid))?;
        tree.waits.remove(pos)
    };
    {
        let mut times = process.times.lock();
        times.user_child_time += result.user_time;
        times.system_child_time += result.system_time;
    }
    if status_addr != 0 {
        let space = process.space();
        let _ = uaccess::copy_to_user(&space, status_addr, &result.status.to_le_bytes());
    }
    Some(result.pid)
}

/// Is there any live child a matching result could still come from?
fn has_live_candidate(process: &Arc<Process>, selector: Pid) -> bool {
    let children = process.tree.lock().children.clone();
    let own_pgid = process.pgid();
    children.iter().any(|&pid| match selector {
        -1 => true,
        0 => super::process_by_pid(pid)
            .map(|child| child.pgid() == own_pgid)
            .unwrap_or(false),
        sel if sel > 0 => pid == sel,
        sel => super::process_by_pid(pid)
            .map(|child| child.pgid() == -sel)
            .unwrap_or(false),
    })
}

/// The wait syscall body. Either completes immediately or parks the task
/// in `WaitChld` with a predicate watching the wait list.
pub fn execute_wait(task: &Arc<Task>, process: &Arc<Process>) {
    let (selector, status_addr, options) = {
        let frame = task.frame.lock();
        (frame.arg(0) as Pid, frame.arg(1), frame.arg(2))
    };
    if let Some(pid) = consume_wait(process, selector, status_addr) {
        task.frame.lock().set_return(pid as isize);
        return;
    }
    if !has_live_candidate(process, selector) {
        task.frame.lock().set_return(Errno::ECHILD.as_isize());
        return;
    }
    if options & WNOHANG != 0 {
        task.frame.lock().set_return(0);
        return;
    }
    let own_pgid = process.pgid();
    let watched = process.clone();
    task.restart.store(false, Ordering::Release);
    task.park(
        TaskState::WaitChld,
        0,
        Some(Box::new(move |_task: &Task| {
            let tree = watched.tree.lock();
            tree.waits
                .iter()
                .any(|w| selector_matches(selector, own_pgid, w.pid, w.pgid))
        })),
    );
}

/// Called by the scheduler when a `WaitChld` task wakes: consume the
/// result that arrived, or report the interruption.
pub fn finish_wait(task: &Arc<Task>) {
    let process = match task.process() {
        Some(process) => process,
        None => return,
    };
    let (selector, status_addr) = {
        let frame = task.frame.lock();
        (frame.arg(0) as Pid, frame.arg(1))
    };
    match consume_wait(&process, selector, status_addr) {
        Some(pid) => task.frame.lock().set_return(pid as isize),
        None => task.frame.lock().set_return(Errno::EINTR.as_isize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_semantics() {
        assert!(selector_matches(-1, 5, 9, 7));
        assert!(selector_matches(0, 5, 9, 5));
        assert!(!selector_matches(0, 5, 9, 7));
        assert!(selector_matches(9, 5, 9, 7));
        assert!(!selector_matches(8, 5, 9, 7));
        assert!(selector_matches(-7, 5, 9, 7));
        assert!(!selector_matches(-8, 5, 9, 7));
    }
}
