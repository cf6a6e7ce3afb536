//! Processes: the ownership unit above tasks.
//!
//! A process owns an address space, a file-descriptor table, credentials,
//! session/group ids and signal state. The global registry keyed by pid is
//! the only owning reference; tree links are plain pids so no cycles form.

pub mod exec;
pub mod signal;
pub mod wait;

use crate::error::{Errno, Result};
use crate::mm::AddressSpace;
use crate::task::Task;
use crate::time::Time;
use crate::vfs::file::VfsFile;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

pub type Pid = i32;
pub type Uid = u32;
pub type Gid = u32;

/// Real, effective and saved user and group ids.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub ruid: Uid,
    pub euid: Uid,
    pub suid: Uid,
    pub rgid: Gid,
    pub egid: Gid,
    pub sgid: Gid,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            ruid: 0,
            euid: 0,
            suid: 0,
            rgid: 0,
            egid: 0,
            sgid: 0,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Drop this descriptor at execve.
        const CLOEXEC = 1 << 0;
    }
}

pub struct FdEntry {
    pub file: Arc<VfsFile>,
    pub flags: FdFlags,
}

/// Per-process files, working directory and umask.
pub struct Resources {
    pub fds: BTreeMap<i32, FdEntry>,
    pub cwd: String,
    pub umask: u16,
}

impl Resources {
    fn new() -> Self {
        Self {
            fds: BTreeMap::new(),
            cwd: String::from("/"),
            umask: 0o022,
        }
    }

    /// Lowest unused descriptor number.
    pub fn alloc_fd(&mut self, file: Arc<VfsFile>, flags: FdFlags) -> i32 {
        let mut fd = 0;
        while self.fds.contains_key(&fd) {
            fd += 1;
        }
        self.fds.insert(fd, FdEntry { file, flags });
        fd
    }

    pub fn get(&self, fd: i32) -> Result<Arc<VfsFile>> {
        self.fds
            .get(&fd)
            .map(|entry| entry.file.clone())
            .ok_or(Errno::EBADF)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let entry = self.fds.remove(&fd).ok_or(Errno::EBADF)?;
        crate::vfs::file::file_put(&entry.file);
        Ok(())
    }

    pub fn close_all(&mut self) {
        let fds = core::mem::take(&mut self.fds);
        for (_, entry) in fds {
            crate::vfs::file::file_put(&entry.file);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitResult {
    pub pid: Pid,
    pub pgid: Pid,
    pub status: i32,
    pub user_time: Time,
    pub system_time: Time,
}

pub struct TreeInfo {
    pub parent: Pid,
    pub children: Vec<Pid>,
    pub waits: Vec<WaitResult>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Times {
    pub user_time: Time,
    pub system_time: Time,
    pub user_child_time: Time,
    pub system_child_time: Time,
}

pub struct SessionIds {
    pub pgid: Pid,
    pub sid: Pid,
}

pub struct Process {
    pub pid: Pid,
    space: Mutex<Arc<AddressSpace>>,
    pub tree: Mutex<TreeInfo>,
    pub ids: Mutex<SessionIds>,
    pub user: Mutex<Credentials>,
    pub resources: Mutex<Resources>,
    pub signals: signal::SignalState,
    pub times: Mutex<Times>,
    pub status: AtomicI32,
    pub task: Mutex<Weak<Task>>,
}

lazy_static! {
    static ref PROCESSES: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());
}

static NEXT_PID: AtomicI32 = AtomicI32::new(1);

pub fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Encode a normal exit for the wait status word.
pub fn exit_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Encode death-by-signal for the wait status word.
pub fn signal_status(sig: u32) -> i32 {
    (sig & 0x7f) as i32
}

impl Process {
    fn build(pid: Pid, parent: Pid, space: Arc<AddressSpace>) -> Arc<Process> {
        Arc::new(Process {
            pid,
            space: Mutex::new(space),
            tree: Mutex::new(TreeInfo {
                parent,
                children: Vec::new(),
                waits: Vec::new(),
            }),
            ids: Mutex::new(SessionIds { pgid: pid, sid: pid }),
            user: Mutex::new(Credentials::root()),
            resources: Mutex::new(Resources::new()),
            signals: signal::SignalState::new(),
            times: Mutex::new(Times::default()),
            status: AtomicI32::new(0),
            task: Mutex::new(Weak::new()),
        })
    }

    /// A fresh process with an empty address space.
    pub fn new_user(parent: Option<&Arc<Process>>) -> Result<Arc<Process>> {
        let pid = alloc_pid();
        let space = Arc::new(AddressSpace::new()?);
        let process = Self::build(pid, parent.map(|p| p.pid).unwrap_or(0), space);
        if let Some(parent) = parent {
            let ids = parent.ids.lock();
            let mut own = process.ids.lock();
            own.pgid = ids.pgid;
            own.sid = ids.sid;
        }
        register(process.clone());
        Ok(process)
    }

    /// Fork: clone address space (copy-on-write), descriptor table,
    /// credentials, cwd, signal handlers and mask.
    pub fn fork_from(parent: &Arc<Process>) -> Result<Arc<Process>> {
        let pid = alloc_pid();
        let space = Arc::new(parent.space().clone_space()?);
        let process = Self::build(pid, parent.pid, space);
        {
            let ids = parent.ids.lock();
            let mut own = process.ids.lock();
            own.pgid = ids.pgid;
            own.sid = ids.sid;
        }
        *process.user.lock() = *parent.user.lock();
        {
            let parent_res = parent.resources.lock();
            let mut own = process.resources.lock();
            own.cwd = parent_res.cwd.clone();
            own.umask = parent_res.umask;
            for (fd, entry) in parent_res.fds.iter() {
                crate::vfs::file::file_get(&entry.file);
                own.fds.insert(
                    *fd,
                    FdEntry {
                        file: entry.file.clone(),
                        flags: entry.flags,
                    },
                );
            }
        }
        process.signals.inherit_from(&parent.signals);
        register(process.clone());
        Ok(process)
    }

    pub fn space(&self) -> Arc<AddressSpace> {
        self.space.lock().clone()
    }

    /// Replace the address space (execve).
    pub fn set_space(&self, space: Arc<AddressSpace>) {
        *self.space.lock() = space;
    }

    pub fn main_task(&self) -> Option<Arc<Task>> {
        self.task.lock().upgrade()
    }

    pub fn pgid(&self) -> Pid {
        self.ids.lock().pgid
    }

    pub fn sid(&self) -> Pid {
        self.ids.lock().sid
    }
}

fn register(process: Arc<Process>) {
    let parent_pid = { process.tree.lock().parent };
    if let Some(parent) = process_by_pid(parent_pid) {
        parent.tree.lock().children.push(process.pid);
    }
    PROCESSES.lock().insert(process.pid, process);
}

pub fn process_by_pid(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid).cloned()
}

pub fn for_each_process(mut f: impl FnMut(&Arc<Process>)) {
    let snapshot: Vec<Arc<Process>> = PROCESSES.lock().values().cloned().collect();
    for process in snapshot {
        f(&process);
    }
}

pub fn process_count() -> usize {
    PROCESSES.lock().len()
}

/// Terminate a process: record the wait status, reparent its children,
/// notify the parent and mark the task dead. Resources go with the last
/// reference once the task is reaped.
pub fn exit_process(process: &Arc<Process>, status: i32) {
    process.status.store(status, Ordering::Release);

    let (parent_pid, children, pending_waits) = {
        let mut tree = process.tree.lock();
        (
            tree.parent,
            core::mem::take(&mut tree.children),
            core::mem::take(&mut tree.waits),
        )
    };

    // Orphans move to our parent, ultimately to pid 1.
    let new_parent_pid = if process_by_pid(parent_pid).is_some() {
        parent_pid
    } else {
        1
    };
    for child_pid in &children {
        if let Some(child) = process_by_pid(*child_pid) {
            child.tree.lock().parent = new_parent_pid;
        }
    }
    if let Some(new_parent) = process_by_pid(new_parent_pid) {
        let mut tree = new_parent.tree.lock();
        for child_pid in &children {
            if !tree.children.contains(child_pid) {
                tree.children.push(*child_pid);
            }
        }
    }

    if let Some(parent) = process_by_pid(parent_pid) {
        let times = *process.times.lock();
        {
            let mut tree = parent.tree.lock();
            tree.children.retain(|&pid| pid != process.pid);
            // Unreaped grandchild results follow the children.
            tree.waits.extend(pending_waits);
            tree.waits.push(WaitResult {
                pid: process.pid,
                pgid: process.pgid(),
                status,
                user_time: times.user_time + times.user_child_time,
                system_time: times.system_time + times.system_child_time,
            });
        }
        signal::send_signal(&parent, signal::Signal::SIGCHLD);
    }

    process.resources.lock().close_all();
    PROCESSES.lock().remove(&process.pid);

    if let Some(task) = process.main_task() {
        task.set_state(crate::task::TaskState::Terminated);
        *task.process.lock() = None;
    }
}

/// setsid: become session and group leader, unless already a leader.
pub fn setsid(process: &Arc<Process>) -> Result<Pid> {
    let mut ids = process.ids.lock();
    if ids.pgid == process.pid {
        return Err(Errno::EPERM);
    }
    ids.sid = process.pid;
    ids.pgid = process.pid;
    Ok(process.pid)
}

pub fn getsid(process: &Arc<Process>, pid: Pid) -> Result<Pid> {
    if pid == 0 || pid == process.pid {
        return Ok(process.sid());
    }
    process_by_pid(pid).map(|p| p.sid()).ok_or(Errno::ESRCH)
}

pub fn getpgid(process: &Arc<Process>, pid: Pid) -> Result<Pid> {
    if pid == 0 || pid == process.pid {
        return Ok(process.pgid());
    }
    process_by_pid(pid).map(|p| p.pgid()).ok_or(Errno::ESRCH)
}

/// setpgid: only for self or direct children, and only within the session.
pub fn setpgid(process: &Arc<Process>, pid: Pid, pgid: Pid) -> Result<()> {
    let target = if pid == 0 {
        process.clone()
    } else {
        process_by_pid(pid).ok_or(Errno::ESRCH)?
    };
    if target.pid != process.pid && target.tree.lock().parent != process.pid {
        return Err(Errno::ESRCH);
    }
    let wanted = if pgid == 0 { target.pid } else { pgid };
    let group_sid = if wanted == target.pid {
        target.sid()
    } else {
        for_each_sid_of_group(wanted).ok_or(Errno::EPERM)?
    };
    let mut ids = target.ids.lock();
    if ids.sid != group_sid {
        return Err(Errno::EPERM);
    }
    ids.pgid = wanted;
    Ok(())
}

fn for_each_sid_of_group(pgid: Pid) -> Option<Pid> {
    let mut found = None;
    for_each_process(|process| {
        if found.is_none() && process.pgid() == pgid {
            found = Some(process.sid());
        }
    });
    found
}

/// kill: pid > 0 targets one process, 0 the sender's group, -1 everything
/// the sender may signal, < -1 the group `-pid`.
pub fn kill(sender: &Arc<Process>, pid: Pid, sig: signal::Signal) -> Result<()> {
    let sender_user = *sender.user.lock();
    let sender_pgid = sender.pgid();
    let mut found = 0usize;
    let mut allowed = 0usize;
    for_each_process(|process| {
        let matches = pid == -1
            || (pid > 0 && process.pid == pid)
            || (pid == 0 && process.pgid() == sender_pgid)
            || (pid < -1 && process.pgid() == -pid);
        if !matches {
            return;
        }
        found += 1;
        let target_user = *process.user.lock();
        let permitted = sender_user.euid == 0
            || sender_user.euid == target_user.ruid
            || sender_user.euid == target_user.suid
            || sender_user.ruid == target_user.ruid
            || sender_user.ruid == target_user.suid;
        if permitted {
            allowed += 1;
            signal::send_signal(process, sig);
        }
    });
    if found == 0 {
        Err(Errno::ESRCH)
    } else if allowed == 0 {
        Err(Errno::EPERM)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::ensure_page_pool;

    #[test]
    fn status_encoding() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(42), 42 << 8);
        assert_eq!(signal_status(9), 9);
        // WIFEXITED style checks.
        assert_eq!(exit_status(42) & 0x7f, 0);
        assert_ne!(signal_status(9) & 0x7f, 0);
    }

    #[test]
    fn tree_registration_and_exit_reparents() {
        ensure_page_pool();
        let init = Process::new_user(None).unwrap();
        let parent = Process::new_user(Some(&init)).unwrap();
        let child = Process::new_user(Some(&parent)).unwrap();
        assert!(init.tree.lock().children.contains(&parent.pid));
        assert!(parent.tree.lock().children.contains(&child.pid));

        exit_process(&parent, exit_status(3));
        // The grandchild now belongs to init's children.
        assert_eq!(child.tree.lock().parent, init.pid);
        assert!(init.tree.lock().children.contains(&child.pid));
        // init got a wait result and a SIGCHLD.
        let waits = init.tree.lock().waits.clone();
        assert!(waits.iter().any(|w| w.pid == parent.pid && w.status == 3 << 8));
        assert!(init.signals.has_pending(signal::Signal::SIGCHLD));
        exit_process(&child, exit_status(0));
        exit_process(&init, exit_status(0));
    }

    #[test]
    fn setsid_refused_for_group_leader() {
        ensure_page_pool();
        let leader = Process::new_user(None).unwrap();
        // A fresh process is its own group leader.
        assert_eq!(setsid(&leader), Err(Errno::EPERM));
        let child = Process::new_user(Some(&leader)).unwrap();
        // The child inherited the parent's group, so it may detach.
        assert_eq!(setsid(&child), Ok(child.pid));
        assert_eq!(child.pgid(), child.pid);
        assert_eq!(child.sid(), child.pid);
        exit_process(&child, 0);
        exit_process(&leader, 0);
    }

    #[test]
    fn setpgid_rules() {
        ensure_page_pool();
        let parent = Process::new_user(None).unwrap();
        let child = Process::new_user(Some(&parent)).unwrap();
        let stranger = Process::new_user(None).unwrap();
        // Moving a stranger is refused.
        assert_eq!(setpgid(&parent, stranger.pid, 0), Err(Errno::ESRCH));
        // A child may become its own group leader.
        assert_eq!(setpgid(&parent, child.pid, 0), Ok(()));
        assert_eq!(child.pgid(), child.pid);
        exit_process(&stranger, 0);
        exit_process(&child, 0);
        exit_process(&parent, 0);
    }
}
