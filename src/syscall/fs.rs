//! File and filesystem syscalls.

use super::uaccess::{self, MAX_USER_STRING};
use super::{complete, park_on_file, SyscallReturn};
use crate::error::{Errno, Result};
use crate::process::{FdFlags, Process};
use crate::task::{Task, TaskState};
use crate::vfs::file::{file_get, file_put, OpenFlags, SeekWhence, VfsFile};
use crate::vfs::node::FileType;
use crate::vfs::pipe::PipeDelivery;
use crate::vfs::{self, VfsStat};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::Ordering;

/// Per-call kernel bounce buffer cap (64 KiB).
const IO_CHUNK: usize = 1 << 16;

fn process_of(task: &Arc<Task>) -> Result<Arc<Process>> {
    task.process().ok_or(Errno::EINVAL)
}

fn file_of(process: &Arc<Process>, fd: i32) -> Result<Arc<VfsFile>> {
    process.resources.lock().get(fd)
}

fn user_path(task: &Arc<Task>, process: &Arc<Process>, addr: usize) -> Result<String> {
    let _ = task;
    uaccess::read_user_cstr(&process.space(), addr, MAX_USER_STRING)
}

fn cwd_of(process: &Arc<Process>) -> String {
    process.resources.lock().cwd.clone()
}

/// print(str): emit a line on the console.
pub fn sys_print(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let addr = { task.frame.lock().arg(0) };
        let text = uaccess::read_user_cstr(&process.space(), addr, MAX_USER_STRING)?;
        crate::logging::console_write(text.as_bytes());
        Ok(0)
    })();
    complete(task, result)
}

/// open(path, flags, mode) -> fd
pub fn sys_open(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (path_addr, flags_raw, mode) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1) as u32, frame.arg(2) as u16)
        };
        let path = user_path(task, &process, path_addr)?;
        let flags = OpenFlags::from_bits_truncate(flags_raw);
        let (creds, umask, cwd) = {
            let creds = *process.user.lock();
            let resources = process.resources.lock();
            (creds, resources.umask, resources.cwd.clone())
        };
        let file = vfs::open(Some(&creds), umask, &cwd, &path, flags, mode)?;
        let mut fd_flags = FdFlags::empty();
        if flags.contains(OpenFlags::CLOEXEC) {
            fd_flags |= FdFlags::CLOEXEC;
        }
        let fd = process.resources.lock().alloc_fd(file, fd_flags);
        Ok(fd as isize)
    })();
    complete(task, result)
}

pub fn sys_close(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let fd = { task.frame.lock().arg(0) as i32 };
        process.resources.lock().close(fd)?;
        Ok(0)
    })();
    complete(task, result)
}

/// Read through a pipe end: immediate when possible, otherwise the op
/// stays queued and its completion delivers straight into the caller.
fn pipe_read(
    task: &Arc<Task>,
    process: &Arc<Process>,
    file: &Arc<VfsFile>,
    buf_addr: usize,
    len: usize,
) -> SyscallReturn {
    let end = file.pipe.as_ref().unwrap();
    let op = end.shared.submit_read(len.min(IO_CHUNK));
    if op.is_done() {
        let (result, data) = op.take_result();
        let result = result.and_then(|read| {
            uaccess::copy_to_user(&process.space(), buf_addr, &data[..read])?;
            Ok(read as isize)
        });
        return complete(task, result);
    }
    if file.flags().contains(crate::vfs::FileFlags::NONBLOCK) {
        end.shared.cancel(&op);
        let (result, data) = op.take_result();
        let result = result.and_then(|read| {
            if read == 0 {
                return Err(Errno::EAGAIN);
            }
            uaccess::copy_to_user(&process.space(), buf_addr, &data[..read])?;
            Ok(read as isize)
        });
        return complete(task, result);
    }
    op.set_delivery(PipeDelivery {
        task: task.clone(),
        read_into: Some((buf_addr, process.space())),
    });
    task.restart.store(false, Ordering::Release);
    let watched = op.clone();
    task.park(
        TaskState::Waiting,
        0,
        Some(Box::new(move |_task: &Task| watched.is_done())),
    );
    op.flush_delivery();
    SyscallReturn::Park
}

fn pipe_write(
    task: &Arc<Task>,
    process: &Arc<Process>,
    file: &Arc<VfsFile>,
    buf_addr: usize,
    len: usize,
) -> SyscallReturn {
    let end = file.pipe.as_ref().unwrap();
    let mut data = vec![0u8; len.min(IO_CHUNK)];
    if let Err(err) = uaccess::copy_from_user(&process.space(), buf_addr, &mut data) {
        return complete(task, Err(err));
    }
    let op = end.shared.submit_write(data);
    if op.is_done() {
        let (result, _) = op.take_result();
        if result == Err(Errno::EPIPE) {
            crate::process::signal::send_signal(process, crate::process::signal::Signal::SIGPIPE);
        }
        return complete(task, result.map(|n| n as isize));
    }
    if file.flags().contains(crate::vfs::FileFlags::NONBLOCK) {
        end.shared.cancel(&op);
        let (result, _) = op.take_result();
        let result = result.and_then(|written| {
            if written == 0 {
                Err(Errno::EAGAIN)
            } else {
                Ok(written as isize)
            }
        });
        return complete(task, result);
    }
    op.set_delivery(PipeDelivery {
        task: task.clone(),
        read_into: None,
    });
    task.restart.store(false, Ordering::Release);
    let watched = op.clone();
    task.park(
        TaskState::Waiting,
        0,
        Some(Box::new(move |_task: &Task| watched.is_done())),
    );
    op.flush_delivery();
    SyscallReturn::Park
}

/// read(fd, buf, len)
pub fn sys_read(task: &Arc<Task>) -> SyscallReturn {
    let (process, file, buf_addr, len) = {
        let process = match process_of(task) {
            Ok(process) => process,
            Err(err) => return complete(task, Err(err)),
        };
        let (fd, buf_addr, len) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1), frame.arg(2))
        };
        let file = match file_of(&process, fd) {
            Ok(file) => file,
            Err(err) => return complete(task, Err(err)),
        };
        (process, file, buf_addr, len)
    };
    if !file.readable() {
        return complete(task, Err(Errno::EBADF));
    }
    if len == 0 {
        return complete(task, Ok(0));
    }
    if file.pipe.is_some() {
        return pipe_read(task, &process, &file, buf_addr, len);
    }
    let mut buf = vec![0u8; len.min(IO_CHUNK)];
    match file.read(&mut buf) {
        Ok(read) => {
            let result = uaccess::copy_to_user(&process.space(), buf_addr, &buf[..read])
                .map(|_| read as isize);
            complete(task, result)
        }
        Err(Errno::EAGAIN) if !file.flags().contains(crate::vfs::FileFlags::NONBLOCK) => {
            park_on_file(task, file, false)
        }
        Err(err) => complete(task, Err(err)),
    }
}

/// write(fd, buf, len)
pub fn sys_write(task: &Arc<Task>) -> SyscallReturn {
    let process = match process_of(task) {
        Ok(process) => process,
        Err(err) => return complete(task, Err(err)),
    };
    let (fd, buf_addr, len) = {
        let frame = task.frame.lock();
        (frame.arg(0) as i32, frame.arg(1), frame.arg(2))
    };
    let file = match file_of(&process, fd) {
        Ok(file) => file,
        Err(err) => return complete(task, Err(err)),
    };
    if !file.writable() {
        return complete(task, Err(Errno::EBADF));
    }
    if len == 0 {
        return complete(task, Ok(0));
    }
    if file.pipe.is_some() {
        return pipe_write(task, &process, &file, buf_addr, len);
    }
    let mut buf = vec![0u8; len.min(IO_CHUNK)];
    if let Err(err) = uaccess::copy_from_user(&process.space(), buf_addr, &mut buf) {
        return complete(task, Err(err));
    }
    match file.write(&buf) {
        Ok(written) => complete(task, Ok(written as isize)),
        Err(Errno::EAGAIN) if !file.flags().contains(crate::vfs::FileFlags::NONBLOCK) => {
            park_on_file(task, file, true)
        }
        Err(err) => complete(task, Err(err)),
    }
}

/// seek(fd, offset, whence)
pub fn sys_seek(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, offset, whence) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1) as isize, frame.arg(2))
        };
        let file = file_of(&process, fd)?;
        let position = file.seek(offset, SeekWhence::from_usize(whence)?)?;
        Ok(position as isize)
    })();
    complete(task, result)
}

/// Serialize the stat record the ABI promises.
fn stat_to_bytes(stat: &VfsStat) -> [u8; 96] {
    let mut bytes = [0u8; 96];
    let mut put_u64 = |off: usize, value: u64| {
        bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
    };
    put_u64(0, stat.dev as u64);
    put_u64(8, stat.id as u64);
    bytes[16..18].copy_from_slice(&stat.mode.to_le_bytes());
    bytes[24..32].copy_from_slice(&(stat.nlinks as u64).to_le_bytes());
    bytes[32..36].copy_from_slice(&stat.uid.to_le_bytes());
    bytes[36..40].copy_from_slice(&stat.gid.to_le_bytes());
    bytes[40..48].copy_from_slice(&(stat.rdev as u64).to_le_bytes());
    bytes[48..56].copy_from_slice(&(stat.size as u64).to_le_bytes());
    bytes[56..64].copy_from_slice(&(stat.block_size as u64).to_le_bytes());
    bytes[64..72].copy_from_slice(&(stat.blocks as u64).to_le_bytes());
    bytes[72..80].copy_from_slice(&stat.atime.to_le_bytes());
    bytes[80..88].copy_from_slice(&stat.mtime.to_le_bytes());
    bytes[88..96].copy_from_slice(&stat.ctime.to_le_bytes());
    bytes
}

/// stat(fd, buf)
pub fn sys_stat(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, buf_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1))
        };
        let file = file_of(&process, fd)?;
        let stat = file.stat();
        uaccess::copy_to_user(&process.space(), buf_addr, &stat_to_bytes(&stat))?;
        Ok(0)
    })();
    complete(task, result)
}

/// dup(fd) -> new fd
pub fn sys_dup(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let fd = { task.frame.lock().arg(0) as i32 };
        let file = file_of(&process, fd)?;
        file_get(&file);
        let new_fd = process.resources.lock().alloc_fd(file, FdFlags::empty());
        Ok(new_fd as isize)
    })();
    complete(task, result)
}

/// trunc(fd, length)
pub fn sys_trunc(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, length) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1))
        };
        let file = file_of(&process, fd)?;
        file.trunc(length)?;
        Ok(0)
    })();
    complete(task, result)
}

/// chmod(fd, mode)
pub fn sys_chmod(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, mode) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1) as u16)
        };
        let file = file_of(&process, fd)?;
        let creds = *process.user.lock();
        file.chmod(&creds, mode)?;
        Ok(0)
    })();
    complete(task, result)
}

/// chown(fd, uid, gid)
pub fn sys_chown(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, uid, gid) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1) as i32, frame.arg(2) as i32)
        };
        let file = file_of(&process, fd)?;
        let creds = *process.user.lock();
        file.chown(&creds, uid, gid)?;
        Ok(0)
    })();
    complete(task, result)
}

/// link(old, new)
pub fn sys_link(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (old_addr, new_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1))
        };
        let old = user_path(task, &process, old_addr)?;
        let new = user_path(task, &process, new_addr)?;
        let creds = *process.user.lock();
        vfs::link(Some(&creds), &cwd_of(&process), &old, &new)?;
        Ok(0)
    })();
    complete(task, result)
}

/// unlink(path)
pub fn sys_unlink(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let path_addr = { task.frame.lock().arg(0) };
        let path = user_path(task, &process, path_addr)?;
        let creds = *process.user.lock();
        vfs::unlink(Some(&creds), &cwd_of(&process), &path)?;
        Ok(0)
    })();
    complete(task, result)
}

/// rename(old, new)
pub fn sys_rename(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (old_addr, new_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1))
        };
        let old = user_path(task, &process, old_addr)?;
        let new = user_path(task, &process, new_addr)?;
        let creds = *process.user.lock();
        vfs::rename(Some(&creds), &cwd_of(&process), &old, &new)?;
        Ok(0)
    })();
    complete(task, result)
}

/// mount(device, target, fstype)
pub fn sys_mount(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (dev_addr, target_addr, type_addr) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1), frame.arg(2))
        };
        let device_path = user_path(task, &process, dev_addr)?;
        let target = user_path(task, &process, target_addr)?;
        let fstype = user_path(task, &process, type_addr)?;
        if fstype != "minix" {
            return Err(Errno::EINVAL);
        }
        let creds = *process.user.lock();
        let cwd = cwd_of(&process);
        let device = vfs::open(
            Some(&creds),
            0,
            &cwd,
            &device_path,
            OpenFlags::READ | OpenFlags::WRITE,
            0,
        )?;
        let sb = match crate::fs::minix::create_minix_superblock(device.clone()) {
            Ok(sb) => sb,
            Err(err) => {
                file_put(&device);
                return Err(err);
            }
        };
        // The filesystem took its own reference on the device file.
        file_put(&device);
        if let Err(err) = crate::vfs::mount::mount_at(Some(&creds), &cwd, &target, sb.clone()) {
            crate::vfs::superblock::super_put(&sb);
            return Err(err);
        }
        Ok(0)
    })();
    complete(task, result)
}

/// umount(target)
pub fn sys_umount(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let target_addr = { task.frame.lock().arg(0) };
        let target = user_path(task, &process, target_addr)?;
        let creds = *process.user.lock();
        crate::vfs::mount::umount(Some(&creds), &cwd_of(&process), &target)?;
        Ok(0)
    })();
    complete(task, result)
}

/// readdir(fd, buf, len): one variable-size record per call, 0 at end.
pub fn sys_readdir(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (fd, buf_addr, len) = {
            let frame = task.frame.lock();
            (frame.arg(0) as i32, frame.arg(1), frame.arg(2))
        };
        let file = file_of(&process, fd)?;
        let entry = match file.readdir()? {
            Some(entry) => entry,
            None => return Ok(0),
        };
        let record_len = 19 + entry.name.len() + 1;
        if len < record_len {
            return Err(Errno::EINVAL);
        }
        let mut record = vec![0u8; record_len];
        record[0..8].copy_from_slice(&(entry.id as u64).to_le_bytes());
        record[8..16].copy_from_slice(&(entry.offset as u64).to_le_bytes());
        record[16..18].copy_from_slice(&(record_len as u16).to_le_bytes());
        record[18] = entry.file_type as u8;
        record[19..19 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        uaccess::copy_to_user(&process.space(), buf_addr, &record)?;
        Ok(record_len as isize)
    })();
    complete(task, result)
}

/// chdir(path)
pub fn sys_chdir(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let path_addr = { task.frame.lock().arg(0) };
        let path = user_path(task, &process, path_addr)?;
        let creds = *process.user.lock();
        let cwd = cwd_of(&process);
        let abs = crate::vfs::path::absolute_path(&cwd, &path);
        let node = vfs::lookup_abs(&abs, Some(&creds))?;
        let is_dir = node.is_dir();
        crate::vfs::superblock::node_put(&node);
        if !is_dir {
            return Err(Errno::ENOTDIR);
        }
        process.resources.lock().cwd = abs;
        Ok(0)
    })();
    complete(task, result)
}

/// getcwd(buf, len) -> bytes copied including the terminator
pub fn sys_getcwd(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (buf_addr, len) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1))
        };
        let cwd = cwd_of(&process);
        if cwd.len() + 1 > len {
            return Err(Errno::EINVAL);
        }
        uaccess::copy_to_user(&process.space(), buf_addr, cwd.as_bytes())?;
        uaccess::copy_to_user(&process.space(), buf_addr + cwd.len(), &[0])?;
        Ok((cwd.len() + 1) as isize)
    })();
    complete(task, result)
}

/// pipe(fds[2])
pub fn sys_pipe(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let fds_addr = { task.frame.lock().arg(0) };
        let creds = *process.user.lock();
        let (read_file, write_file) = crate::vfs::pipe::create_pipe(creds.euid, creds.egid);
        let (read_fd, write_fd) = {
            let mut resources = process.resources.lock();
            let read_fd = resources.alloc_fd(read_file, FdFlags::empty());
            let write_fd = resources.alloc_fd(write_file, FdFlags::empty());
            (read_fd, write_fd)
        };
        let mut bytes = [0u8; 8];
        bytes[0..4].copy_from_slice(&read_fd.to_le_bytes());
        bytes[4..8].copy_from_slice(&write_fd.to_le_bytes());
        match uaccess::copy_to_user(&process.space(), fds_addr, &bytes) {
            Ok(()) => Ok(0),
            Err(err) => {
                let mut resources = process.resources.lock();
                let _ = resources.close(read_fd);
                let _ = resources.close(write_fd);
                Err(err)
            }
        }
    })();
    complete(task, result)
}

/// mknod(path, mode, dev)
pub fn sys_mknod(task: &Arc<Task>) -> SyscallReturn {
    let result = (|| {
        let process = process_of(task)?;
        let (path_addr, mode, rdev) = {
            let frame = task.frame.lock();
            (frame.arg(0), frame.arg(1) as u16, frame.arg(2))
        };
        let path = user_path(task, &process, path_addr)?;
        let creds = *process.user.lock();
        let file_type = FileType::from_mode(mode);
        if matches!(file_type, FileType::Char | FileType::Block) && creds.euid != 0 {
            return Err(Errno::EPERM);
        }
        let (umask, cwd) = {
            let resources = process.resources.lock();
            (resources.umask, resources.cwd.clone())
        };
        vfs::mknod(Some(&creds), umask, &cwd, &path, mode, rdev)?;
        Ok(0)
    })();
    complete(task, result)
}
