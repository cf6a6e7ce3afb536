//! execve: replace a process image.
//!
//! Loads the ELF, builds the argument and environment vectors on a fresh
//! user stack, swaps the address space, closes close-on-exec descriptors
//! and honors setuid/setgid bits on the binary.

pub mod elf;

use super::{FdFlags, Process};
use crate::error::{Errno, Result};
use crate::mm::address_space::MapPerms;
use crate::mm::{AddressSpace, USER_STACK_SIZE, USER_STACK_TOP};
use crate::syscall::uaccess;
use crate::task::{Reg, Task};
use crate::vfs::file::{file_put, OpenFlags};
use crate::vfs::node::{MODE_SETGID, MODE_SETUID};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

fn push_bytes(space: &AddressSpace, sp: &mut usize, bytes: &[u8]) -> Result<()> {
    *sp -= bytes.len();
    uaccess::copy_to_user(space, *sp, bytes)
}

/// Push NUL-terminated strings, then the NULL-terminated pointer array;
/// returns the array's address.
fn push_string_array(
    space: &AddressSpace,
    sp: &mut usize,
    strings: &[String],
) -> Result<usize> {
    let mut addresses = Vec::with_capacity(strings.len());
    for string in strings.iter().rev() {
        push_bytes(space, sp, &[0])?;
        push_bytes(space, sp, string.as_bytes())?;
        addresses.push(*sp);
    }
    addresses.reverse();
    *sp &= !7;
    push_bytes(space, sp, &0u64.to_le_bytes())?;
    for address in addresses.iter().rev() {
        push_bytes(space, sp, &(*address as u64).to_le_bytes())?;
    }
    Ok(*sp)
}

pub fn execve(
    task: &Arc<Task>,
    process: &Arc<Process>,
    path: &str,
    argv: &[String],
    envp: &[String],
) -> Result<()> {
    let (creds, cwd) = {
        let creds = *process.user.lock();
        let cwd = process.resources.lock().cwd.clone();
        (creds, cwd)
    };
    let file = crate::vfs::open(
        Some(&creds),
        0,
        &cwd,
        path,
        OpenFlags::EXECUTE | OpenFlags::REGULAR,
        0,
    )?;
    let stat = file.stat();

    let space = AddressSpace::new()?;
    let entry = match elf::load_program(&space, &file) {
        Ok(entry) => entry,
        Err(err) => {
            file_put(&file);
            return Err(err);
        }
    };
    file_put(&file);

    let start_brk = space.find_start_brk();
    space.set_start_brk(start_brk);
    space.allocate_range(
        USER_STACK_TOP - USER_STACK_SIZE,
        0,
        USER_STACK_SIZE,
        MapPerms::READ | MapPerms::WRITE,
    )?;

    let mut sp = USER_STACK_TOP;
    let envp_addr = push_string_array(&space, &mut sp, envp)?;
    let argv_addr = push_string_array(&space, &mut sp, argv)?;

    if stat.mode & MODE_SETUID != 0 {
        process.user.lock().euid = stat.uid;
    }
    if stat.mode & MODE_SETGID != 0 {
        process.user.lock().egid = stat.gid;
    }

    // Drop close-on-exec descriptors.
    {
        let mut resources = process.resources.lock();
        let cloexec: Vec<i32> = resources
            .fds
            .iter()
            .filter(|(_, entry)| entry.flags.contains(FdFlags::CLOEXEC))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in cloexec {
            let _ = resources.close(fd);
        }
    }

    let space = Arc::new(space);
    process.set_space(space.clone());

    {
        let mut frame = task.frame.lock();
        frame.regs = [0; 31];
        frame.fregs = [0.0; 32];
        frame.pc = entry;
        frame.satp = space.satp(process.pid as usize);
        frame.set(Reg::Sp, argv_addr);
        frame.set(Reg::A0, argv.len());
        frame.set(Reg::A1, argv_addr);
        frame.set(Reg::A2, envp_addr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::ensure_page_pool;

    #[test]
    fn string_arrays_land_on_the_stack() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(0x70000, 0, 0x4000, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        let mut sp = 0x74000;
        let strings = alloc::vec![String::from("first"), String::from("second arg")];
        let array = push_string_array(&space, &mut sp, &strings).unwrap();
        // Array: two pointers then NULL.
        let p0 = uaccess::read_user_usize(&space, array).unwrap();
        let p1 = uaccess::read_user_usize(&space, array + 8).unwrap();
        let nil = uaccess::read_user_usize(&space, array + 16).unwrap();
        assert_eq!(nil, 0);
        assert_eq!(uaccess::read_user_cstr(&space, p0, 64).unwrap(), "first");
        assert_eq!(uaccess::read_user_cstr(&space, p1, 64).unwrap(), "second arg");
    }
}
