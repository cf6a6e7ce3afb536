//! User memory access.
//!
//! Every user pointer is translated page by page through the owning
//! address space; copies may span page boundaries. Writes go through the
//! normal permission path (and so resolve copy-on-write); the permissive
//! variant lets the kernel fill pages the user itself cannot write, as
//! the loader does for read-only segments.

use crate::error::{Errno, Result};
use crate::mm::{AddressSpace, PAGE_SIZE};
use alloc::string::String;
use alloc::vec::Vec;

/// Longest string accepted from user space.
pub const MAX_USER_STRING: usize = 4096;

fn copy_out(space: &AddressSpace, addr: usize, bytes: &[u8], permissive: bool) -> Result<()> {
    let mut done = 0;
    while done < bytes.len() {
        let va = addr + done;
        let chunk = (bytes.len() - done).min(PAGE_SIZE - va % PAGE_SIZE);
        let pa = space.virt_to_phys(va, true, permissive).ok_or(Errno::EFAULT)?;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[done..].as_ptr(), pa as *mut u8, chunk);
        }
        done += chunk;
    }
    Ok(())
}

pub fn copy_to_user(space: &AddressSpace, addr: usize, bytes: &[u8]) -> Result<()> {
    copy_out(space, addr, bytes, false)
}

/// Kernel-initiated write that bypasses the user's permission bits (but
/// never copy-on-write).
pub fn copy_to_user_permissive(space: &AddressSpace, addr: usize, bytes: &[u8]) -> Result<()> {
    copy_out(space, addr, bytes, true)
}

pub fn copy_from_user(space: &AddressSpace, addr: usize, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let va = addr + done;
        let chunk = (buf.len() - done).min(PAGE_SIZE - va % PAGE_SIZE);
        let pa = space.virt_to_phys(va, false, false).ok_or(Errno::EFAULT)?;
        unsafe {
            core::ptr::copy_nonoverlapping(pa as *const u8, buf[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Read a NUL-terminated string; `max` is a cap, not a guarantee.
pub fn read_user_cstr(space: &AddressSpace, addr: usize, max: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut position = addr;
    while bytes.len() < max {
        let chunk = (max - bytes.len()).min(PAGE_SIZE - position % PAGE_SIZE);
        let pa = space
            .virt_to_phys(position, false, false)
            .ok_or(Errno::EFAULT)?;
        let page = unsafe { core::slice::from_raw_parts(pa as *const u8, chunk) };
        match page.iter().position(|&b| b == 0) {
            Some(end) => {
                bytes.extend_from_slice(&page[..end]);
                return String::from_utf8(bytes).map_err(|_| Errno::EINVAL);
            }
            None => bytes.extend_from_slice(page),
        }
        position += chunk;
    }
    Err(Errno::EINVAL)
}

pub fn read_user_usize(space: &AddressSpace, addr: usize) -> Result<usize> {
    let mut bytes = [0u8; 8];
    copy_from_user(space, addr, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes) as usize)
}

pub fn write_user_usize(space: &AddressSpace, addr: usize, value: usize) -> Result<()> {
    copy_to_user(space, addr, &(value as u64).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address_space::MapPerms;
    use crate::mm::test_support::ensure_page_pool;

    fn space_with_page(va: usize) -> AddressSpace {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(va, PAGE_SIZE, PAGE_SIZE, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        space
    }

    #[test]
    fn copy_round_trip_across_pages() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(0x7000, 2 * PAGE_SIZE, 2 * PAGE_SIZE, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        // Straddles the 0x8000 page boundary.
        copy_to_user(&space, 0x7f80, &payload).unwrap();
        let mut back = alloc::vec![0u8; 300];
        copy_from_user(&space, 0x7f80, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unmapped_addresses_fault() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        assert_eq!(
            copy_to_user(&space, 0x4000, b"x"),
            Err(Errno::EFAULT)
        );
        let mut buf = [0u8; 1];
        assert_eq!(copy_from_user(&space, 0x4000, &mut buf), Err(Errno::EFAULT));
    }

    #[test]
    fn cstr_reads_up_to_nul() {
        let space = space_with_page(0x9000);
        copy_to_user(&space, 0x9000, b"hello\0trailing").unwrap();
        let s = read_user_cstr(&space, 0x9000, 64).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn cstr_respects_the_cap() {
        let space = space_with_page(0xa000);
        copy_to_user(&space, 0xa000, b"abcdefgh").unwrap();
        assert_eq!(read_user_cstr(&space, 0xa000, 4), Err(Errno::EINVAL));
    }
}
