//! Per-process address spaces.
//!
//! An address space is a page table plus the heap break. Cloning shares
//! every owned leaf frame copy-on-write; the first write through either
//! side faults and resolves to a private frame. The zero page is special
//! throughout: never refcounted, never freed, and a write to it always
//! materializes a fresh zeroed frame.

use super::page::{page_align_down, PhysAddr, VirtAddr, PAGE_SIZE};
use super::pagealloc::{self, zero_page};
use super::pageref;
use super::pagetable::{self, Pte, PteFlags};
use crate::error::{Errno, Result};
use spin::Mutex;

bitflags::bitflags! {
    /// Mapping permissions requested by the loader and syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerms: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl MapPerms {
    fn pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::USER | PteFlags::OWNED | PteFlags::ACCESSED | PteFlags::DIRTY;
        if self.contains(MapPerms::READ) {
            flags |= PteFlags::READ;
        }
        if self.contains(MapPerms::WRITE) {
            flags |= PteFlags::WRITE;
        }
        if self.contains(MapPerms::EXEC) {
            flags |= PteFlags::EXEC;
        }
        if !flags.is_leaf() {
            // At least some permission is required for a leaf mapping.
            flags |= PteFlags::READ;
        }
        flags
    }
}

struct SpaceInner {
    root: PhysAddr,
    start_brk: VirtAddr,
    brk: VirtAddr,
}

pub struct AddressSpace {
    inner: Mutex<SpaceInner>,
}

/// Release one leaf frame during unmap or teardown.
fn release_leaf(pte: Pte) {
    if !pte.flags().contains(PteFlags::OWNED) {
        return;
    }
    let pa = pte.phys_addr();
    if pa == zero_page() {
        return;
    }
    if pageref::has_other_references(pa) {
        pageref::remove_reference(pa);
    } else {
        pagealloc::dealloc_page(pa);
    }
}

impl AddressSpace {
    pub fn new() -> Result<Self> {
        let root = pagetable::alloc_table()?;
        Ok(Self {
            inner: Mutex::new(SpaceInner {
                root,
                start_brk: 0,
                brk: 0,
            }),
        })
    }

    pub fn root(&self) -> PhysAddr {
        self.inner.lock().root
    }

    pub fn satp(&self, asid: usize) -> usize {
        pagetable::satp_for(asid, self.root())
    }

    pub fn map_page(&self, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> Result<()> {
        let inner = self.inner.lock();
        pagetable::map_page(inner.root, va, pa, flags)
    }

    /// Map `[addr, addr+memsz)` with `perms`: fresh frames over the file
    /// image span, shared zero pages (copy-on-write when writable) beyond.
    pub fn allocate_range(
        &self,
        addr: VirtAddr,
        filesz: usize,
        memsz: usize,
        perms: MapPerms,
    ) -> Result<()> {
        let inner = self.inner.lock();
        let flags = perms.pte_flags();
        let mut va = page_align_down(addr);
        while va < addr + filesz {
            match pagetable::with_entry(inner.root, va, |pte| pte.insert_flags(flags)) {
                Some(()) => {}
                None => {
                    let page = pagealloc::zalloc_page().ok_or(Errno::ENOMEM)?;
                    pagetable::map_page(inner.root, va, page, flags)?;
                }
            }
            va += PAGE_SIZE;
        }
        while va < addr + memsz {
            let mapped = pagetable::with_entry(inner.root, va, |pte| {
                pte.insert_flags(flags);
                if pte.flags().contains(PteFlags::COPY) {
                    pte.remove_flags(PteFlags::WRITE);
                }
            });
            if mapped.is_none() {
                if flags.contains(PteFlags::WRITE) {
                    let cow = (flags | PteFlags::COPY) - PteFlags::WRITE;
                    pagetable::map_page(inner.root, va, zero_page(), cow)?;
                } else {
                    pagetable::map_page(inner.root, va, zero_page(), flags)?;
                }
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Resolve a copy-on-write fault at `va`. Returns false for any fault
    /// that is not a write to a live COPY entry.
    pub fn handle_page_fault(&self, va: VirtAddr) -> bool {
        let inner = self.inner.lock();
        self.resolve_cow(&inner, va)
    }

    fn resolve_cow(&self, inner: &SpaceInner, va: VirtAddr) -> bool {
        let resolved = pagetable::with_entry(inner.root, va, |pte| {
            if !pte.flags().contains(PteFlags::COPY) {
                return false;
            }
            let old = pte.phys_addr();
            if old == zero_page() {
                match pagealloc::zalloc_page() {
                    Some(page) => {
                        pte.set_phys_addr(page);
                    }
                    None => return false,
                }
            } else if pageref::has_other_references(old) {
                match pagealloc::alloc_page() {
                    Some(page) => {
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                old as *const u8,
                                page as *mut u8,
                                PAGE_SIZE,
                            );
                        }
                        pageref::remove_reference(old);
                        pte.set_phys_addr(page);
                    }
                    None => return false,
                }
            }
            // Sole holder: reuse the frame in place.
            pte.insert_flags(PteFlags::WRITE);
            pte.remove_flags(PteFlags::COPY);
            true
        });
        resolved.unwrap_or(false)
    }

    /// Translate `va`, transparently resolving COW on writes. `permissive`
    /// bypasses permission checks (kernel writes into pages the user may
    /// not touch) but never bypasses copy-on-write.
    pub fn virt_to_phys(&self, va: VirtAddr, write: bool, permissive: bool) -> Option<PhysAddr> {
        let inner = self.inner.lock();
        let pte = pagetable::translate(inner.root, va)?;
        let flags = pte.flags();
        if write {
            if flags.contains(PteFlags::WRITE) {
                Some(pte.phys_addr() + va % PAGE_SIZE)
            } else if flags.contains(PteFlags::COPY) {
                if self.resolve_cow(&inner, va) {
                    pagetable::translate(inner.root, va)
                        .map(|pte| pte.phys_addr() + va % PAGE_SIZE)
                } else {
                    None
                }
            } else if permissive {
                Some(pte.phys_addr() + va % PAGE_SIZE)
            } else {
                None
            }
        } else if flags.contains(PteFlags::READ) || permissive {
            Some(pte.phys_addr() + va % PAGE_SIZE)
        } else {
            None
        }
    }

    /// Unmap `va`, freeing the frame only if this table owned it and no
    /// other table still references it.
    pub fn unmap_and_free(&self, va: VirtAddr) {
        let inner = self.inner.lock();
        pagetable::with_entry(inner.root, va, |pte| {
            release_leaf(*pte);
            *pte = Pte::EMPTY;
        });
    }

    /// Clone for fork: table structure is deep-copied, owned frames are
    /// shared with both sides downgraded to copy-on-write.
    pub fn clone_space(&self) -> Result<AddressSpace> {
        let inner = self.inner.lock();
        let root = pagetable::clone_table(inner.root, &mut |src, dst| {
            let flags = src.flags();
            if !flags.contains(PteFlags::OWNED) || src.phys_addr() == zero_page() {
                return;
            }
            pageref::add_reference(src.phys_addr());
            if flags.contains(PteFlags::WRITE) {
                src.remove_flags(PteFlags::WRITE);
                src.insert_flags(PteFlags::COPY);
                dst.remove_flags(PteFlags::WRITE);
                dst.insert_flags(PteFlags::COPY);
            }
        })?;
        Ok(AddressSpace {
            inner: Mutex::new(SpaceInner {
                root,
                start_brk: inner.start_brk,
                brk: inner.brk,
            }),
        })
    }

    /// Change permissions on a mapped range. Writable requests on COPY
    /// pages keep the page copy-on-write; the fault path grants WRITE.
    pub fn protect(&self, addr: VirtAddr, len: usize, perms: MapPerms) -> Result<()> {
        let inner = self.inner.lock();
        let mut va = page_align_down(addr);
        while va < addr + len {
            let found = pagetable::with_entry(inner.root, va, |pte| {
                pte.remove_flags(PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC);
                let mut flags = PteFlags::empty();
                if perms.contains(MapPerms::READ) {
                    flags |= PteFlags::READ;
                }
                if perms.contains(MapPerms::EXEC) {
                    flags |= PteFlags::EXEC;
                }
                if perms.contains(MapPerms::WRITE) && !pte.flags().contains(PteFlags::COPY) {
                    flags |= PteFlags::WRITE;
                }
                pte.insert_flags(flags);
            });
            if found.is_none() {
                return Err(Errno::ENOMEM);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn brk(&self) -> VirtAddr {
        self.inner.lock().brk
    }

    pub fn set_start_brk(&self, addr: VirtAddr) {
        let mut inner = self.inner.lock();
        inner.start_brk = addr;
        inner.brk = addr;
    }

    /// Highest mapped page plus one page; used after loading a program.
    pub fn find_start_brk(&self) -> VirtAddr {
        let inner = self.inner.lock();
        let mut last = 0;
        pagetable::for_each_leaf(inner.root, &mut |va, _| {
            if va > last {
                last = va;
            }
        });
        last + PAGE_SIZE
    }

    /// Grow or shrink the heap break; freshly exposed pages are zero-page
    /// copy-on-write mappings.
    pub fn sbrk(&self, increment: isize) -> Result<VirtAddr> {
        let mut inner = self.inner.lock();
        let old_brk = inner.brk;
        if increment == 0 {
            return Ok(old_brk);
        }
        if increment > 0 {
            let new_brk = old_brk.checked_add(increment as usize).ok_or(Errno::ENOMEM)?;
            let flags = (PteFlags::READ
                | PteFlags::USER
                | PteFlags::OWNED
                | PteFlags::ACCESSED
                | PteFlags::DIRTY
                | PteFlags::COPY)
                - PteFlags::WRITE;
            let mut va = crate::mm::page::page_align_up(old_brk);
            while va < new_brk {
                if pagetable::translate(inner.root, va).is_none() {
                    pagetable::map_page(inner.root, va, zero_page(), flags)?;
                }
                va += PAGE_SIZE;
            }
            inner.brk = new_brk;
        } else {
            let decrement = (-increment) as usize;
            let new_brk = old_brk.saturating_sub(decrement).max(inner.start_brk);
            let mut va = crate::mm::page::page_align_up(new_brk);
            let end = crate::mm::page::page_align_up(old_brk);
            while va < end {
                pagetable::with_entry(inner.root, va, |pte| {
                    release_leaf(*pte);
                    *pte = Pte::EMPTY;
                });
                va += PAGE_SIZE;
            }
            inner.brk = new_brk;
        }
        Ok(inner.brk)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        pagetable::free_table(inner.root, &mut release_leaf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_support::ensure_page_pool;

    fn write_byte(space: &AddressSpace, va: VirtAddr, value: u8) {
        let pa = space.virt_to_phys(va, true, false).expect("writable");
        unsafe { *(pa as *mut u8) = value };
    }

    fn read_byte(space: &AddressSpace, va: VirtAddr) -> u8 {
        let pa = space.virt_to_phys(va, false, false).expect("readable");
        unsafe { *(pa as *const u8) }
    }

    #[test]
    fn zero_page_cow_materializes_fresh_frame() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(0x10000, 0, PAGE_SIZE, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        // Backed by the zero page until written.
        let pte = pagetable::translate(space.root(), 0x10000).unwrap();
        assert_eq!(pte.phys_addr(), zero_page());
        assert!(pte.flags().contains(PteFlags::COPY));
        assert!(!pte.flags().contains(PteFlags::WRITE));

        write_byte(&space, 0x10042, 7);
        assert_eq!(read_byte(&space, 0x10042), 7);
        let pte = pagetable::translate(space.root(), 0x10000).unwrap();
        assert!(pte.phys_addr() != zero_page());
        assert!(pte.flags().contains(PteFlags::WRITE));
        assert!(!pte.flags().contains(PteFlags::COPY));
    }

    #[test]
    fn clone_shares_frames_copy_on_write() {
        ensure_page_pool();
        let parent = AddressSpace::new().unwrap();
        parent
            .allocate_range(0x20000, PAGE_SIZE, PAGE_SIZE, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        write_byte(&parent, 0x20000, 42);

        let child = parent.clone_space().unwrap();
        // Both sides are COPY and not WRITE after the clone.
        for space in [&parent, &child] {
            let pte = pagetable::translate(space.root(), 0x20000).unwrap();
            assert!(pte.flags().contains(PteFlags::COPY));
            assert!(!pte.flags().contains(PteFlags::WRITE));
        }
        assert_eq!(read_byte(&child, 0x20000), 42);

        // Writing in the child must not alter the parent's view.
        write_byte(&child, 0x20000, 99);
        assert_eq!(read_byte(&child, 0x20000), 99);
        assert_eq!(read_byte(&parent, 0x20000), 42);

        // The parent now reuses its frame in place on its own fault.
        write_byte(&parent, 0x20000, 13);
        assert_eq!(read_byte(&parent, 0x20000), 13);
        assert_eq!(read_byte(&child, 0x20000), 99);
    }

    #[test]
    fn permissive_bypasses_permissions_but_not_cow() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(0x30000, PAGE_SIZE, PAGE_SIZE, MapPerms::READ)
            .unwrap();
        assert!(space.virt_to_phys(0x30000, true, false).is_none());
        assert!(space.virt_to_phys(0x30000, true, true).is_some());
        assert!(space.virt_to_phys(0x31000, true, false).is_none());
    }

    #[test]
    fn sbrk_grows_and_shrinks() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space.set_start_brk(0x40000);
        let brk = space.sbrk(3 * PAGE_SIZE as isize).unwrap();
        assert_eq!(brk, 0x40000 + 3 * PAGE_SIZE);
        write_byte(&space, 0x40000, 5);
        assert_eq!(read_byte(&space, 0x40000), 5);
        let brk = space.sbrk(-(3 * PAGE_SIZE as isize)).unwrap();
        assert_eq!(brk, 0x40000);
    }

    #[test]
    fn protect_removes_write() {
        ensure_page_pool();
        let space = AddressSpace::new().unwrap();
        space
            .allocate_range(0x50000, PAGE_SIZE, PAGE_SIZE, MapPerms::READ | MapPerms::WRITE)
            .unwrap();
        write_byte(&space, 0x50000, 1);
        space.protect(0x50000, PAGE_SIZE, MapPerms::READ).unwrap();
        assert!(space.virt_to_phys(0x50000, true, false).is_none());
        assert_eq!(read_byte(&space, 0x50000), 1);
    }
}
