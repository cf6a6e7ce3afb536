//! Memory management.
//!
//! Initialization order is fixed: the page allocator comes up first from
//! the boot memory ranges, the kernel heap draws pages from it, and only
//! then can address spaces and the page reference table be used.

pub mod address_space;
pub mod heap;
pub mod page;
pub mod pagealloc;
pub mod pageref;
pub mod pagetable;

pub use address_space::AddressSpace;
pub use page::{PhysAddr, VirtAddr, PAGE_SIZE};

/// Top of every user stack.
pub const USER_STACK_TOP: VirtAddr = 1 << 38;
/// Fixed user stack size (512 KiB).
pub const USER_STACK_SIZE: usize = 1 << 19;

/// Bring up the allocators from the usable RAM ranges left over by boot.
pub fn init(ranges: &[(PhysAddr, usize)]) {
    pagealloc::init(ranges);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use spin::Once;

    static POOL: Once<()> = Once::new();

    /// Hand the global page allocator a leaked host buffer, once.
    pub fn ensure_page_pool() {
        POOL.call_once(|| {
            let size = 16 * 1024 * 1024;
            let buf = alloc::vec![0u8; size + PAGE_SIZE].leak();
            let base = page::page_align_up(buf.as_mut_ptr() as usize);
            pagealloc::init(&[(base, size)]);
        });
    }
}
