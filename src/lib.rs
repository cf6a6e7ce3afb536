//! osmium_kernel: a multi-tasking kernel core for 64-bit RISC-V.
//!
//! The crate holds the concurrent runtime of the kernel: tasks and the
//! preemptive scheduler across harts, virtual memory with copy-on-write
//! address spaces, the VFS with node caching and mount composition, and
//! the MINIX3 storage engine underneath it. Boot assembly, trap vectors
//! and concrete MMIO drivers link in from outside through the interfaces
//! in `trap`, `dev` and `platform`.
//!
//! Bring-up order is fixed: page allocator, kernel heap (implicit in the
//! allocator), primary hart, PLIC handler registry, VFS root mount,
//! devices, then the init process.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod dev;
pub mod error;
pub mod fs;
pub mod logging;
pub mod mm;
pub mod panic;
pub mod platform;
pub mod process;
pub mod syscall;
pub mod task;
pub mod time;
pub mod trap;
pub mod vfs;

#[cfg(test)]
mod tests;

pub use error::{Errno, Result};

#[cfg(all(target_arch = "riscv64", not(test)))]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

/// First-stage initialization on the boot hart: memory, the hart frame
/// and the console.
///
/// `ram` lists the usable memory ranges left after the kernel image and
/// the device tree's reserved regions are carved out.
pub fn kernel_init(
    boot_hart_id: usize,
    ram: &[(mm::PhysAddr, usize)],
    console: Option<alloc::sync::Arc<dyn dev::CharDevice>>,
) -> alloc::sync::Arc<task::hart::Hart> {
    mm::init(ram);
    let hart = task::hart::setup_hart(boot_hart_id);
    if let Some(console) = console {
        let id = dev::register_char_device(console.clone());
        logging::set_console(console);
        crate::debug!("console registered as char device {}", id);
    }
    crate::info!("hart {} up, memory initialized", boot_hart_id);
    hart
}

/// Mount the root filesystem from a registered block device and start
/// the init process from `/bin/init` on it.
pub fn start_init(root_device: usize) -> Result<()> {
    use alloc::string::String;
    use vfs::file::{FileFlags, VfsFile};

    let device = dev::block_device(root_device).ok_or(Errno::ENOENT)?;
    let node = vfs::blkfile::anonymous_block_node(device);
    let device_file = VfsFile::new(node, String::new(), FileFlags::READ | FileFlags::WRITE);
    let sb = fs::minix::create_minix_superblock(device_file)?;
    vfs::mount::mount_root(sb)?;
    crate::info!("root filesystem mounted");

    let init = process::Process::new_user(None)?;
    let init_task = task::Task::new(task::DEFAULT_PRIORITY);
    init_task.attach_stack(task::KERNEL_STACK_SIZE);
    *init_task.process.lock() = Some(init.clone());
    *init.task.lock() = alloc::sync::Arc::downgrade(&init_task);
    process::exec::execve(
        &init_task,
        &init,
        "/bin/init",
        &[String::from("/bin/init")],
        &[],
    )?;
    init_task.set_state(task::TaskState::Enquable);
    task::sched::enqueue_task(init_task);
    crate::info!("init process started as pid {}", init.pid);
    Ok(())
}
