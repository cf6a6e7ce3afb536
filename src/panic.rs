//! Kernel panic path.
//!
//! Exactly one hart wins the panic lock, tells the others to halt over
//! the software interrupt, emits a single diagnostic line and parks
//! itself.

use core::sync::atomic::{AtomicBool, Ordering};

static PANICKED: AtomicBool = AtomicBool::new(false);

/// Stop executing on this hart.
pub fn halt_this_hart() {
    #[cfg(target_arch = "riscv64")]
    loop {
        riscv::asm::wfi();
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        // Host builds return so tests can observe the state.
    }
}

pub fn has_panicked() -> bool {
    PANICKED.load(Ordering::Acquire)
}

pub fn kernel_panic(args: core::fmt::Arguments) {
    if PANICKED.swap(true, Ordering::AcqRel) {
        // Another hart got here first; just stop.
        halt_this_hart();
        return;
    }
    let own = crate::task::hart::current_hart_index();
    for index in 0..crate::task::hart::hart_count() {
        if index != own {
            if let Some(hart) = crate::task::hart::hart_by_index(index) {
                crate::task::ipi::send_message(hart.id, crate::task::ipi::HartMessage::Panic);
            }
        }
    }
    crate::error!("kernel panic: {}", args);
    halt_this_hart();
}

#[cfg(all(target_arch = "riscv64", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel_panic(format_args!("{}", info));
    loop {
        riscv::asm::wfi();
    }
}
