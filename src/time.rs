// Kernel time base.
//
// All timestamps and deadlines are absolute nanoseconds. On riscv64 the
// `time` CSR is scaled by the timebase frequency handed in by the boot
// glue; elsewhere a monotonic counter stands in so the core logic stays
// testable.

use core::sync::atomic::{AtomicU64, Ordering};

/// Absolute time in nanoseconds.
pub type Time = u64;

pub const NANOS_PER_SEC: Time = 1_000_000_000;
pub const CLOCKS_PER_SEC: Time = NANOS_PER_SEC;

/// QEMU virt default; overridden from the device tree `clock-frequency`.
static TIMEBASE_FREQ: AtomicU64 = AtomicU64::new(10_000_000);

pub fn set_timebase_frequency(hz: u64) {
    if hz != 0 {
        TIMEBASE_FREQ.store(hz, Ordering::Relaxed);
    }
}

#[cfg(target_arch = "riscv64")]
pub fn get_time() -> Time {
    let cycles = riscv::register::time::read64();
    let freq = TIMEBASE_FREQ.load(Ordering::Relaxed);
    cycles / freq * NANOS_PER_SEC + cycles % freq * NANOS_PER_SEC / freq
}

#[cfg(not(target_arch = "riscv64"))]
pub fn get_time() -> Time {
    // Monotonic stand-in for host builds and unit tests.
    static FAKE_CLOCK: AtomicU64 = AtomicU64::new(1);
    FAKE_CLOCK.fetch_add(1000, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic() {
        let a = get_time();
        let b = get_time();
        assert!(b > a);
    }
}
