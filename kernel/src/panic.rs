//! Panic support.
//!
//! A panicking CPU prints the failure with a call trace straight to the
//! firmware console (bypassing the console lock), signals all other CPUs
//! to stop, and halts. When running as a guest, the host is asked to
//! destroy this VM instead, so a guest failure never takes the machine
//! down.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

struct EmergencyWriter;

impl Write for EmergencyWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.bytes() {
            sbi::Console::putchar(c);
        }
        Ok(())
    }
}

/// Halts this CPU if another one declared a panic.
pub fn check_remote_panic() {
    if PANIC_IN_PROGRESS.load(Ordering::Acquire) {
        arch::halt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::local_irq_disable();

    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        // A second CPU racing into panic just stops
        arch::halt();
    }

    let _ = writeln!(EmergencyWriter, "Kernel panic: {}", info);
    arch::stack_dump();

    // Take the other CPUs down with us
    arch::ipi_broadcast();

    if arch::is_guest() {
        let _ = sbi::Grinch::vmquit(usize::MAX);
    }

    let _ = writeln!(EmergencyWriter, "Halting!");
    arch::halt();
}
