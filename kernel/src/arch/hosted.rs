//! Host-side stand-in for the architecture layer.
//!
//! Provides the same surface as the RISC-V implementation so that the
//! architecture-independent parts of the kernel compile and unit-test on
//! the development machine. Anything that would touch real hardware
//! panics; tests exercise pure logic only.

#![allow(unused_variables)]

use riscv::{PhysAddr, VirtAddr};

use super::Registers;
use crate::errno::Result;

/// Guest-exit handling, unavailable off-target.
pub mod vmm {
    use crate::vmm::VMachine;

    /// See the RISC-V implementation.
    pub fn vmm_cpu_init() {}

    /// See the RISC-V implementation.
    pub fn vmachine_save(vm: &mut VMachine) {
        unimplemented!("guest state access on a non-RISC-V host")
    }

    /// See the RISC-V implementation.
    pub fn vmachine_restore(vm: &mut VMachine) {
        unimplemented!("guest state access on a non-RISC-V host")
    }

    /// See the RISC-V implementation.
    pub fn vmachine_activate(vm: &mut VMachine) {
        unimplemented!("guest state access on a non-RISC-V host")
    }

    /// See the RISC-V implementation.
    pub fn vmachine_deactivate() {}
}

/// Reads the per-CPU base pointer.
pub fn percpu_ptr() -> usize {
    unimplemented!("per-CPU state on a non-RISC-V host")
}

/// Installs the per-CPU base pointer.
///
/// # Safety
///
/// Never implemented off-target.
pub unsafe fn set_percpu(ptr: usize) {
    unimplemented!("per-CPU state on a non-RISC-V host")
}

/// Disables interrupts.
pub fn local_irq_disable() {}

/// Enables interrupts.
pub fn local_irq_enable() {}

/// Installs the trap vector.
pub fn trap_init() {}

/// Idles until an interrupt is pending.
pub fn do_idle() {
    unimplemented!("idle on a non-RISC-V host")
}

/// Spin-wait hint.
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Halts the current hart.
pub fn halt() -> ! {
    unimplemented!("halt on a non-RISC-V host")
}

/// Shuts down the machine.
pub fn shutdown(code: i32) -> ! {
    unimplemented!("shutdown on a non-RISC-V host")
}

/// Sends an IPI to one hart.
pub fn ipi_send(cpu: usize) {}

/// Sends an IPI to all other online harts.
pub fn ipi_broadcast() {}

/// Acknowledges a pending IPI.
pub fn ipi_clear() {}

/// Invalidates the local TLB.
pub fn flush_tlb_local() {}

/// Invalidates one local translation.
pub fn flush_tlb_page(va: VirtAddr) {}

/// Invalidates kernel translations on all harts.
pub fn flush_tlb_all() {}

/// Synchronizes the instruction stream.
pub fn icache_flush() {}

/// Reads the architectural timer.
pub fn timer_read_ticks() -> u64 {
    0
}

/// Programs the next timer interrupt.
pub fn timer_set_raw(ticks: u64) {}

/// Installs a root page table.
///
/// # Safety
///
/// Never implemented off-target.
pub unsafe fn enable_paging(root: PhysAddr) {
    unimplemented!("paging control on a non-RISC-V host")
}

/// Makes a process address space current.
pub fn process_activate(process_root: PhysAddr) {
    unimplemented!("paging control on a non-RISC-V host")
}

/// Returns to the interrupted context.
pub fn return_to_user(frame: *mut Registers) -> ! {
    unimplemented!("context switch on a non-RISC-V host")
}

/// Probes for a grinch host.
pub fn guest_init() {}

/// Whether this kernel runs as a guest.
pub fn is_guest() -> bool {
    false
}

/// This instance's VM id.
pub fn grinch_id() -> u32 {
    0
}

/// Records hypervisor availability.
pub fn set_has_hypervisor(has: bool) {}

/// Whether the hypervisor path is available.
pub fn has_hypervisor() -> bool {
    false
}

/// Prints a call trace.
pub fn stack_dump() {}

/// Starts a secondary hart.
pub fn boot_cpu(cpu: usize) -> Result<()> {
    Err(crate::errno::Errno::ENODEV)
}

/// Size of the loaded kernel image in pages.
pub fn kernel_image_pages() -> usize {
    64
}

/// Physical load address of the kernel image.
pub fn load_pa() -> PhysAddr {
    PhysAddr::new(0x8020_0000)
}

/// The text section range.
pub fn section_text() -> (VirtAddr, usize) {
    (VirtAddr::new(crate::config::VMGRINCH_BASE), 0)
}

/// The read-only data section range.
pub fn section_rodata() -> (VirtAddr, usize) {
    (VirtAddr::new(crate::config::VMGRINCH_BASE), 0)
}

/// The writable data section range.
pub fn section_rw_data() -> (VirtAddr, usize) {
    (VirtAddr::new(crate::config::VMGRINCH_BASE), 0)
}

/// The boot-only section range.
pub fn section_init() -> (VirtAddr, usize) {
    (VirtAddr::new(crate::config::VMGRINCH_BASE), 0)
}
