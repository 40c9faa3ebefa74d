//! RISC-V architecture support.

pub mod smp;
pub mod trap;
pub mod vmm;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use riscv::{
    csr::{Satp, SatpMode, Sie, SiFlags, Sstatus, SstatusFlags, Stvec},
    instructions,
    paging::PAGE_SIZE,
    PhysAddr, VirtAddr,
};

use crate::config::VMGRINCH_BASE;
use crate::errno::{Errno, Result};
use crate::percpu::this_per_cpu;
use crate::smp::online_mask;

use super::Registers;

extern "C" {
    // Defined in trap.S
    fn trap_entry();
    fn user_return(frame: *mut Registers) -> !;

    // Linker script symbols
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __rw_data_start: u8;
    static __bss_end: u8;
    static __init_start: u8;
    static __init_end: u8;
    static __end: u8;

    // Filled in by head.S before the MMU goes live
    static __boot_load_pa: u64;
}

static IS_GUEST: AtomicBool = AtomicBool::new(false);
static GRINCH_ID: AtomicU32 = AtomicU32::new(0);
static HAS_HYPERVISOR: AtomicBool = AtomicBool::new(false);

/// Address of a linker symbol.
fn sym(addr: &'static u8) -> usize {
    addr as *const u8 as usize
}

/// One linkage section as a virtual address range.
pub fn section_text() -> (VirtAddr, usize) {
    // SAFETY: linker-provided symbols
    unsafe { (VirtAddr::new(sym(&__text_start)), sym(&__text_end) - sym(&__text_start)) }
}

/// The read-only data section.
pub fn section_rodata() -> (VirtAddr, usize) {
    // SAFETY: linker-provided symbols
    unsafe {
        (
            VirtAddr::new(sym(&__rodata_start)),
            sym(&__rodata_end) - sym(&__rodata_start),
        )
    }
}

/// Writable data and bss.
pub fn section_rw_data() -> (VirtAddr, usize) {
    // SAFETY: linker-provided symbols
    unsafe {
        (
            VirtAddr::new(sym(&__rw_data_start)),
            sym(&__bss_end) - sym(&__rw_data_start),
        )
    }
}

/// Boot-only text and data, released by `paging_discard_init`.
pub fn section_init() -> (VirtAddr, usize) {
    // SAFETY: linker-provided symbols
    unsafe {
        (
            VirtAddr::new(sym(&__init_start)),
            sym(&__init_end) - sym(&__init_start),
        )
    }
}

/// Size of the loaded kernel image in pages.
pub fn kernel_image_pages() -> usize {
    // SAFETY: linker-provided symbols
    let bytes = unsafe { sym(&__end) - VMGRINCH_BASE };
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Physical address the kernel image was loaded at.
pub fn load_pa() -> PhysAddr {
    // SAFETY: written once by head.S before Rust runs
    PhysAddr::new(unsafe { core::ptr::read_volatile(&__boot_load_pa) })
}

/// Reads the per-CPU base pointer of the executing hart.
#[inline]
pub fn percpu_ptr() -> usize {
    let tp: usize;
    // SAFETY: reading tp has no side effects
    unsafe { core::arch::asm!("mv {}, tp", out(reg) tp, options(nomem, nostack)) };
    tp
}

/// Installs the per-CPU base pointer on the executing hart.
///
/// # Safety
///
/// `ptr` must point to this hart's `PerCpu` for the lifetime of the kernel.
#[inline]
pub unsafe fn set_percpu(ptr: usize) {
    core::arch::asm!("mv tp, {}", in(reg) ptr, options(nomem, nostack));
}

/// Disables interrupts for the current context.
pub fn local_irq_disable() {
    // SAFETY: masking interrupts cannot break memory safety
    unsafe { Sstatus::clear(SstatusFlags::SIE) };
}

/// Enables interrupts for the current context.
pub fn local_irq_enable() {
    // SAFETY: the trap vector is installed before the first enable
    unsafe { Sstatus::set(SstatusFlags::SIE) };
}

/// Configures the trap vector and interrupt enables of this hart.
pub fn trap_init() {
    // SAFETY: trap_entry is the assembly stub built for this purpose
    unsafe { Stvec::write_raw(trap_entry as *const () as u64) };
    Sie::set(SiFlags::SSI | SiFlags::STI | SiFlags::SEI);
}

/// Enters architectural idle until the next interrupt becomes pending.
///
/// The kernel runs with interrupts globally masked; `wfi` still wakes on a
/// pending enabled interrupt, which is then polled from `sip` and handled
/// synchronously.
pub fn do_idle() {
    // SAFETY: a full fence has no safety requirements
    unsafe { core::arch::asm!("fence iorw, iorw", options(nostack)) };
    instructions::wfi();

    crate::panic::check_remote_panic();

    let pending = riscv::csr::Sip::read();

    if pending.contains(SiFlags::SSI) {
        ipi_clear();
        crate::smp::handle_ipi();
    }

    if pending.contains(SiFlags::STI) {
        crate::timer::handle_timer();
    }

    if pending.contains(SiFlags::SEI) {
        crate::drivers::irqchip::handle_irq();
    }
}

/// Spin-wait hint.
pub fn cpu_relax() {
    instructions::cpu_relax();
}

/// Halts execution on the current hart forever.
pub fn halt() -> ! {
    local_irq_disable();
    Sie::clear(SiFlags::SSI | SiFlags::STI | SiFlags::SEI);

    loop {
        instructions::wfi();
    }
}

/// Shuts down the machine. When running as a guest, asks the host to
/// destroy this VM instead.
pub fn shutdown(code: i32) -> ! {
    if is_guest() {
        let _ = sbi::Grinch::vmquit(code as usize);
    }
    let _ = sbi::SystemReset::shutdown();
    halt();
}

/// Sends an IPI to one hart.
pub fn ipi_send(cpu: usize) {
    let _ = sbi::Ipi::send_ipi(1 << cpu, 0);
}

/// Sends an IPI to every online hart except the caller.
pub fn ipi_broadcast() {
    let mask = online_mask() & !(1 << this_per_cpu().cpuid());
    if mask != 0 {
        let _ = sbi::Ipi::send_ipi(mask as usize, 0);
    }
}

/// Clears the pending software interrupt of this hart.
pub fn ipi_clear() {
    riscv::csr::Sip::clear(SiFlags::SSI);
}

/// Invalidates this hart's TLB.
pub fn flush_tlb_local() {
    instructions::sfence_vma_all();
}

/// Invalidates one page translation on this hart.
pub fn flush_tlb_page(va: VirtAddr) {
    instructions::sfence_vma(va.data());
}

/// Invalidates kernel translations on all online harts.
pub fn flush_tlb_all() {
    instructions::sfence_vma_all();

    let mask = online_mask() & !(1 << this_per_cpu().cpuid());
    if mask != 0 {
        let _ = sbi::Rfence::remote_sfence_vma(mask as usize, 0, 0, usize::MAX);
    }
}

/// Synchronizes the instruction stream of this hart.
pub fn icache_flush() {
    instructions::fence_i();
}

/// Reads the free-running architectural timer.
pub fn timer_read_ticks() -> u64 {
    riscv::csr::Time::read_raw()
}

/// Programs the next timer interrupt, in absolute ticks.
pub fn timer_set_raw(ticks: u64) {
    let _ = sbi::Timer::set_timer(ticks);
}

/// Installs a root page table on this hart.
///
/// # Safety
///
/// The table must map the executing kernel.
pub unsafe fn enable_paging(root: PhysAddr) {
    Satp::write(SatpMode::Sv39, root.ppn());
    instructions::sfence_vma_all();
}

/// Makes a process address space current: its lower half is copied into
/// this CPU's root table, and any guest mode state is torn down.
pub fn process_activate(process_root: PhysAddr) {
    let tpcpu = this_per_cpu();

    riscv::paging::copy_root_range(
        &crate::mm::gfp::GfpFrames,
        crate::mm::paging::host_paging(),
        tpcpu.root_table_pa(),
        process_root,
        0..crate::mm::paging::user_root_entries(),
    );

    flush_tlb_local();
    icache_flush();

    // Next sret must land in U-mode, with no hypervisor activation
    // SAFETY: adjusting the return privilege level
    unsafe {
        Sstatus::clear(SstatusFlags::SPP);
        if has_hypervisor() {
            riscv::csr::Hgatp::disable();
            riscv::csr::Hstatus::write_raw(0);
        }
    }
}

/// Returns to the interrupted context described by `frame`. Never returns.
pub fn return_to_user(frame: *mut Registers) -> ! {
    // SAFETY: the frame is the per-CPU exception frame, valid by
    // construction
    unsafe { user_return(frame) }
}

/// Probes for a grinch host. Must run before the first console output.
pub fn guest_init() {
    if let Ok(id) = sbi::Grinch::present() {
        IS_GUEST.store(true, Ordering::Relaxed);
        GRINCH_ID.store(id as u32, Ordering::Relaxed);
    }
}

/// Whether this kernel runs as a guest of another grinch.
pub fn is_guest() -> bool {
    IS_GUEST.load(Ordering::Relaxed)
}

/// This instance's id; 0 for bare-metal, the VM id when running as a guest.
pub fn grinch_id() -> u32 {
    GRINCH_ID.load(Ordering::Relaxed)
}

/// Records whether every hart advertised the hypervisor extension.
pub fn set_has_hypervisor(has: bool) {
    HAS_HYPERVISOR.store(has, Ordering::Relaxed);
}

/// Whether the hypervisor path is available.
pub fn has_hypervisor() -> bool {
    HAS_HYPERVISOR.load(Ordering::Relaxed)
}

/// Walks the frame-pointer chain of the current stack and prints every
/// return address. Requires frame pointers, which the kernel build keeps.
pub fn stack_dump() {
    let mut fp: usize;
    // SAFETY: reading s0 has no side effects
    unsafe { core::arch::asm!("mv {}, s0", out(reg) fp, options(nomem, nostack)) };

    pr!("Call trace:");
    for depth in 0..32 {
        if fp == 0 || fp % core::mem::size_of::<usize>() != 0 {
            break;
        }

        // The standard RISC-V frame layout stores ra at fp - 8 and the
        // previous fp at fp - 16.
        let ra = fp.wrapping_sub(8) as *const usize;
        let prev = fp.wrapping_sub(16) as *const usize;

        let (text, text_size) = section_text();
        if fp <= text.data() || fp >= VMGRINCH_BASE + crate::config::GRINCH_SIZE {
            break;
        }

        // SAFETY: bounds-checked against the kernel area above
        let ra = unsafe { ra.read() };
        if ra < text.data() || ra >= text.data() + text_size {
            break;
        }

        pr!("  #{:02}: {:016x}", depth, ra);
        // SAFETY: as above
        fp = unsafe { prev.read() };
    }
}

/// Starts a secondary hart through SBI HSM.
pub fn boot_cpu(cpu: usize) -> Result<()> {
    smp::start_hart(cpu).map_err(|_| Errno::ENODEV)
}
