//! Special RISC-V instructions.

#[cfg(target_arch = "riscv64")]
use core::arch::asm;

/// Halts the hart until the next interrupt arrives.
#[inline]
pub fn wfi() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("wfi", options(nostack, nomem));
    }
}

/// Spin-loop hint for busy-wait loops.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Invalidates all TLB entries of the current hart.
#[inline]
pub fn sfence_vma_all() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("sfence.vma", options(nostack));
    }
}

/// Invalidates the TLB entries covering `vaddr` on the current hart.
#[inline]
pub fn sfence_vma(vaddr: usize) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("sfence.vma {}, zero", in(reg) vaddr, options(nostack));
    }
    #[cfg(not(target_arch = "riscv64"))]
    let _ = vaddr;
}

/// Synchronizes the instruction stream after code modifications.
#[inline]
pub fn fence_i() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        asm!("fence.i", options(nostack));
    }
}

/// Loads an unsigned halfword from guest memory as if executed in VS-mode
/// (`hlvx.hu`), used to decode trapping guest instructions.
///
/// # Safety
///
/// The address must be executable guest memory backed by an existing G-stage
/// mapping, otherwise the access itself faults.
#[cfg(target_arch = "riscv64")]
#[inline]
pub unsafe fn hlvx_hu(addr: usize) -> u16 {
    let mem: u64;
    // hlvx.hu has no assembler mnemonic everywhere yet, encode it raw
    asm!(".insn r 0x73, 0x4, 0x32, {0}, {1}, x3",
         out(reg) mem, in(reg) addr, options(nostack));
    mem as u16
}
