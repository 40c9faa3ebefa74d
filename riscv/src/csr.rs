//! Access to various control and status registers.
//!
//! Besides the usual supervisor CSRs, this module covers the hypervisor
//! extension registers (`h*`) and the shadowed virtual-supervisor registers
//! (`vs*`) that the VMM saves and restores around every guest exit.

#![allow(clippy::missing_safety_doc)]

use bitflags::bitflags;

macro_rules! csr {
    ($(#[$doc:meta])* $name:ident, $csr:literal) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        #[cfg(target_arch = "riscv64")]
        impl $name {
            /// Reads the raw content of the register.
            #[inline]
            pub fn read_raw() -> u64 {
                let value: u64;
                unsafe {
                    core::arch::asm!(concat!("csrr {}, ", $csr), out(reg) value, options(nomem));
                }
                value
            }

            /// Writes raw bits to the register.
            ///
            /// ## Safety
            ///
            /// It is possible to violate memory safety through CSR writes.
            #[inline]
            pub unsafe fn write_raw(v: u64) {
                core::arch::asm!(concat!("csrw ", $csr, ", {}"), in(reg) v, options(nostack));
            }

            /// Sets the given bits in the register.
            ///
            /// ## Safety
            ///
            /// It is possible to violate memory safety through CSR writes.
            #[inline]
            pub unsafe fn set_raw(v: u64) {
                core::arch::asm!(concat!("csrs ", $csr, ", {}"), in(reg) v, options(nostack));
            }

            /// Clears the given bits in the register.
            ///
            /// ## Safety
            ///
            /// It is possible to violate memory safety through CSR writes.
            #[inline]
            pub unsafe fn clear_raw(v: u64) {
                core::arch::asm!(concat!("csrc ", $csr, ", {}"), in(reg) v, options(nostack));
            }
        }

        // CSRs do not exist off-target; dependent crates still need to typecheck
        // on the host for unit testing.
        #[cfg(not(target_arch = "riscv64"))]
        impl $name {
            /// Reads the raw content of the register.
            pub fn read_raw() -> u64 {
                unimplemented!("CSR access on a non-RISC-V host")
            }

            /// Writes raw bits to the register.
            pub unsafe fn write_raw(_v: u64) {
                unimplemented!("CSR access on a non-RISC-V host")
            }

            /// Sets the given bits in the register.
            pub unsafe fn set_raw(_v: u64) {
                unimplemented!("CSR access on a non-RISC-V host")
            }

            /// Clears the given bits in the register.
            pub unsafe fn clear_raw(_v: u64) {
                unimplemented!("CSR access on a non-RISC-V host")
            }
        }
    };
}

bitflags! {
    /// Flags for the `sstatus` register.
    pub struct SstatusFlags: u64 {
        /// S-Mode interrupt enable.
        const SIE = 1 << 1;
        /// S-Mode previous interrupt enable.
        const SPIE = 1 << 5;
        /// S-Mode previous privilege level.
        const SPP = 1 << 8;
        /// Permit S-Mode user memory access.
        const SUM = 1 << 18;
        /// Make executable readable.
        const MXR = 1 << 19;
    }
}

bitflags! {
    /// Flags for the `sie`/`sip` registers.
    pub struct SiFlags: u64 {
        /// S-Mode software interrupt.
        const SSI = 1 << 1;
        /// S-Mode timer interrupt.
        const STI = 1 << 5;
        /// S-Mode external interrupt.
        const SEI = 1 << 9;
    }
}

bitflags! {
    /// Flags for the `hstatus` register.
    pub struct HstatusFlags: u64 {
        /// Trap virtual WFI after the timeout.
        const VTW = 1 << 21;
        /// Supervisor previous virtualization mode.
        const SPV = 1 << 7;
        /// Supervisor previous virtual privilege.
        const SPVP = 1 << 8;
    }
}

/// Value of the `hstatus.VSXL` field selecting XLEN 64 for VS-mode.
pub const HSTATUS_VSXL_64: u64 = 2 << 32;

bitflags! {
    /// Virtual interrupt bits of `hvip`/`hip`/`hie`.
    pub struct HviFlags: u64 {
        /// VS-level software interrupt.
        const VSSI = 1 << 2;
        /// VS-level timer interrupt.
        const VSTI = 1 << 6;
        /// VS-level external interrupt.
        const VSEI = 1 << 10;
    }
}

/// Bit of `hcounteren` granting the guest access to `time`.
pub const HCOUNTEREN_TM: u64 = 1 << 1;

csr!(
    /// The `sstatus` register keeps track of the processor's current operating state.
    Sstatus, "sstatus"
);
csr!(
    /// The `sie` register contains interrupt enable bits.
    Sie, "sie"
);
csr!(
    /// The `sip` register contains interrupt pending bits.
    Sip, "sip"
);
csr!(
    /// The `stvec` register holds the trap vector configuration.
    Stvec, "stvec"
);
csr!(
    /// The `sscratch` register holds a word for the trap handler's use.
    Sscratch, "sscratch"
);
csr!(
    /// The `sepc` register holds the PC of the trapping instruction.
    Sepc, "sepc"
);
csr!(
    /// The `scause` register identifies the cause of the last trap.
    Scause, "scause"
);
csr!(
    /// The `stval` register holds exception-specific information.
    Stval, "stval"
);
csr!(
    /// The `satp` register controls S-Mode address translation.
    Satp, "satp"
);
csr!(
    /// The `time` CSR exposes the real-time counter.
    Time, "time"
);

csr!(
    /// Hypervisor status register.
    Hstatus, "hstatus"
);
csr!(
    /// Hypervisor exception delegation register.
    Hedeleg, "hedeleg"
);
csr!(
    /// Hypervisor interrupt delegation register.
    Hideleg, "hideleg"
);
csr!(
    /// Hypervisor virtual interrupt pending register.
    Hvip, "hvip"
);
csr!(
    /// Hypervisor interrupt pending register.
    Hip, "hip"
);
csr!(
    /// Hypervisor interrupt enable register.
    Hie, "hie"
);
csr!(
    /// Hypervisor guest external interrupt enable register.
    Hgeie, "hgeie"
);
csr!(
    /// Hypervisor counter enable register.
    Hcounteren, "hcounteren"
);
csr!(
    /// Hypervisor environment configuration register.
    Henvcfg, "henvcfg"
);
csr!(
    /// Hypervisor guest address translation and protection register.
    Hgatp, "hgatp"
);
csr!(
    /// Hypervisor trap value register.
    Htval, "htval"
);

csr!(
    /// Shadowed VS-mode status register.
    Vsstatus, "vsstatus"
);
csr!(
    /// Shadowed VS-mode interrupt enable register.
    Vsie, "vsie"
);
csr!(
    /// Shadowed VS-mode trap vector register.
    Vstvec, "vstvec"
);
csr!(
    /// Shadowed VS-mode scratch register.
    Vsscratch, "vsscratch"
);
csr!(
    /// Shadowed VS-mode trap cause register.
    Vscause, "vscause"
);
csr!(
    /// Shadowed VS-mode trap value register.
    Vstval, "vstval"
);
csr!(
    /// Shadowed VS-mode address translation register.
    Vsatp, "vsatp"
);

impl Sstatus {
    /// Reads the content of `sstatus`.
    #[inline]
    pub fn read() -> SstatusFlags {
        SstatusFlags::from_bits_truncate(Self::read_raw())
    }

    /// Sets the specified flags in `sstatus`.
    #[inline]
    pub unsafe fn set(flags: SstatusFlags) {
        Self::set_raw(flags.bits());
    }

    /// Clears the specified flags from `sstatus`.
    #[inline]
    pub unsafe fn clear(flags: SstatusFlags) {
        Self::clear_raw(flags.bits());
    }
}

impl Sie {
    /// Reads the content of `sie`.
    #[inline]
    pub fn read() -> SiFlags {
        SiFlags::from_bits_truncate(Self::read_raw())
    }

    /// Sets the specified flags in `sie`.
    #[inline]
    pub fn set(flags: SiFlags) {
        unsafe { Self::set_raw(flags.bits()) };
    }

    /// Clears the specified flags from `sie`.
    #[inline]
    pub fn clear(flags: SiFlags) {
        unsafe { Self::clear_raw(flags.bits()) };
    }
}

impl Sip {
    /// Reads the pending interrupt bits.
    #[inline]
    pub fn read() -> SiFlags {
        SiFlags::from_bits_truncate(Self::read_raw())
    }

    /// Clears the specified pending bits from `sip`.
    #[inline]
    pub fn clear(flags: SiFlags) {
        unsafe { Self::clear_raw(flags.bits()) };
    }
}

/// Virtual addressing modes supported by RV64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SatpMode {
    /// `Bare` translation mode (`virt` == `phys`).
    Bare = 0,
    /// `Sv39` translation scheme (3-level page table).
    Sv39 = 8,
    /// `Sv48` translation scheme (4-level page table).
    Sv48 = 9,
}

impl Satp {
    /// Installs a new root page table with the given translation mode.
    ///
    /// ## Safety
    ///
    /// Changing the active page table invalidates every raw pointer derived
    /// from the previous address space.
    #[inline]
    pub unsafe fn write(mode: SatpMode, root_ppn: u64) {
        Self::write_raw(((mode as u64) << 60) | (root_ppn & 0xfff_ffff_ffff));
    }

    /// Reads the physical page number of the current root page table.
    #[inline]
    pub fn read_ppn() -> u64 {
        Self::read_raw() & 0xfff_ffff_ffff
    }
}

impl Hgatp {
    /// Installs a G-stage root page table with the given translation mode.
    ///
    /// ## Safety
    ///
    /// See [`Satp::write`].
    #[inline]
    pub unsafe fn write(mode: SatpMode, root_ppn: u64) {
        Self::write_raw(((mode as u64) << 60) | (root_ppn & 0xfff_ffff_ffff));
    }

    /// Disables G-stage translation.
    #[inline]
    pub unsafe fn disable() {
        Self::write_raw(0);
    }
}
