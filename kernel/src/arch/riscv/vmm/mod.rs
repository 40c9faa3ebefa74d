//! Hypervisor extension support: VS-mode state switching and guest exits.

mod ecall;

use riscv::csr::{
    Hcounteren, Hedeleg, Henvcfg, Hgatp, Hgeie, Hideleg, Hie, Hip, Hstatus, HstatusFlags,
    HviFlags, Hvip, SatpMode, Sstatus, SstatusFlags, Vsatp, Vscause, Vsie, Vsscratch, Vsstatus,
    Vstval, Vstvec, HCOUNTEREN_TM, HSTATUS_VSXL_64,
};
use riscv::instructions;

use super::trap::{
    TrapContext, EXC_AMO_MISALIGNED, EXC_BREAKPOINT, EXC_INST_ACCESS, EXC_INST_ILLEGAL,
    EXC_INST_MISALIGNED, EXC_INST_PAGE_FAULT, EXC_LOAD_ACCESS, EXC_LOAD_MISALIGNED,
    EXC_LOAD_PAGE_FAULT, EXC_STORE_ACCESS, EXC_STORE_PAGE_FAULT, EXC_SUPERVISOR_SYSCALL,
    EXC_SYSCALL, EXC_VIRTUAL_INST_FAULT,
};
use super::Registers;
use crate::errno::{Errno, Result};
use crate::percpu::this_per_cpu;
use crate::task;
use crate::vmm::VMachine;

/// Encoding of the `wfi` instruction.
const RISCV_INST_WFI: u32 = 0x1050_0073;

/// Exceptions delegated to the guest's own trap vector.
const HEDELEG: u64 = (1 << EXC_INST_MISALIGNED)
    | (1 << EXC_INST_ACCESS)
    | (1 << EXC_INST_ILLEGAL)
    | (1 << EXC_BREAKPOINT)
    | (1 << EXC_LOAD_MISALIGNED)
    | (1 << EXC_LOAD_ACCESS)
    | (1 << EXC_AMO_MISALIGNED)
    | (1 << EXC_STORE_ACCESS)
    | (1 << EXC_SYSCALL)
    | (1 << EXC_INST_PAGE_FAULT)
    | (1 << EXC_LOAD_PAGE_FAULT)
    | (1 << EXC_STORE_PAGE_FAULT);

/// Interrupts delegated to VS-mode.
const HIDELEG: u64 =
    HviFlags::VSSI.bits() | HviFlags::VSTI.bits() | HviFlags::VSEI.bits();

/// Outcome of offering a trap to the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmTrapResult {
    /// The trap did not originate from a guest; the host dispatcher owns it.
    Forward,
    /// The trap was a guest exit and has been handled.
    Handled,
    /// The trap was a guest exit the VMM cannot handle; fatal.
    Error,
}

/// Per-CPU hypervisor state initialization. These settings are identical
/// across all guests.
pub fn vmm_cpu_init() {
    // SAFETY: configuring hypervisor CSRs on a hart with the H-extension
    unsafe {
        Hedeleg::write_raw(HEDELEG);
        Hideleg::write_raw(HIDELEG);
        // No interrupts until a guest runs
        Hvip::write_raw(0);
        Hip::write_raw(0);
        Hie::write_raw(0);
        Hgeie::write_raw(0);
        // Allow guests to read the time counter directly
        Hcounteren::write_raw(HCOUNTEREN_TM);
        Henvcfg::write_raw(0);
    }
}

/// Snapshots the mutable VS-mode state of the active guest.
pub fn vmachine_save(vm: &mut VMachine) {
    vm.vregs.vsstatus = Vsstatus::read_raw();
    vm.vregs.vsie = Vsie::read_raw();
    vm.vregs.vstvec = Vstvec::read_raw();
    vm.vregs.vsscratch = Vsscratch::read_raw();
    vm.vregs.vscause = Vscause::read_raw();
    vm.vregs.vstval = Vstval::read_raw();
    vm.vregs.hvip = Hvip::read_raw();
    vm.vregs.vsatp = Vsatp::read_raw();

    vm.vregs.vs = Sstatus::read().contains(SstatusFlags::SPP);
}

/// Restores the VS-mode state of a guest about to run.
pub fn vmachine_restore(vm: &mut VMachine) {
    // SAFETY: restoring guest state; the host's own state is unaffected
    unsafe {
        if vm.vregs.vs {
            Sstatus::set(SstatusFlags::SPP);
        } else {
            Sstatus::clear(SstatusFlags::SPP);
        }

        if vm.timer_pending {
            vm.timer_pending = false;
            vm.vregs.hvip |= HviFlags::VSTI.bits();
        }

        Vsstatus::write_raw(vm.vregs.vsstatus);
        Vsie::write_raw(vm.vregs.vsie);
        Vstvec::write_raw(vm.vregs.vstvec);
        Vsscratch::write_raw(vm.vregs.vsscratch);
        Vscause::write_raw(vm.vregs.vscause);
        Vstval::write_raw(vm.vregs.vstval);
        Hvip::write_raw(vm.vregs.hvip);
        Vsatp::write_raw(vm.vregs.vsatp);
    }
}

/// Installs a guest's G-stage translation and arms VS-mode entry.
pub fn vmachine_activate(vm: &mut VMachine) {
    // SAFETY: the G-stage root covers the guest's whole physical space
    unsafe {
        Hgatp::write(SatpMode::Sv39, vm.gstage_root.ppn());
        instructions::sfence_vma_all();

        let hstatus =
            HSTATUS_VSXL_64 | HstatusFlags::VTW.bits() | HstatusFlags::SPV.bits();
        Hstatus::write_raw(hstatus);
    }
}

/// Tears down guest mode on this CPU when its guest dies.
pub fn vmachine_deactivate() {
    // SAFETY: disabling guest state
    unsafe {
        Hstatus::write_raw(0);
        Hgatp::disable();
    }
}

/// Loads an unsigned halfword from guest memory.
///
/// `hlvx.hu` can potentially fault. But if we end up here, we are decoding
/// an instruction the guest was able to execute, so it must be backed by
/// existing memory.
fn gmem_read16(addr: usize) -> u16 {
    // SAFETY: see above
    unsafe { instructions::hlvx_hu(addr) }
}

/// Decodes and emulates the instruction behind a virtual-instruction fault.
///
/// Only `wfi` is expected: with `hstatus.VTW` set, a guest's `wfi` traps
/// here. The guest PC must advance by exactly the instruction's size.
fn vmm_handle_inst() -> Result<()> {
    let (pc, hvip) = task::with_current(|task| {
        (task.regs.pc, task.vmachine().map(|vm| vm.vregs.hvip))
    });
    let hvip = hvip.ok_or(Errno::EINVAL)?;

    if pc & 0x1 != 0 {
        return Err(Errno::EINVAL);
    }

    let mut instruction = gmem_read16(pc) as u32;
    let is_compressed = instruction & 0x3 != 0x3;
    if !is_compressed {
        instruction |= (gmem_read16(pc + 2) as u32) << 16;
    }

    if instruction != RISCV_INST_WFI {
        return Err(Errno::ENOSYS);
    }

    // A guest waiting with interrupts pending continues immediately.
    if hvip == 0 {
        task::set_wfe_current();
    }
    this_per_cpu().set_schedule();

    task::with_current_regs(|regs| regs.pc += if is_compressed { 2 } else { 4 });

    Ok(())
}

/// Offers a trap to the VMM. Claims it iff it originated from a guest.
pub fn vmm_handle_trap(ctx: &mut TrapContext, regs: &mut Registers) -> VmmTrapResult {
    ctx.hstatus = Hstatus::read_raw();

    // SPV clear: the trap came from this kernel's own U-mode
    if ctx.hstatus & HstatusFlags::SPV.bits() == 0 {
        return VmmTrapResult::Forward;
    }

    // VU-mode traps that reach HS-mode are not expected with the current
    // delegation setup.
    if ctx.sstatus & SstatusFlags::SPP.bits() == 0 {
        panic!("guest trap from VU-mode");
    }

    // Saves general registers and the VS shadow state
    task::task_save(regs);

    let err = match ctx.scause {
        EXC_SUPERVISOR_SYSCALL => ecall::vmm_handle_ecall(),
        EXC_VIRTUAL_INST_FAULT => vmm_handle_inst(),
        _ => {
            pr!("unknown trap in hypervisor taken");
            Err(Errno::EINVAL)
        }
    };

    match err {
        Ok(()) => VmmTrapResult::Handled,
        Err(_) => {
            pr!("Hypervisor Context:");
            pr!(
                "SSTATUS: {:016x} SCAUSE: {:016x}",
                ctx.sstatus,
                ctx.scause
            );
            pr!(
                "HSTATUS: {:016x}  HTVAL: {:016x}",
                ctx.hstatus,
                riscv::csr::Htval::read_raw()
            );
            pr!("VSATP: {:016x}", Vsatp::read_raw());
            VmmTrapResult::Error
        }
    }
}
