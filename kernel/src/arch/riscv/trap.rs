//! RISC-V trap handling.
//!
//! The assembly stub in `trap.S` saves all integer registers plus the trap
//! PC into the per-CPU exception frame and tail-calls into
//! [`arch_handle_irq`] or [`arch_handle_exception`] depending on the
//! interrupt bit of `scause`. The kernel itself runs with interrupts
//! globally masked, so interrupts only ever arrive from U-mode or from a
//! guest.

use riscv::csr::{Scause, Sstatus, SstatusFlags, Stval};

use super::vmm::{self, VmmTrapResult};
use super::Registers;
use crate::percpu::this_per_cpu;
use crate::syscall;
use crate::task;

/// Interrupt bit of `scause`.
pub const CAUSE_IRQ_FLAG: u64 = 1 << 63;

/// S-mode software interrupt (IPI).
pub const IRQ_S_SOFT: u64 = 1;
/// S-mode timer interrupt.
pub const IRQ_S_TIMER: u64 = 5;
/// S-mode external interrupt.
pub const IRQ_S_EXT: u64 = 9;

/// Instruction address misaligned.
pub const EXC_INST_MISALIGNED: u64 = 0;
/// Instruction access fault.
pub const EXC_INST_ACCESS: u64 = 1;
/// Illegal instruction.
pub const EXC_INST_ILLEGAL: u64 = 2;
/// Breakpoint.
pub const EXC_BREAKPOINT: u64 = 3;
/// Load address misaligned.
pub const EXC_LOAD_MISALIGNED: u64 = 4;
/// Load access fault.
pub const EXC_LOAD_ACCESS: u64 = 5;
/// AMO address misaligned.
pub const EXC_AMO_MISALIGNED: u64 = 6;
/// Store access fault.
pub const EXC_STORE_ACCESS: u64 = 7;
/// Environment call from U-mode.
pub const EXC_SYSCALL: u64 = 8;
/// Environment call from HS-mode.
pub const EXC_HYPERVISOR_SYSCALL: u64 = 9;
/// Environment call from VS-mode.
pub const EXC_SUPERVISOR_SYSCALL: u64 = 10;
/// Instruction page fault.
pub const EXC_INST_PAGE_FAULT: u64 = 12;
/// Load page fault.
pub const EXC_LOAD_PAGE_FAULT: u64 = 13;
/// Store page fault.
pub const EXC_STORE_PAGE_FAULT: u64 = 15;
/// Instruction guest-page fault.
pub const EXC_INST_GUEST_PAGE_FAULT: u64 = 20;
/// Load guest-page fault.
pub const EXC_LOAD_GUEST_PAGE_FAULT: u64 = 21;
/// Virtual instruction fault.
pub const EXC_VIRTUAL_INST_FAULT: u64 = 22;
/// Store guest-page fault.
pub const EXC_STORE_GUEST_PAGE_FAULT: u64 = 23;

/// Privileged register snapshot taken on exception entry.
#[derive(Debug, Clone, Copy)]
pub struct TrapContext {
    /// Trap cause.
    pub scause: u64,
    /// Status at trap time.
    pub sstatus: u64,
    /// Hypervisor status at trap time; only valid on the hypervisor path.
    pub hstatus: u64,
}

fn cause_str(cause: u64) -> &'static str {
    match cause {
        EXC_INST_MISALIGNED => "Instruction Address Misaligned",
        EXC_INST_ACCESS => "Instruction Access Fault",
        EXC_INST_ILLEGAL => "Illegal Instruction",
        EXC_BREAKPOINT => "Breakpoint",
        EXC_LOAD_MISALIGNED => "Load Address Misaligned",
        EXC_LOAD_ACCESS => "Load Access Fault",
        EXC_AMO_MISALIGNED => "AMO Address Misaligned",
        EXC_STORE_ACCESS => "Store Access Fault",
        EXC_SYSCALL => "Env Call From U-Mode",
        EXC_HYPERVISOR_SYSCALL => "Env Call From HS-Mode",
        EXC_SUPERVISOR_SYSCALL => "Env Call From VS-Mode",
        EXC_INST_PAGE_FAULT => "Instruction Pagefault",
        EXC_LOAD_PAGE_FAULT => "Load Pagefault",
        EXC_STORE_PAGE_FAULT => "Store Pagefault",
        EXC_INST_GUEST_PAGE_FAULT => "Inst Guest Pagefault",
        EXC_LOAD_GUEST_PAGE_FAULT => "Load Guest Pagefault",
        EXC_VIRTUAL_INST_FAULT => "Virtual Instruction Fault",
        EXC_STORE_GUEST_PAGE_FAULT => "Store Guest Pagefault",
        _ => "Unknown",
    }
}

/// Dumps a fatal exception's context to the console.
pub fn dump_exception(ctx: &TrapContext) {
    pr!(
        "FATAL: Exception on CPU {}. Cause: {} ({})",
        this_per_cpu().cpuid(),
        ctx.scause & !CAUSE_IRQ_FLAG,
        cause_str(ctx.scause)
    );
    pr!("STVAL: {:016x}", Stval::read_raw());
    if ctx.sstatus & SstatusFlags::SPP.bits() == 0 {
        if let Some(pid) = this_per_cpu().current_task() {
            pr!("Active PID: {}", pid);
        }
    }
}

fn handle_syscall() {
    // The trapping instruction is the 4-byte ecall; resume past it.
    task::with_current_regs(|regs| regs.pc += 4);

    let (no, args) = task::with_current_regs(|regs| {
        (
            regs.a7,
            [regs.a0, regs.a1, regs.a2, regs.a3, regs.a4, regs.a5],
        )
    });

    syscall::dispatch(no, &args);
}

/// Interrupt entry. Interrupts only trap while in U-mode or guest mode, so
/// a saved frame always describes the current task.
#[no_mangle]
extern "C" fn arch_handle_irq(regs: &mut Registers, cause: u64) {
    if this_per_cpu().idling() {
        // Idle polls pending interrupts itself, traps cannot happen there.
        panic!("IRQ trap while idling");
    }
    task::task_save(regs);

    match cause & !CAUSE_IRQ_FLAG {
        IRQ_S_SOFT => {
            super::ipi_clear();
            crate::smp::handle_ipi();
            task::prepare_user_return();
        }

        IRQ_S_TIMER => {
            crate::timer::handle_timer();
            task::prepare_user_return();
        }

        IRQ_S_EXT => {
            // Returns to the interrupted context; the next timer tick or
            // IPI picks up any events the handler queued.
            crate::drivers::irqchip::handle_irq();
        }

        irq => panic!("no handler for IRQ {}", irq),
    }
}

/// Exception entry.
#[no_mangle]
extern "C" fn arch_handle_exception(regs: &mut Registers, cause: u64) {
    let mut ctx = TrapContext {
        scause: cause,
        sstatus: Sstatus::read_raw(),
        hstatus: 0,
    };

    // A trap might originate from a guest rather than from this kernel's
    // user processes; the VMM claims those.
    if super::has_hypervisor() {
        match vmm::vmm_handle_trap(&mut ctx, regs) {
            VmmTrapResult::Handled => task::prepare_user_return(),
            VmmTrapResult::Error => {
                dump_exception(&ctx);
                regs.dump();
                panic!("unhandled guest trap");
            }
            VmmTrapResult::Forward => (),
        }
    }

    if ctx.sstatus & SstatusFlags::SPP.bits() != 0 {
        pr!("FATAL: Trap taken from Supervisor mode");
        dump_exception(&ctx);
        regs.dump();
        super::stack_dump();
        panic!("system halted");
    }

    task::task_save(regs);
    let stval = Stval::read_raw() as usize;

    match ctx.scause {
        EXC_INST_ILLEGAL | EXC_INST_PAGE_FAULT => {
            dump_exception(&ctx);
            task::exit_current(crate::errno::Errno::EFAULT.as_neg() as i64);
        }

        EXC_LOAD_PAGE_FAULT => task::task_handle_fault(stval, false),
        EXC_STORE_PAGE_FAULT => task::task_handle_fault(stval, true),

        EXC_SYSCALL => handle_syscall(),

        EXC_BREAKPOINT => {
            pr!("BP occurred @ PC: {:016x} - ignoring", regs.pc);
            task::with_current_regs(|regs| regs.pc += 4);
        }

        EXC_INST_ACCESS | EXC_LOAD_ACCESS | EXC_STORE_ACCESS | EXC_INST_MISALIGNED
        | EXC_LOAD_MISALIGNED | EXC_AMO_MISALIGNED => {
            pr!("faulting address: {:016x}", stval);
            dump_exception(&ctx);
            regs.dump();
            panic!("system halted");
        }

        _ => {
            dump_exception(&ctx);
            regs.dump();
            panic!("system halted");
        }
    }

    task::prepare_user_return();
}

/// Reads the cause of the last trap.
pub fn read_cause() -> u64 {
    Scause::read_raw()
}
