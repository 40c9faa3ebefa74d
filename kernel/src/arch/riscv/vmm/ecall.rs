//! SBI emulation for guests.
//!
//! Guests issue `ecall` from VS-mode; a minimal SBI v2.0 is answered in
//! place: the Base extension, the TIME extension (backed by the host timer
//! queue), the legacy console putchar, and the Grinch hypercall extension.

use sbi::{base, grinch, time, Extension, SpecVersion};

use crate::console;
use crate::errno::{Errno, Result};
use crate::percpu::this_per_cpu;
use crate::task;
use crate::timer;

const SBI_SUCCESS: isize = 0;
const SBI_ERR_NOT_SUPPORTED: isize = -2;

struct SbiRet {
    error: isize,
    value: isize,
}

impl SbiRet {
    fn ok(value: isize) -> Self {
        SbiRet {
            error: SBI_SUCCESS,
            value,
        }
    }

    fn not_supported() -> Self {
        SbiRet {
            error: SBI_ERR_NOT_SUPPORTED,
            value: 0,
        }
    }
}

fn probe_extension(eid: usize) -> SbiRet {
    let known = eid == Extension::Timer as usize
        || eid == Extension::Rfence as usize
        || eid == Extension::Ipi as usize
        || eid == Extension::Hsm as usize
        || eid == Extension::Grinch as usize;

    SbiRet::ok(known as isize)
}

fn handle_base(fid: usize, a0: usize) -> SbiRet {
    match fid {
        base::GET_SPEC_VERSION => SbiRet::ok(SpecVersion { major: 2, minor: 0 }.to_raw() as isize),
        base::GET_IMP_ID => SbiRet::ok(1),
        base::GET_IMP_VERSION => SbiRet::ok(0x10003),
        base::PROBE_EXT => probe_extension(a0),
        base::GET_MVENDORID | base::GET_MARCHID | base::GET_MIMPID => SbiRet::ok(0),
        _ => {
            pr!("Base FID {:x} not implemented", fid);
            SbiRet::not_supported()
        }
    }
}

fn handle_time(fid: usize, a0: usize) -> SbiRet {
    match fid {
        time::SET_TIMER => {
            // Programming the timer acknowledges the pending virtual tick
            task::with_current(|task| {
                if let Some(vm) = task.vmachine_mut() {
                    vm.vregs.hvip &= !riscv::csr::HviFlags::VSTI.bits();
                }
            });

            if a0 != usize::MAX {
                task::sleep_current_until(timer::ticks_to_wall_ns(a0 as u64));
            } else {
                task::cancel_timer_current();
            }
            SbiRet::ok(0)
        }
        _ => {
            pr!("Time FID {:x} not implemented", fid);
            SbiRet::not_supported()
        }
    }
}

/// Handles the Grinch hypercall extension. Returns `None` when the guest
/// was destroyed and no return value must be written.
fn handle_grinch(fid: usize, a0: usize) -> Option<SbiRet> {
    match fid {
        grinch::PRESENT => Some(SbiRet::ok(task::current_pid() as isize)),

        grinch::YIELD => {
            this_per_cpu().set_schedule();
            Some(SbiRet::ok(0))
        }

        grinch::BP => Some(SbiRet::ok(42)),

        grinch::VMQUIT => {
            task::exit_current(a0 as i64);
            None
        }

        _ => {
            pr!("unknown Grinch hypercall {:x}", fid);
            Some(SbiRet::not_supported())
        }
    }
}

/// Emulates one `ecall` issued by the active guest.
pub fn vmm_handle_ecall() -> Result<()> {
    let (eid, fid, a0) = task::with_current_regs(|regs| {
        regs.pc += 4;
        (regs.a7, regs.a6, regs.a0)
    });

    let ret = match eid {
        e if e == Extension::LegacyPutChar as usize => {
            console::putc(a0 as u8);
            SbiRet::ok(0)
        }

        e if e == Extension::Base as usize => handle_base(fid, a0),

        e if e == Extension::Timer as usize => handle_time(fid, a0),

        e if e == Extension::Grinch as usize => match handle_grinch(fid, a0) {
            Some(ret) => ret,
            // The vCPU is gone; nothing to report back to
            None => return Ok(()),
        },

        _ => {
            pr!("extension {:#x} not implemented", eid);
            return Err(Errno::ENOSYS);
        }
    };

    task::with_current_regs(|regs| {
        regs.a0 = ret.error as usize;
        regs.a1 = ret.value as usize;
    });

    Ok(())
}
