//! Secondary hart bring-up.
//!
//! Secondaries are released through SBI HSM `HART_START` and enter the
//! assembly trampoline in bare mode. The boot CPU prepares everything a
//! secondary needs - its root page table (kernel half shared, trampoline
//! identity-mapped), stack and `tp` - in a hand-off block the trampoline
//! reads by physical address.

use riscv::csr::SatpMode;
use riscv::paging::GIGA_PAGE_SIZE;
use riscv::paging::MemFlags;
use riscv::{PhysAddr, VirtAddr};
use spin::Mutex;

use crate::config::VMGRINCH_BASE;
use crate::mm::gfp::v2p;
use crate::mm::paging as kpaging;
use crate::percpu::{per_cpu, this_per_cpu};
use crate::{smp, task, timer};

extern "C" {
    // head.S, .init.text
    fn secondary_trampoline();
}

/// Hand-off block read by the trampoline, physically addressed.
#[repr(C)]
struct SecondaryBoot {
    satp: u64,
    sp: u64,
    tp: u64,
    entry: u64,
}

/// One secondary boots at a time; the slot is reused.
static SECONDARY_BOOT: Mutex<SecondaryBoot> = Mutex::new(SecondaryBoot {
    satp: 0,
    sp: 0,
    tp: 0,
    entry: 0,
});

/// Identity-mapped gigapage covering the trampoline.
fn trampoline_giga() -> PhysAddr {
    super::load_pa().align_down(GIGA_PAGE_SIZE as u64)
}

/// Physical address of a kernel-image symbol.
fn image_v2p(va: usize) -> PhysAddr {
    super::load_pa() + (va - VMGRINCH_BASE) as u64
}

/// Prepares and starts one secondary hart.
pub fn start_hart(cpu: usize) -> sbi::Result<()> {
    let tpcpu = per_cpu(cpu);
    tpcpu.init(cpu, false);

    // The new root shares the kernel half and identity-maps the gigapage
    // holding the trampoline for the satp switch.
    let root = tpcpu.root_table_pa();
    kpaging::share_kernel_half(root, this_per_cpu().root_table_pa());

    let giga = trampoline_giga();
    kpaging::map_range_on(
        root,
        VirtAddr::new(giga.data() as usize),
        giga,
        GIGA_PAGE_SIZE,
        MemFlags::RW | MemFlags::EXEC,
    )
    .map_err(|_| sbi::SbiError::Failed)?;

    let mut boot = SECONDARY_BOOT.lock();
    boot.satp = ((SatpMode::Sv39 as u64) << 60) | root.ppn();
    boot.sp = tpcpu.exception_frame() as u64;
    boot.tp = tpcpu as *const _ as u64;
    boot.entry = secondary_entry as *const () as u64;
    let boot_pa = v2p(VirtAddr::new(&*boot as *const SecondaryBoot as usize));

    let trampoline_pa = image_v2p(secondary_trampoline as *const () as usize);

    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
    sbi::Hsm::hart_start(cpu, trampoline_pa.data() as usize, boot_pa.data() as usize)?;

    // The slot must stay stable until the secondary reports in.
    while !smp::cpu_online(cpu) {
        super::cpu_relax();
    }
    drop(boot);

    Ok(())
}

/// Rust entry of a secondary hart; MMU is on, `sp`/`tp` are live.
#[no_mangle]
extern "C" fn secondary_entry() -> ! {
    super::trap_init();

    // The trampoline's identity window served its purpose
    let giga = trampoline_giga();
    let _ = kpaging::unmap_range_on(
        this_per_cpu().root_table_pa(),
        VirtAddr::new(giga.data() as usize),
        GIGA_PAGE_SIZE,
    );
    super::flush_tlb_local();

    if super::has_hypervisor() {
        super::vmm::vmm_cpu_init();
    }

    timer::timer_cpu_init();
    smp::set_online(this_per_cpu().cpuid());

    pr_info!("CPU {} up", this_per_cpu().cpuid());

    task::prepare_user_return()
}
