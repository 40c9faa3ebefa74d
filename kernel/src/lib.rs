//! Grinch is a small multicore operating-system kernel for 64-bit RISC-V
//! hardware. Thanks to the hypervisor extension it also runs as its own
//! guest: a grinch can host further grinches, each booting the same image.
//!
//! The kernel is developed and tested against QEMU's `virt` machine.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;

/// Utility macros.
#[macro_use]
mod macros;

pub mod arch;
pub mod bootparam;
pub mod config;
pub mod console;
pub mod drivers;
pub mod errno;
pub mod fs;
pub mod memtest;
pub mod mm;
pub mod panic;
pub mod percpu;
pub mod platform;
pub mod ringbuf;
pub mod smp;
pub mod syscall;
pub mod task;
pub mod timer;
pub mod ttp;
pub mod vmm;

use errno::Result;
use riscv::PhysAddr;

const GRINCH_ASCII_LOGO: &str = r#"
            _            _
           (_)          | |
  __ _ _ __ _ _ __   ___| |_
 / _` | '__| | '_ \ / __| '_ \
| (_| | |  | | | | | (__| | | |
 \__, |_|  |_|_| |_|\___|_| |_|
  __/ |
 |___/"#;

const GRINCH_ASCII_LOGO_VM: &str = r#"
            _            _  __  _____    __
           (_)          | | \ \/ /| |\  /| |
  __ _ _ __ _ _ __   ___| |_ \  / | | \/ | |
 / _` | '__| | '_ \ / __| '_\ \/  |_| \/ |_|
| (_| | |  | | | | | (__| | | |
 \__, |_|  |_|_| |_|\___|_| |_|
  __/ |
 |___/"#;

fn boot(hartid: usize, fdt_pa: PhysAddr) -> Result<()> {
    arch::guest_init();

    if arch::is_guest() {
        console::puts(GRINCH_ASCII_LOGO_VM);
    } else {
        console::puts(GRINCH_ASCII_LOGO);
    }
    console::puts("\n\n      -> Welcome to Grinch <-\n\n");

    mm::gfp::kernel_mem_init(arch::load_pa(), arch::kernel_image_pages())?;

    pr_info!("activating final paging");
    mm::paging::init()?;
    arch::trap_init();

    pr_info!("CPU ID: {}", hartid);

    platform::fdt_init(fdt_pa)?;
    if let Some(model) = platform::model() {
        pr_info!("model: {}", model);
    }

    bootparam::init(platform::bootargs());

    platform::memory_init()?;

    if let Some((base, size)) = platform::initrd_region() {
        fs::initrdfs::init(base, size)?;
    } else {
        pr_info!("no ramdisk found");
    }

    mm::kheap::init()?;

    platform::cpus_init()?;
    timer::init(platform::timebase_frequency())?;

    task::init();

    fs::init()?;

    if memtest::requested() {
        memtest::memtest()?;
    }

    drivers::init(platform::fdt())?;

    console::init(platform::stdout_path())?;

    match vmm::init() {
        Ok(()) => pr_info!("vmm: hypervisor ready"),
        Err(errno::Errno::ENOSYS) => (),
        Err(e) => return Err(e),
    }

    smp::set_online(hartid);
    smp::init()?;

    pr_info!("initialising userland");
    task::spawn_init()?;

    mm::paging::discard_init()?;

    task::sched_all();
    Ok(())
}

/// Kernel entry point on the boot hart, called from head.S with the MMU
/// running on the boot page tables.
#[no_mangle]
pub extern "C" fn cmain(hartid: usize, fdt_pa: u64) -> ! {
    arch::local_irq_disable();

    percpu::per_cpu(hartid).init(hartid, true);
    // SAFETY: the record was just initialized for this hart
    unsafe { arch::set_percpu(percpu::per_cpu(hartid) as *const _ as usize) };

    if let Err(e) = boot(hartid, PhysAddr::new(fdt_pa)) {
        pr!("End reached: {}", e);
        arch::shutdown(e.as_neg() as i32);
    }

    task::prepare_user_return()
}
