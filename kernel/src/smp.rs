//! SMP coordination: CPU bitmaps, bring-up, cross-CPU calls.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::errno::Result;
use crate::percpu::{per_cpu, this_cpu_id, this_per_cpu};

/// Harts present according to the device tree.
static CPUS_AVAILABLE: AtomicU64 = AtomicU64::new(0);

/// Harts that completed bring-up.
static CPUS_ONLINE: AtomicU64 = AtomicU64::new(0);

/// Records a hart the device tree declares usable.
pub fn set_available(cpu: usize) {
    CPUS_AVAILABLE.fetch_or(1 << cpu, Ordering::Relaxed);
}

/// Marks a hart online. Runs on the hart itself, last in its bring-up.
pub fn set_online(cpu: usize) {
    CPUS_ONLINE.fetch_or(1 << cpu, Ordering::Release);
}

/// Whether a hart finished bring-up.
pub fn cpu_online(cpu: usize) -> bool {
    CPUS_ONLINE.load(Ordering::Acquire) & (1 << cpu) != 0
}

/// Bitmask of online harts.
pub fn online_mask() -> u64 {
    CPUS_ONLINE.load(Ordering::Acquire)
}

/// Number of online harts.
pub fn online_count() -> usize {
    online_mask().count_ones() as usize
}

/// Iterates the ids of all online harts.
pub fn online_cpus() -> impl Iterator<Item = usize> {
    let mask = online_mask();
    (0..64).filter(move |cpu| mask & (1 << cpu) != 0)
}

/// IPI arrival: runs a pending remote call and processes events.
pub fn handle_ipi() {
    crate::panic::check_remote_panic();

    let tpcpu = this_per_cpu();
    tpcpu.remote_call.run_pending();
    tpcpu.set_handle_events();
}

/// Executes `func(arg)` on `cpu` and waits for its completion.
pub fn smp_call(cpu: usize, func: fn(usize), arg: usize) {
    if cpu == this_cpu_id() {
        func(arg);
        return;
    }

    let target = per_cpu(cpu);
    let _guard = target.remote_call.lock.lock();

    target.remote_call.arm(func, arg);
    arch::ipi_send(cpu);

    while target.remote_call.is_active() {
        arch::cpu_relax();
    }
}

/// Executes `func(arg)` on every online hart, the caller's included.
pub fn on_each_cpu(func: fn(usize), arg: usize) {
    for cpu in online_cpus() {
        smp_call(cpu, func, arg);
    }
}

/// Boots all secondary harts and waits until each reports in.
pub fn init() -> Result<()> {
    let boot = this_cpu_id();
    let available = CPUS_AVAILABLE.load(Ordering::Relaxed);

    for cpu in (0..64).filter(|cpu| available & (1 << cpu) != 0) {
        if cpu == boot {
            continue;
        }

        arch::boot_cpu(cpu)?;

        while !cpu_online(cpu) {
            arch::cpu_relax();
        }
        pr_info!("CPU {} online!", cpu);
    }

    Ok(())
}
