//! Timer plumbing.
//!
//! Wall time is nanoseconds since boot, derived from the free-running
//! architectural counter and the FDT `timebase-frequency`. Each CPU tracks
//! its next deadline: the earlier of its periodic tick (`timer_hz=`, 0
//! disables it) and the head of the global timer queue, and programs the
//! SBI timer accordingly.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch;
use crate::errno::Result;
use crate::percpu::this_per_cpu;

const NSEC_PER_SEC: u64 = 1_000_000_000;

static TIMER_HZ: AtomicU32 = AtomicU32::new(50);
static TIMEBASE_FREQUENCY: AtomicU64 = AtomicU64::new(10_000_000);
static WALL_BASE: AtomicU64 = AtomicU64::new(0);

pub(crate) fn parse_timer_hz(arg: Option<&str>) {
    if let Some(hz) = arg.and_then(|a| a.parse().ok()) {
        if hz <= 100_000 {
            TIMER_HZ.store(hz, Ordering::Relaxed);
        } else {
            pr_warn!("timer: invalid frequency {}", hz);
        }
    }
}

/// The hart timer frequency in ticks per second.
pub fn timebase_frequency() -> u64 {
    TIMEBASE_FREQUENCY.load(Ordering::Relaxed)
}

fn ticks_to_ns(ticks: u64) -> u64 {
    (ticks as u128 * NSEC_PER_SEC as u128 / timebase_frequency() as u128) as u64
}

fn ns_to_ticks(ns: u64) -> u64 {
    (ns as u128 * timebase_frequency() as u128 / NSEC_PER_SEC as u128) as u64
}

/// Converts an absolute tick count (as guests use it) into wall time.
pub fn ticks_to_wall_ns(ticks: u64) -> u64 {
    ticks_to_ns(ticks).saturating_sub(WALL_BASE.load(Ordering::Relaxed))
}

/// Nanoseconds since boot.
pub fn get_wall_ns() -> u64 {
    let base = WALL_BASE.load(Ordering::Relaxed);
    if base == 0 {
        return 0;
    }
    ticks_to_ns(arch::timer_read_ticks()).saturating_sub(base)
}

/// Arms the hardware timer for this CPU's next deadline, taking the queue
/// head `upcoming` (wall ns) into account.
pub fn update(upcoming: Option<u64>) {
    let tpcpu = this_per_cpu();

    let mut next = tpcpu.timer_next();
    if let Some(expiration) = upcoming {
        if expiration < next {
            next = expiration;
        }
    }
    tpcpu.set_timer_next(next);

    if next != u64::MAX {
        let base = WALL_BASE.load(Ordering::Relaxed);
        arch::timer_set_raw(ns_to_ticks(next + base));
    } else {
        arch::timer_set_raw(u64::MAX);
    }
}

/// Timer interrupt: requests event processing and re-arms the periodic
/// tick.
pub fn handle_timer() {
    let tpcpu = this_per_cpu();

    tpcpu.set_schedule();
    tpcpu.set_handle_events();

    let hz = TIMER_HZ.load(Ordering::Relaxed);
    let next = if hz != 0 {
        get_wall_ns() + NSEC_PER_SEC / hz as u64
    } else {
        u64::MAX
    };
    tpcpu.set_timer_next(next);
}

/// Arms the first deadline of a freshly booted CPU.
pub fn timer_cpu_init() {
    let hz = TIMER_HZ.load(Ordering::Relaxed);
    let next = if hz != 0 {
        get_wall_ns() + NSEC_PER_SEC / hz as u64
    } else {
        u64::MAX
    };

    this_per_cpu().set_timer_next(next);
    update(None);
}

/// Establishes the wall-clock base and starts this CPU's tick.
pub fn init(timebase: Option<u64>) -> Result<()> {
    if let Some(freq) = timebase {
        TIMEBASE_FREQUENCY.store(freq, Ordering::Relaxed);
    }

    // Quiesce the timer until the first deadline is armed
    arch::timer_set_raw(u64::MAX);

    let base = ticks_to_ns(arch::timer_read_ticks());
    WALL_BASE.store(base.max(1), Ordering::Relaxed);

    pr_info!(
        "timer: frequency {} Hz, timebase {} Hz",
        TIMER_HZ.load(Ordering::Relaxed),
        timebase_frequency()
    );

    timer_cpu_init();
    Ok(())
}
