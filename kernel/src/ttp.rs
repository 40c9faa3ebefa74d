//! Tiny trace points.
//!
//! A bounded ring of timestamped scheduler and trap events, sized by the
//! `ttp_maxevents=` boot parameter (0 disables tracing, the default).
//! Dumped on request through the kstat interface.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::task::Pid;
use crate::timer;

/// Traceable events.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// A CPU switched to a task.
    SchedSwitch(Pid),
    /// A sleeping task's timer fired.
    TimerExpired(Pid),
    /// A task exited.
    TaskExit(Pid),
    /// A guest performed a hypercall.
    Hypercall(usize),
}

static MAXEVENTS: AtomicUsize = AtomicUsize::new(0);
static EVENTS: Mutex<Vec<(u64, Event)>> = Mutex::new(Vec::new());

pub(crate) fn parse_maxevents(arg: Option<&str>) {
    if let Some(n) = arg.and_then(|a| a.parse().ok()) {
        MAXEVENTS.store(n, Ordering::Relaxed);
    }
}

/// Records one event; oldest events fall out when the ring is full.
pub fn emit(event: Event) {
    let max = MAXEVENTS.load(Ordering::Relaxed);
    if max == 0 {
        return;
    }

    let mut events = EVENTS.lock();
    if events.len() >= max {
        events.remove(0);
    }
    events.push((timer::get_wall_ns(), event));
}

/// Prints and clears the collected events.
pub fn dump() {
    let mut events = EVENTS.lock();
    for (ns, event) in events.iter() {
        pr!("[{:12}ns] {:?}", ns, event);
    }
    events.clear();
}
