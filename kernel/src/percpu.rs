//! Per-CPU state.
//!
//! One page-aligned [`PerCpu`] record exists per hart, held in a single
//! static array. The executing hart finds its own record through `tp`;
//! other harts never write a foreign record directly - cross-CPU requests
//! go through the [`RemoteCall`] slot plus an IPI, or through the atomic
//! `schedule`/`handle_events` flags.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use riscv::PhysAddr;
use spin::Mutex;

use crate::arch::{self, Registers};
use crate::config::{MAX_CPUS, STACK_SIZE};
use crate::task::Pid;

/// Exception stack of one hart. The trap entry code saves the interrupted
/// context into the `regs` frame at the stack's top; `kernel_tp` sits right
/// behind it so the assembly can recover the per-CPU pointer.
#[repr(C)]
pub struct ExceptionStack {
    stack: [u8; STACK_SIZE],
    /// Saved context of the interrupted task.
    pub regs: Registers,
    /// This hart's `PerCpu` address, for the trap entry path.
    pub kernel_tp: usize,
}

/// A root page table page.
#[repr(C, align(4096))]
pub struct RootTablePage(pub [u64; 512]);

/// Cross-CPU function call slot: `{lock, active, func, arg}` plus IPI.
pub struct RemoteCall {
    /// Serializes callers targeting this CPU.
    pub lock: Mutex<()>,
    active: AtomicBool,
    func: AtomicUsize,
    arg: AtomicUsize,
}

impl RemoteCall {
    const fn new() -> Self {
        RemoteCall {
            lock: Mutex::new(()),
            active: AtomicBool::new(false),
            func: AtomicUsize::new(0),
            arg: AtomicUsize::new(0),
        }
    }

    /// Arms the slot. Caller must hold `lock`.
    pub fn arm(&self, func: fn(usize), arg: usize) {
        self.func.store(func as usize, Ordering::Relaxed);
        self.arg.store(arg, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Whether an armed call has not executed yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Executes and disarms a pending call, if any. Runs on the owning CPU.
    pub fn run_pending(&self) {
        if !self.is_active() {
            return;
        }

        let func = self.func.load(Ordering::Relaxed);
        let arg = self.arg.load(Ordering::Relaxed);
        // SAFETY: `func` was stored from a valid `fn(usize)` in `arm`
        let func: fn(usize) = unsafe { core::mem::transmute(func) };
        func(arg);

        self.active.store(false, Ordering::Release);
    }
}

/// Per-hart kernel state.
#[repr(C, align(4096))]
pub struct PerCpu {
    stack: UnsafeCell<ExceptionStack>,
    root_table: UnsafeCell<RootTablePage>,

    cpuid: AtomicUsize,
    primary: AtomicBool,

    pt_needs_update: AtomicBool,
    schedule: AtomicBool,
    idling: AtomicBool,
    handle_events: AtomicBool,

    /// Next timer deadline of this CPU, wall nanoseconds. `u64::MAX` when
    /// no deadline is armed.
    timer_next: AtomicU64,

    /// Cross-CPU call slot.
    pub remote_call: RemoteCall,

    /// Pid of the task this CPU executes; 0 when none.
    current_task: AtomicU32,

    /// Interrupt controller context of this hart.
    irqchip_ctx: AtomicUsize,
}

// SAFETY: stack and root_table are only touched by the owning CPU (and by
// the boot CPU before a secondary comes online); everything else is atomic.
unsafe impl Sync for PerCpu {}

impl PerCpu {
    const fn new() -> Self {
        PerCpu {
            stack: UnsafeCell::new(ExceptionStack {
                stack: [0; STACK_SIZE],
                regs: Registers::new(),
                kernel_tp: 0,
            }),
            root_table: UnsafeCell::new(RootTablePage([0; 512])),
            cpuid: AtomicUsize::new(0),
            primary: AtomicBool::new(false),
            pt_needs_update: AtomicBool::new(false),
            schedule: AtomicBool::new(false),
            idling: AtomicBool::new(false),
            handle_events: AtomicBool::new(false),
            timer_next: AtomicU64::new(u64::MAX),
            remote_call: RemoteCall::new(),
            current_task: AtomicU32::new(0),
            irqchip_ctx: AtomicUsize::new(0),
        }
    }

    /// This hart's id.
    pub fn cpuid(&self) -> usize {
        self.cpuid.load(Ordering::Relaxed)
    }

    /// Whether this is the boot hart.
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Relaxed)
    }

    /// Pointer to the exception register frame at the stack top.
    pub fn exception_frame(&self) -> *mut Registers {
        // SAFETY: only computes a field address
        unsafe { core::ptr::addr_of_mut!((*self.stack.get()).regs) }
    }

    /// Physical address of this CPU's root page table.
    pub fn root_table_pa(&self) -> PhysAddr {
        crate::mm::gfp::v2p(riscv::VirtAddr::new(self.root_table.get() as usize))
    }

    /// Virtual address of this CPU's root page table.
    pub fn root_table_va(&self) -> usize {
        self.root_table.get() as usize
    }

    /// The task currently executing on this CPU.
    pub fn current_task(&self) -> Option<Pid> {
        match self.current_task.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Installs the currently executing task. Owning CPU only.
    pub fn set_current_task(&self, pid: Option<Pid>) {
        self.current_task.store(pid.unwrap_or(0), Ordering::Relaxed);
    }

    /// Requests a scheduler run on this CPU. May be called cross-CPU; pair
    /// with an IPI when remote.
    pub fn set_schedule(&self) {
        self.schedule.store(true, Ordering::Release);
    }

    /// Consumes the schedule request flag.
    pub fn take_schedule(&self) -> bool {
        self.schedule.swap(false, Ordering::Acquire)
    }

    /// Marks that timer or wakeup events await processing. May be called
    /// cross-CPU; pair with an IPI when remote.
    pub fn set_handle_events(&self) {
        self.handle_events.store(true, Ordering::Release);
    }

    /// Consumes the handle-events flag.
    pub fn take_handle_events(&self) -> bool {
        self.handle_events.swap(false, Ordering::Acquire)
    }

    /// Marks the process page table stale; re-activated on next return.
    pub fn set_pt_needs_update(&self) {
        self.pt_needs_update.store(true, Ordering::Relaxed);
    }

    /// Consumes the stale-page-table flag.
    pub fn take_pt_needs_update(&self) -> bool {
        self.pt_needs_update.swap(false, Ordering::Relaxed)
    }

    /// Whether this CPU sits in the idle loop.
    pub fn idling(&self) -> bool {
        self.idling.load(Ordering::Relaxed)
    }

    pub(crate) fn set_idling(&self, v: bool) {
        self.idling.store(v, Ordering::Relaxed);
    }

    /// This CPU's next timer deadline in wall nanoseconds.
    pub fn timer_next(&self) -> u64 {
        self.timer_next.load(Ordering::Relaxed)
    }

    /// Updates this CPU's next timer deadline.
    pub fn set_timer_next(&self, ns: u64) {
        self.timer_next.store(ns, Ordering::Relaxed);
    }

    /// This hart's interrupt controller context id.
    pub fn irqchip_ctx(&self) -> usize {
        self.irqchip_ctx.load(Ordering::Relaxed)
    }

    /// Records the interrupt controller context id at probe time.
    pub fn set_irqchip_ctx(&self, ctx: usize) {
        self.irqchip_ctx.store(ctx, Ordering::Relaxed);
    }

    /// One-time identity setup during bring-up of this CPU.
    pub fn init(&self, cpuid: usize, primary: bool) {
        self.cpuid.store(cpuid, Ordering::Relaxed);
        self.primary.store(primary, Ordering::Relaxed);
        // SAFETY: called before the CPU takes traps
        unsafe { (*self.stack.get()).kernel_tp = self as *const PerCpu as usize };
    }
}

const PERCPU_INIT: PerCpu = PerCpu::new();
static PERCPUS: [PerCpu; MAX_CPUS] = [PERCPU_INIT; MAX_CPUS];

/// Returns the record of the executing hart.
pub fn this_per_cpu() -> &'static PerCpu {
    // SAFETY: tp is set to this hart's PerCpu during bring-up
    unsafe { &*(arch::percpu_ptr() as *const PerCpu) }
}

/// Returns the id of the executing hart.
pub fn this_cpu_id() -> usize {
    this_per_cpu().cpuid()
}

/// Returns the record of an arbitrary hart.
pub fn per_cpu(cpu: usize) -> &'static PerCpu {
    &PERCPUS[cpu]
}
