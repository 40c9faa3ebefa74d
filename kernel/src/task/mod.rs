//! Tasks, scheduling, and wait-for-event handling.
//!
//! All tasks live in one global arena keyed by pid; parent/children links
//! are pid indices, so reparenting and reaping are plain edits. The arena,
//! the schedulable set and the timer queue share a single spinlock.
//! Per-CPU state (`current_task`, the flag set) is only written by its
//! owning CPU; remote CPUs communicate through the atomic flags plus IPIs.
//!
//! Scheduling is round-robin over RUNNABLE tasks, starting at the pid
//! successor of the task a CPU currently runs. A CPU holds on to its
//! current task when nothing else is runnable, and idles otherwise.

pub mod process;
pub mod uaccess;
pub mod vma;

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{self, Registers};
use crate::config::VM_PID_OFFSET;
use crate::errno::{Errno, Result};
use crate::percpu::{per_cpu, this_cpu_id, this_per_cpu};
use crate::smp;
use crate::timer;
use crate::ttp;
use crate::vmm::VMachine;

use process::Process;

/// Task identifier. Pid 0 never exists.
pub type Pid = u32;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet schedulable.
    Init,
    /// Ready to run.
    Runnable,
    /// Executing on some CPU.
    Running,
    /// Waiting for an event (child exit or timer).
    Wfe,
    /// Exited, waiting to be reaped by the parent.
    ExitDead,
}

/// What a blocked task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wfe {
    /// Not waiting.
    None,
    /// Waiting for a child to exit.
    Child {
        /// Pid waited for; -1 for any child.
        pid: i64,
        /// User address receiving the exit status; 0 when unwanted.
        status: usize,
    },
    /// Waiting for a timer expiration, wall nanoseconds.
    Timer {
        /// Absolute expiration.
        expiration: u64,
    },
}

/// Task payload.
pub enum TaskData {
    /// A user process.
    Process(Process),
    /// A virtual machine vCPU.
    VMachine(alloc::boxed::Box<VMachine>),
    /// Payload already torn down; only the exit code remains.
    Dead,
}

/// One schedulable entity.
pub struct Task {
    /// Unique id.
    pub pid: Pid,
    /// Display name.
    pub name: String,
    /// Saved register state; valid iff the task is not RUNNING.
    pub regs: Registers,
    /// Lifecycle state.
    pub state: TaskState,
    /// CPU executing this task; valid iff RUNNING.
    pub on_cpu: usize,
    /// Parent task.
    pub parent: Option<Pid>,
    /// Children, in creation order.
    pub children: Vec<Pid>,
    /// Wait-for-event record.
    pub wfe: Wfe,
    /// Exit code, valid in EXIT_DEAD.
    pub exit_code: i64,
    /// Whether the scheduler may pick this task.
    pub enqueued: bool,
    /// Payload.
    pub data: TaskData,
}

impl Task {
    /// The process payload, if this is a process.
    pub fn process(&self) -> Option<&Process> {
        match &self.data {
            TaskData::Process(p) => Some(p),
            _ => None,
        }
    }

    /// Mutable process payload.
    pub fn process_mut(&mut self) -> Option<&mut Process> {
        match &mut self.data {
            TaskData::Process(p) => Some(p),
            _ => None,
        }
    }

    /// The VM payload, if this is a virtual machine.
    pub fn vmachine(&self) -> Option<&VMachine> {
        match &self.data {
            TaskData::VMachine(vm) => Some(vm),
            _ => None,
        }
    }

    /// Mutable VM payload.
    pub fn vmachine_mut(&mut self) -> Option<&mut VMachine> {
        match &mut self.data {
            TaskData::VMachine(vm) => Some(vm),
            _ => None,
        }
    }
}

struct TaskTable {
    tasks: BTreeMap<Pid, Task>,
    /// `(expiration, pid)`, sorted ascending; one entry per sleeping task.
    timer_queue: Vec<(u64, Pid)>,
}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable {
    tasks: BTreeMap::new(),
    timer_queue: Vec::new(),
});

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Pid of the init task; set once at boot.
static INIT_PID: AtomicU32 = AtomicU32::new(0);

fn alloc_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Encodes an exit code the way `WIFEXITED`/`WEXITSTATUS` expect it.
fn encode_exit_status(code: i64) -> u32 {
    ((code & 0xff) << 8) as u32
}

/// Inserts into the sorted timer queue, keeping it strictly ordered.
fn timer_queue_insert(queue: &mut Vec<(u64, Pid)>, expiration: u64, pid: Pid) {
    let at = queue.partition_point(|&(e, p)| (e, p) < (expiration, pid));
    queue.insert(at, (expiration, pid));
}

fn timer_queue_remove(queue: &mut Vec<(u64, Pid)>, pid: Pid) {
    queue.retain(|&(_, p)| p != pid);
}

/// Offsets the pid namespace when running nested.
pub fn init() {
    if arch::is_guest() {
        NEXT_PID.fetch_add(VM_PID_OFFSET * arch::grinch_id(), Ordering::Relaxed);
    }
}

/// Allocates a task record in INIT state.
pub fn task_alloc_new(name: &str, data: TaskData) -> Pid {
    let pid = alloc_pid();
    let task = Task {
        pid,
        name: String::from(name),
        regs: Registers::new(),
        state: TaskState::Init,
        on_cpu: 0,
        parent: None,
        children: Vec::new(),
        wfe: Wfe::None,
        exit_code: 0,
        enqueued: false,
        data,
    };

    TASKS.lock().tasks.insert(pid, task);
    pid
}

/// Records the init task.
pub fn set_init_task(pid: Pid) {
    INIT_PID.store(pid, Ordering::Relaxed);
}

/// Makes a task schedulable.
pub fn sched_enqueue(pid: Pid) {
    let mut table = TASKS.lock();
    let task = table.tasks.get_mut(&pid).expect("enqueue of unknown task");
    if task.state == TaskState::Init {
        task.state = TaskState::Runnable;
    }
    task.enqueued = true;
}

/// Requests a scheduler pass on every online CPU.
pub fn sched_all() {
    for cpu in smp::online_cpus() {
        per_cpu(cpu).set_schedule();
    }
    arch::ipi_broadcast();
}

/// Runs `f` on the task record of `pid`.
pub fn with_task<R>(pid: Pid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    TASKS.lock().tasks.get_mut(&pid).map(f)
}

/// Runs `f` on the current task. Panics without one.
pub fn with_current<R>(f: impl FnOnce(&mut Task) -> R) -> R {
    let pid = this_per_cpu().current_task().expect("no current task");
    with_task(pid, f).expect("current task vanished")
}

/// Runs `f` on the current task's saved registers.
pub fn with_current_regs<R>(f: impl FnOnce(&mut Registers) -> R) -> R {
    with_current(|task| f(&mut task.regs))
}

/// Pid of the current task. Panics without one.
pub fn current_pid() -> Pid {
    this_per_cpu().current_task().expect("no current task")
}

/// Snapshots the trap frame into the current task.
pub fn task_save(regs: &Registers) {
    let pid = match this_per_cpu().current_task() {
        Some(pid) => pid,
        None => return,
    };

    let mut table = TASKS.lock();
    let task = table.tasks.get_mut(&pid).expect("current task vanished");
    task.regs = *regs;
    if let Some(vm) = task.vmachine_mut() {
        arch::vmm::vmachine_save(vm);
    }
}

/// Makes `pick` the task this CPU runs. The only transition to RUNNING.
fn task_activate(table: &mut TaskTable, pick: Option<Pid>) {
    let tpcpu = this_per_cpu();
    let old = tpcpu.current_task();

    if old == pick {
        if let Some(pid) = pick {
            let task = table.tasks.get_mut(&pid).expect("current task vanished");
            match task.state {
                TaskState::Running => (),
                // The task may have turned RUNNABLE while descheduled
                TaskState::Runnable => task.state = TaskState::Running,
                state => panic!("re-activating task in state {:?}", state),
            }
        }
        return;
    }

    // Demote the outgoing task, but never touch a task that went waiting
    if let Some(old_pid) = old {
        if let Some(old_task) = table.tasks.get_mut(&old_pid) {
            if old_task.state == TaskState::Running {
                old_task.state = TaskState::Runnable;
            }
        }
    }

    tpcpu.set_current_task(pick);
    let pid = match pick {
        Some(pid) => pid,
        None => return,
    };

    let cpuid = tpcpu.cpuid();
    let task = table.tasks.get_mut(&pid).expect("activating unknown task");
    if task.state != TaskState::Runnable {
        panic!(
            "activating non-runnable task: PID {} state {:?}",
            pid, task.state
        );
    }
    task.state = TaskState::Running;
    task.on_cpu = cpuid;

    ttp::emit(ttp::Event::SchedSwitch(pid));

    match &mut task.data {
        TaskData::Process(p) => arch::process_activate(p.root),
        TaskData::VMachine(vm) => arch::vmm::vmachine_activate(vm),
        TaskData::Dead => panic!("activating dead task"),
    }
}

/// Picks the next RUNNABLE task, round-robin from `cur`'s successor.
fn pick_next(table: &TaskTable, cur: Option<Pid>) -> Option<Pid> {
    let runnable =
        |t: &Task| t.enqueued && t.state == TaskState::Runnable;

    if let Some(cur_pid) = cur {
        // Successors first, then wrap around up to and including cur
        let after = table
            .tasks
            .range(cur_pid + 1..)
            .find(|&(_, t)| runnable(t))
            .map(|(pid, _)| *pid);
        if after.is_some() {
            return after;
        }

        let wrapped = table
            .tasks
            .range(..=cur_pid)
            .find(|&(_, t)| runnable(t))
            .map(|(pid, _)| *pid);
        if wrapped.is_some() {
            return wrapped;
        }

        // Nothing else: continue with the current task if it can go on
        match table.tasks.get(&cur_pid) {
            Some(t) if t.state == TaskState::Running => Some(cur_pid),
            _ => None,
        }
    } else {
        table
            .tasks
            .iter()
            .find(|&(_, t)| runnable(t))
            .map(|(pid, _)| *pid)
    }
}

fn schedule() {
    let mut table = TASKS.lock();
    let pick = pick_next(&table, this_per_cpu().current_task());
    task_activate(&mut table, pick);
}

/// Processes expired timers: wakes sleeping processes, injects guest timer
/// interrupts, and reprograms this CPU's timer from the queue head.
pub fn task_handle_events() {
    let mut table = TASKS.lock();
    let now = timer::get_wall_ns();

    let mut head_expiration = None;
    let queue = table.timer_queue.clone();
    let mut expired: Vec<Pid> = Vec::new();

    for (expiration, pid) in queue {
        if expiration > now {
            head_expiration = Some(expiration);
            break;
        }

        let task = match table.tasks.get_mut(&pid) {
            Some(task) => task,
            None => {
                expired.push(pid);
                continue;
            }
        };

        match &mut task.data {
            TaskData::VMachine(vm) => {
                vm.timer_pending = true;
                if task.state == TaskState::Running {
                    if task.on_cpu != this_cpu_id() {
                        // The owning CPU delivers the virtual interrupt
                        arch::ipi_send(task.on_cpu);
                        continue;
                    }
                } else if task.state == TaskState::Wfe {
                    task.state = TaskState::Runnable;
                }
            }
            _ => {
                if task.state != TaskState::Wfe {
                    panic!("timer expiry for non-waiting task {}", pid);
                }
                task.state = TaskState::Runnable;
            }
        }

        task.wfe = Wfe::None;
        ttp::emit(ttp::Event::TimerExpired(pid));
        expired.push(pid);
    }

    table
        .timer_queue
        .retain(|&(_, pid)| !expired.contains(&pid));

    timer::update(head_expiration);
}

/// Queues the current task on the timer list, expiring at `wall_ns`.
///
/// Processes enter WFE; virtual machines stay runnable, they are expected
/// to idle through their own WFI.
pub fn sleep_current_until(wall_ns: u64) {
    let pid = current_pid();
    let mut table = TASKS.lock();

    let task = table.tasks.get_mut(&pid).expect("current task vanished");
    if matches!(task.wfe, Wfe::Child { .. }) {
        panic!("sleeping task {} waits for a child", pid);
    }
    // Re-arming an unexpired timer replaces it
    task.wfe = Wfe::Timer {
        expiration: wall_ns,
    };
    let is_process = matches!(task.data, TaskData::Process(_));
    if is_process {
        task.state = TaskState::Wfe;
    }

    timer_queue_remove(&mut table.timer_queue, pid);
    timer_queue_insert(&mut table.timer_queue, wall_ns, pid);

    this_per_cpu().set_handle_events();
}

/// Puts the current task into WFE without a timer.
pub fn set_wfe_current() {
    with_current(|task| {
        if task.state == TaskState::Wfe {
            panic!("task {} waits already", task.pid);
        }
        if task.wfe == Wfe::None {
            task.wfe = Wfe::Timer { expiration: u64::MAX };
        }
        task.state = TaskState::Wfe;
    });
}

/// Removes the current task from the timer queue.
pub fn cancel_timer_current() {
    let pid = current_pid();
    let mut table = TASKS.lock();
    timer_queue_remove(&mut table.timer_queue, pid);
    if let Some(task) = table.tasks.get_mut(&pid) {
        if matches!(task.wfe, Wfe::Timer { .. }) {
            task.wfe = Wfe::None;
        }
    }
}

/// Reaps `child` into `parent`'s pending wait, if it matches.
///
/// Copies the encoded exit status out, sets the parent's return value to
/// the child's pid, wakes the parent, and frees the child record.
fn task_notify_wait(table: &mut TaskTable, parent_pid: Pid, child_pid: Pid) -> Result<()> {
    let (wanted, status_ptr) = match table.tasks.get(&parent_pid) {
        Some(parent) => match parent.wfe {
            Wfe::Child { pid, status } => (pid, status),
            _ => return Err(Errno::ECHILD),
        },
        None => return Err(Errno::ECHILD),
    };

    let child = table.tasks.get(&child_pid).ok_or(Errno::ECHILD)?;
    if wanted != -1 && wanted != child_pid as i64 {
        return Err(Errno::ECHILD);
    }
    if child.state != TaskState::ExitDead {
        panic!("reaping a live child");
    }
    let status = encode_exit_status(child.exit_code);

    // Forward the status into the parent's memory
    if status_ptr != 0 {
        if let Some(parent_process) = table.tasks.get(&parent_pid).and_then(|t| t.process()) {
            let _ = uaccess::put_user(parent_process, status_ptr, status);
        }
    }

    let parent = table.tasks.get_mut(&parent_pid).expect("parent vanished");
    parent.regs.set_retval(child_pid as isize);
    // The parent might be RUNNING when this is a direct notification
    if parent.state == TaskState::Wfe {
        parent.state = TaskState::Runnable;
    }
    parent.wfe = Wfe::None;
    parent.children.retain(|&c| c != child_pid);

    table.tasks.remove(&child_pid);

    Ok(())
}

/// Terminates a task: releases its payload, reparents its children to
/// init, and notifies a waiting parent. The record lingers in EXIT_DEAD
/// until reaped.
pub fn task_exit(pid: Pid, code: i64) {
    let mut table = TASKS.lock();

    timer_queue_remove(&mut table.timer_queue, pid);

    let task = table.tasks.get_mut(&pid).expect("exit of unknown task");
    let parent = match task.parent {
        Some(parent) => parent,
        None => panic!("exit from init task"),
    };

    task.enqueued = false;
    task.state = TaskState::ExitDead;
    task.exit_code = code;
    task.wfe = Wfe::None;

    let mut data = core::mem::replace(&mut task.data, TaskData::Dead);
    let children = core::mem::take(&mut task.children);

    match &mut data {
        TaskData::Process(p) => process::process_destroy(p),
        TaskData::VMachine(vm) => {
            if this_per_cpu().current_task() == Some(pid) {
                arch::vmm::vmachine_deactivate();
            }
            crate::vmm::vmachine_destroy(vm);
        }
        TaskData::Dead => (),
    }

    // Orphans go to init
    let init_pid = INIT_PID.load(Ordering::Relaxed);
    for child in children {
        if let Some(child_task) = table.tasks.get_mut(&child) {
            child_task.parent = Some(init_pid);
        }
        let init_task = table.tasks.get_mut(&init_pid).expect("init vanished");
        init_task.children.push(child);
    }

    if this_per_cpu().current_task() == Some(pid) {
        this_per_cpu().set_schedule();
        this_per_cpu().set_current_task(None);
    }

    let _ = task_notify_wait(&mut table, parent, pid);
}

/// Terminates the current task.
pub fn exit_current(code: i64) {
    task_exit(current_pid(), code);
}

/// The `wait` syscall: reap a dead child in place, or block until one
/// exits. On the blocking path no return value is written - the waker
/// writes it.
pub fn do_wait(pid: i64, status_uptr: usize, options: usize) -> Result<()> {
    if options != 0 {
        return Err(Errno::EINVAL);
    }
    if pid == 0 || pid < -1 {
        return Err(Errno::ENOSYS);
    }

    let me = current_pid();
    let mut table = TASKS.lock();

    let my_children = match table.tasks.get(&me) {
        Some(task) => task.children.clone(),
        None => return Err(Errno::ECHILD),
    };
    if my_children.is_empty() {
        return Err(Errno::ECHILD);
    }

    let candidate = if pid == -1 {
        my_children
            .iter()
            .find(|&&c| {
                table
                    .tasks
                    .get(&c)
                    .map(|t| t.state == TaskState::ExitDead)
                    .unwrap_or(false)
            })
            .copied()
    } else {
        let child = my_children.iter().find(|&&c| c as i64 == pid).copied();
        if child.is_none() {
            return Err(Errno::ECHILD);
        }
        child
    };

    {
        let task = table.tasks.get_mut(&me).expect("current task vanished");
        if task.wfe != Wfe::None {
            panic!("task {} waits already", me);
        }
        task.wfe = Wfe::Child {
            pid,
            status: status_uptr,
        };
    }

    if let Some(child) = candidate {
        let dead = table
            .tasks
            .get(&child)
            .map(|t| t.state == TaskState::ExitDead)
            .unwrap_or(false);
        if dead {
            // Reaped in place; retval was set by the notifier
            task_notify_wait(&mut table, me, child).expect("in-place reap failed");
            return Ok(());
        }
    }

    // Block until a child exits
    let task = table.tasks.get_mut(&me).expect("current task vanished");
    task.state = TaskState::Wfe;

    this_per_cpu().set_schedule();
    this_per_cpu().set_current_task(None);

    Ok(())
}

/// The `fork` syscall: duplicate the current process.
pub fn do_fork() -> Result<isize> {
    let parent_pid = current_pid();
    let mut table = TASKS.lock();

    let (name, parent_regs, parent_cwd, parent_fds) = {
        let parent = table.tasks.get(&parent_pid).expect("current task vanished");
        let p = parent.process().ok_or(Errno::EINVAL)?;
        (
            parent.name.clone(),
            parent.regs,
            p.cwd.clone(),
            p.fds.clone(),
        )
    };

    let mut child_process = Process::new()?;
    child_process.cwd = parent_cwd;
    // File handles are duplicated, the open files shared
    child_process.fds = parent_fds;

    // Duplicate the whole address space
    {
        let parent = table.tasks.get(&parent_pid).expect("current task vanished");
        let parent_process = parent.process().expect("checked above");
        child_process.brk = parent_process.brk;

        for vma in &parent_process.vmas {
            if let Err(e) = vma::uvma_duplicate(&mut child_process, parent_process, vma) {
                process::process_destroy(&mut child_process);
                return Err(e);
            }
        }
    }

    let child_pid = alloc_pid();
    let mut regs = parent_regs;
    regs.set_retval(0);

    let child = Task {
        pid: child_pid,
        name,
        regs,
        state: TaskState::Runnable,
        on_cpu: 0,
        parent: Some(parent_pid),
        children: Vec::new(),
        wfe: Wfe::None,
        exit_code: 0,
        enqueued: true,
        data: TaskData::Process(child_process),
    };

    table.tasks.insert(child_pid, child);
    table
        .tasks
        .get_mut(&parent_pid)
        .expect("current task vanished")
        .children
        .push(child_pid);

    drop(table);

    // Give every CPU a chance to pick the child up
    sched_all();

    Ok(child_pid as isize)
}

/// Handles a user page fault; kills the task when unrecoverable.
pub fn task_handle_fault(addr: usize, is_write: bool) {
    let pid = current_pid();

    let res = with_current(|task| match task.process_mut() {
        Some(p) => process::process_handle_fault(p, addr, is_write),
        None => Err(Errno::EFAULT),
    });

    if res.is_ok() {
        // The fresh mapping may have grown a new top-level entry that this
        // CPU's root table copy does not carry yet
        this_per_cpu().set_pt_needs_update();
        return;
    }

    pr!(
        "PID {}: SEGFAULT at {:#x} ({})",
        pid,
        addr,
        if is_write { "write" } else { "read" }
    );
    task_exit(pid, Errno::EFAULT.as_neg() as i64);
}

fn do_idle() {
    let tpcpu = this_per_cpu();
    tpcpu.set_idling(true);
    arch::do_idle();
    tpcpu.set_idling(false);
}

/// Copies the next task's context into the exception frame and leaves the
/// kernel. Drains pending events and scheduler requests first; idles when
/// nothing is runnable.
pub fn prepare_user_return() -> ! {
    let tpcpu = this_per_cpu();

    loop {
        if tpcpu.take_handle_events() {
            task_handle_events();
        }

        if tpcpu.take_schedule() {
            schedule();
        }

        if tpcpu.current_task().is_none() {
            let any_tasks = !TASKS.lock().tasks.is_empty();
            if !any_tasks && tpcpu.is_primary() {
                pr!("Nothing to schedule!");
                arch::shutdown(Errno::ENOENT.as_neg() as i32);
            }

            do_idle();
            continue;
        }

        if tpcpu.take_pt_needs_update() {
            with_current(|task| match &task.data {
                TaskData::Process(p) => arch::process_activate(p.root),
                // A VM activation installed its own translation already
                _ => (),
            });
        }

        // Restore the task context into the exception frame
        let frame = tpcpu.exception_frame();
        {
            let mut table = TASKS.lock();
            let pid = match tpcpu.current_task() {
                Some(pid) => pid,
                // Events above may have torn the task down; start over
                None => continue,
            };
            let task = table.tasks.get_mut(&pid).expect("current task vanished");
            if task.state != TaskState::Running {
                panic!("returning to non-running task {}", pid);
            }

            // SAFETY: the frame belongs to this CPU and no trap can occur
            // while the kernel runs
            unsafe { *frame = task.regs };
            if let Some(vm) = task.vmachine_mut() {
                arch::vmm::vmachine_restore(vm);
            }
        }

        arch::return_to_user(frame);
    }
}

/// Creates the init process from the configured path and schedules it.
pub fn spawn_init() -> Result<Pid> {
    let mut p = Process::new()?;

    let path = process::init_path();
    let argv = [path.clone()];
    let ctx = match process::load_from_path(&mut p, &path, &argv, &[]) {
        Ok(ctx) => ctx,
        Err(e) => {
            process::process_destroy(&mut p);
            return Err(e);
        }
    };

    // Wire stdin/stdout/stderr to the console
    let console = crate::fs::open("/dev/console", crate::fs::OpenFlags(0o2))?;
    for fd in 0..3 {
        p.fds[fd] = Some(crate::fs::FileHandle {
            file: console.clone(),
            pos: 0,
            may_read: fd == 0,
            may_write: fd != 0,
        });
    }

    let pid = task_alloc_new("init", TaskData::Process(p));
    let _ = with_task(pid, |task| {
        task.regs.pc = ctx.pc;
        task.regs.sp = ctx.sp;
        task.regs.a0 = ctx.argc;
        task.regs.a1 = ctx.argv;
        task.regs.a2 = ctx.envp;
    });

    set_init_task(pid);
    sched_enqueue(pid);

    Ok(pid)
}

/// Creates a vCPU task from a prepared virtual machine.
pub fn spawn_vmachine(vm: alloc::boxed::Box<VMachine>, pc: usize, fdt_addr: usize) -> Pid {
    let parent = current_pid();

    let pid = task_alloc_new("GrinchVM", TaskData::VMachine(vm));
    let _ = with_task(pid, |task| {
        task.parent = Some(parent);
        task.regs.pc = pc;
        task.regs.a0 = 0;
        task.regs.a1 = fdt_addr;
    });
    let _ = with_task(parent, |task| task.children.push(pid));

    sched_enqueue(pid);
    pid
}

/// Prints every task, for the kstat interface.
pub fn tasks_dump() {
    let table = TASKS.lock();

    for (pid, task) in &table.tasks {
        let ty = match task.data {
            TaskData::Process(_) => "process",
            TaskData::VMachine(_) => "VM     ",
            TaskData::Dead => "dead   ",
        };
        pr!(
            "PID: {} Type: {} State: {:?} WFE: {:?} On CPU: {} - {}",
            pid,
            ty,
            task.state,
            task.wfe,
            task.on_cpu,
            task.name
        );
    }
}

/// Lists the VMAs of a process, for the kstat interface.
pub fn process_show_vmas(pid: Pid) {
    let table = TASKS.lock();
    let task = match table.tasks.get(&pid) {
        Some(task) => task,
        None => {
            pr!("PID {}: no task", pid);
            return;
        }
    };
    let p = match task.process() {
        Some(p) => p,
        None => return,
    };

    pr!("VMA map of PID {} ({})", pid, task.name);
    for vma in &p.vmas {
        pr!(
            "{:#014x}-{:#014x} {}{}{}{} {:#010x} {}",
            vma.base,
            vma.base + vma.size,
            if vma.flags.contains(vma::VmaFlags::R) { 'r' } else { '-' },
            if vma.flags.contains(vma::VmaFlags::W) { 'w' } else { '-' },
            if vma.flags.contains(vma::VmaFlags::EXEC) { 'x' } else { '-' },
            if vma.flags.contains(vma::VmaFlags::LAZY) { 'z' } else { '-' },
            vma.size,
            vma.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encoding() {
        assert_eq!(encode_exit_status(0), 0);
        assert_eq!(encode_exit_status(42), 42 << 8);
        assert_eq!(encode_exit_status(0x1ff), 0xff00);
        assert_eq!(encode_exit_status(-14), ((-14i64 & 0xff) << 8) as u32);
    }

    #[test]
    fn timer_queue_stays_sorted() {
        let mut queue = Vec::new();

        timer_queue_insert(&mut queue, 30, 1);
        timer_queue_insert(&mut queue, 10, 2);
        timer_queue_insert(&mut queue, 20, 3);
        timer_queue_insert(&mut queue, 10, 4);

        let exps: Vec<u64> = queue.iter().map(|&(e, _)| e).collect();
        assert_eq!(exps, [10, 10, 20, 30]);
        // Wake order of the 10ms sleepers is stable by pid
        assert_eq!(queue[0], (10, 2));
        assert_eq!(queue[1], (10, 4));

        timer_queue_remove(&mut queue, 3);
        let exps: Vec<u64> = queue.iter().map(|&(e, _)| e).collect();
        assert_eq!(exps, [10, 10, 30]);
    }

    #[test]
    fn timer_queue_duplicate_reinsert() {
        let mut queue = Vec::new();
        timer_queue_insert(&mut queue, 50, 7);
        timer_queue_remove(&mut queue, 7);
        timer_queue_insert(&mut queue, 5, 7);

        assert_eq!(queue, [(5, 7)]);
    }
}
