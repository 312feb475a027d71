//! Preemptive scheduler: the ready/sleeping/exited queues and the
//! context-switch sequencing the rest of the kernel binds against (§4.4).
//!
//! Grounded on the original kernel's `scheduler.c`: a fixed task table
//! indexed directly by pid (`MAX_TASKS` doubles as the width of the
//! original's `encountered_pids` integrity bitmap), three queues of pids,
//! and a private idle task that never appears in any queue.
//!
//! Every public entry point that performs a context switch follows the same
//! shape: do the scheduling decision and the `cr3`/`esp0` update while the
//! scheduler lock is held, read the resulting [`TaskContext`] back out
//! (it's `Copy`), drop the lock, then call [`crate::arch::context::resume`].
//! `resume` never returns, so the lock has to be released *before* calling
//! it — a spinlock held across a diverging call would wedge every future
//! interrupt on this core.

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::context::TaskContext;
use crate::arch::idt::IsrRegs;
use crate::arch::{gdt, timer};
use crate::error::SchedError;
use crate::mm::vmm;

use super::task::{
    PendingCompletion, Task, TaskName, TaskState, INVALID_PORT, KERNEL_STACK_TOP, MAX_TASKS,
    TASK_NAME_MAX, USER_STACK_BOTTOM, USER_STACK_TOP,
};

/// Pseudo-pid for the idle task. Never present in any queue, never in the
/// task table — it is private to the scheduler (§4.4).
pub const IDLE_PID: i32 = -2;

pub struct TaskInfo {
    pub pid: i32,
    pub name: [u8; TASK_NAME_MAX],
    pub name_len: u8,
    pub state: TaskState,
}

const ZERO_REGS: IsrRegs = IsrRegs {
    ds: 0,
    edi: 0,
    esi: 0,
    ebp: 0,
    esp: 0,
    ebx: 0,
    edx: 0,
    ecx: 0,
    eax: 0,
    int_no: 0,
    err_code: 0,
    eip: 0,
    cs: 0,
    eflags: 0,
    useresp: 0,
    ss: 0,
};

struct Scheduler {
    tasks: [Option<Task>; MAX_TASKS],
    idle: Task,
    current: i32,
    ready: VecDeque<i32>,
    sleeping: VecDeque<i32>,
    exited: VecDeque<i32>,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            tasks: [const { None }; MAX_TASKS],
            idle: Task {
                pid: IDLE_PID,
                name: TaskName::empty(),
                address_space: 0,
                context: TaskContext { regs: ZERO_REGS },
                state: TaskState::Running,
                wait_canrecv_port: INVALID_PORT,
                wait_cansend_port: INVALID_PORT,
                sleep_deadline: None,
                pending_completion: None,
            },
            current: IDLE_PID,
            ready: VecDeque::new(),
            sleeping: VecDeque::new(),
            exited: VecDeque::new(),
        }
    }

    fn task_ref(&self, pid: i32) -> &Task {
        self.tasks[pid as usize].as_ref().expect("task_ref: pid not present")
    }

    fn task_mut(&mut self, pid: i32) -> &mut Task {
        self.tasks[pid as usize].as_mut().expect("task_mut: pid not present")
    }

    fn alloc_pid(&self) -> Result<i32, SchedError> {
        (1..MAX_TASKS)
            .find(|&i| self.tasks[i].is_none())
            .map(|i| i as i32)
            .ok_or(SchedError::TaskTableFull)
    }

    /// Every queue-mutating entry point calls this before picking a next
    /// task: no task in more than one queue, no duplicate pids, the running
    /// task (or idle) never queued (§4.4).
    fn check_queue_integrity(&self) {
        let mut seen: u64 = 0;
        let mut mark = |pid: i32| {
            assert!((0..MAX_TASKS as i32).contains(&pid), "queue integrity: pid {pid} out of range");
            let bit = 1u64 << pid;
            assert!(seen & bit == 0, "queue integrity: pid {pid} queued more than once");
            seen |= bit;
        };
        for &pid in self.ready.iter() {
            mark(pid);
            assert_eq!(self.task_ref(pid).state, TaskState::Ready);
        }
        for &pid in self.sleeping.iter() {
            mark(pid);
            assert_eq!(self.task_ref(pid).state, TaskState::Sleeping);
        }
        for &pid in self.exited.iter() {
            mark(pid);
            assert_eq!(self.task_ref(pid).state, TaskState::Exited);
        }
        if self.current != IDLE_PID {
            assert!(seen & (1u64 << self.current) == 0, "running task must not be queued");
        }
    }

    fn reap_exited(&mut self) {
        while let Some(pid) = self.exited.pop_front() {
            let address_space = self.task_ref(pid).address_space;
            let _ = vmm::destroy_pagedir(address_space);
            self.tasks[pid as usize] = None;
        }
    }

    /// First sleeper whose deadline has passed, else the ready head, else
    /// idle — unless nothing is ready or sleeping-with-a-deadline, in which
    /// case the system can never make progress again.
    fn pick_next(&mut self) -> i32 {
        let now = timer::now_ms();
        if let Some(pos) = self
            .sleeping
            .iter()
            .position(|&pid| self.task_ref(pid).sleep_deadline.is_some_and(|d| now >= d))
        {
            return self.sleeping.remove(pos).unwrap();
        }
        if let Some(pid) = self.ready.pop_front() {
            return pid;
        }
        let any_deadline =
            self.sleeping.iter().any(|&pid| self.task_ref(pid).sleep_deadline.is_some());
        if self.sleeping.is_empty() || !any_deadline {
            panic!("scheduler deadlock: nothing runnable and nothing will ever wake");
        }
        IDLE_PID
    }

    /// Switches `cr3`/`esp0` to `next` and drains its pending completion, if
    /// any. Does not touch CPU registers — callers read the resulting
    /// context back out via [`Scheduler::resume_context`] once they're
    /// ready to drop the lock and resume.
    fn switch_to(&mut self, next: i32) {
        self.current = next;
        let address_space =
            if next == IDLE_PID { self.idle.address_space } else { self.task_ref(next).address_space };
        unsafe {
            vmm::switch_pagedir(address_space).expect("switch to task address space");
        }
        gdt::set_kernel_stack(KERNEL_STACK_TOP);

        if next == IDLE_PID {
            self.idle.state = TaskState::Running;
            return;
        }

        if let Some(completion) = self.task_mut(next).pending_completion.take() {
            match completion {
                PendingCompletion::DrainPort { port, buf_ptr, buf_size, out_size_ptr } => {
                    let (eax, wake_sender) =
                        crate::ipc::port::finish_drain(port, buf_ptr, buf_size, out_size_ptr);
                    self.task_mut(next).context.regs.eax = eax;
                    if let Some(sender) = wake_sender {
                        self.wake_locked(sender, Some(1));
                    }
                }
            }
        }
        self.task_mut(next).state = TaskState::Running;
    }

    fn resume_context(&self) -> TaskContext {
        if self.current == IDLE_PID { self.idle.context } else { self.task_ref(self.current).context }
    }

    fn do_tick(&mut self, regs: &IsrRegs) {
        if self.current != IDLE_PID {
            let pid = self.current;
            self.task_mut(pid).context.regs = *regs;
            self.task_mut(pid).state = TaskState::Ready;
            self.ready.push_back(pid);
        } else {
            self.idle.context.regs = *regs;
        }
        self.check_queue_integrity();
        self.reap_exited();
        let next = self.pick_next();
        self.switch_to(next);
    }

    fn wake_locked(&mut self, pid: i32, eax: Option<u32>) {
        assert!(
            (0..MAX_TASKS as i32).contains(&pid) && self.tasks[pid as usize].is_some(),
            "wake: unknown pid {pid}"
        );
        if let Some(pos) = self.sleeping.iter().position(|&p| p == pid) {
            self.sleeping.remove(pos);
            let task = self.task_mut(pid);
            if let Some(value) = eax {
                task.context.regs.eax = value;
            }
            task.wait_canrecv_port = INVALID_PORT;
            task.wait_cansend_port = INVALID_PORT;
            task.sleep_deadline = None;
            task.state = TaskState::Ready;
            self.ready.push_back(pid);
        }
        // Not being asleep is not an error: the target may already be
        // ready, running, or idle.
    }
}

// SAFETY: every field is a plain integer or value type; the struct carries
// no thread-unsafe interior pointers of its own.
unsafe impl Send for Scheduler {}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

static mut IDLE_STACK: [u8; 4096] = [0; 4096];

extern "C" fn idle_task_entry() -> ! {
    loop {
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    }
}

/// Registers the kernel task (pid 0, already running) and builds the idle
/// task. Must run once, after the VMM and heap are up.
pub fn init() {
    let mut guard = SCHEDULER.lock();
    let kernel_as = vmm::current_pagedir();

    guard.tasks[0] = Some(Task::new(0, "kernel", kernel_as, TaskContext::new_kernel(0, 0)));
    guard.task_mut(0).state = TaskState::Running;
    guard.current = 0;

    let idle_stack_top = unsafe { core::ptr::addr_of!(IDLE_STACK) as u32 } + 4096;
    guard.idle = Task::new(
        IDLE_PID,
        "idle",
        kernel_as,
        TaskContext::new_kernel(idle_task_entry as u32, idle_stack_top),
    );
    guard.idle.state = TaskState::Running;
}

/// Timer-tick entry point. Called from `arch::timer::on_tick` for every
/// IRQ0; the PIC must already have been sent its EOI by the time this runs,
/// since a switch here never returns to the caller.
pub fn tick(regs: &mut IsrRegs) {
    let mut guard = SCHEDULER.lock();
    guard.do_tick(regs);
    let ctx = guard.resume_context();
    drop(guard);
    unsafe { crate::arch::context::resume(&ctx) }
}

/// Voluntary reschedule (the `YIELD` syscall): requeues the caller exactly
/// like a timer tick would and resumes whatever runs next.
pub fn yield_now(regs: &IsrRegs) -> ! {
    let mut guard = SCHEDULER.lock();
    guard.do_tick(regs);
    let ctx = guard.resume_context();
    drop(guard);
    unsafe { crate::arch::context::resume(&ctx) }
}

pub fn current_pid() -> i32 {
    SCHEDULER.lock().current
}

pub fn current_address_space() -> u32 {
    let guard = SCHEDULER.lock();
    guard.task_ref(guard.current).address_space
}

pub fn set_current_name(name: &str) {
    let mut guard = SCHEDULER.lock();
    let pid = guard.current;
    guard.task_mut(pid).name.set(name);
}

pub fn task_info(pid: i32) -> Option<TaskInfo> {
    let guard = SCHEDULER.lock();
    if pid == IDLE_PID {
        return Some(TaskInfo {
            pid,
            name: *guard.idle.name.as_bytes_padded(),
            name_len: guard.idle.name.len(),
            state: guard.idle.state,
        });
    }
    let task = guard.tasks.get(pid as usize)?.as_ref()?;
    Some(TaskInfo {
        pid: task.pid,
        name: *task.name.as_bytes_padded(),
        name_len: task.name.len(),
        state: task.state,
    })
}

/// Creates a new task sharing `parent`'s trap frame with `eax` forced to 0
/// and a deep copy of its address space, and pushes it onto the ready
/// queue. The caller (the parent) keeps running — `fork` never switches.
pub fn fork(parent_regs: &IsrRegs) -> Result<i32, SchedError> {
    let mut guard = SCHEDULER.lock();
    let pid = guard.alloc_pid()?;
    let parent_pid = guard.current;
    let parent_name = guard.task_ref(parent_pid).name;
    drop(guard);

    let child_as = vmm::clone_pagedir().map_err(|_| SchedError::TaskTableFull)?;
    let mut child_ctx = TaskContext { regs: *parent_regs };
    child_ctx.set_return_value(0);

    let mut guard = SCHEDULER.lock();
    let mut child = Task::new(pid, parent_name.as_str(), child_as, child_ctx);
    child.state = TaskState::Ready;
    guard.tasks[pid as usize] = Some(child);
    guard.ready.push_back(pid);
    Ok(pid)
}

/// Maps a user stack into `pid`'s address space and overwrites its saved
/// context with a fresh ring-3 entry at `entry` (§4.4 `jump_to_usermode`).
/// The actual switch into ring 3 happens the next time the scheduler picks
/// `pid` through the ordinary tick/yield/blocking paths.
pub fn prepare_usermode_entry(pid: i32, entry: u32) -> Result<(), SchedError> {
    let mut guard = SCHEDULER.lock();
    let target_as = guard.task_ref(pid).address_space;
    let prev_as = vmm::current_pagedir();

    unsafe { vmm::switch_pagedir(target_as) }.map_err(|_| SchedError::TaskTableFull)?;
    let frame = crate::mm::frame_allocator::alloc_frame().map_err(|_| SchedError::TaskTableFull)?;
    let _ = vmm::map(USER_STACK_BOTTOM, frame, vmm::PTE_PRESENT | vmm::PTE_WRITABLE | vmm::PTE_USER);
    unsafe { vmm::switch_pagedir(prev_as) }.map_err(|_| SchedError::TaskTableFull)?;

    guard.task_mut(pid).context = TaskContext::new_usermode(
        entry,
        USER_STACK_TOP,
        gdt::USER_CODE_SEG as u32,
        gdt::USER_DATA_SEG as u32,
    );
    Ok(())
}

/// Adopts the calling task's own stored context immediately, without going
/// through a tick/yield/block first (§4.4 `jump_to_usermode`). The only
/// caller is bootstrap's child task, right after [`prepare_usermode_entry`]
/// has overwritten its context with a fresh ring-3 entry point — there is no
/// trap frame from this task worth saving, since it never ran in user mode
/// before this call.
pub fn resume_self() -> ! {
    let guard = SCHEDULER.lock();
    let ctx = guard.resume_context();
    drop(guard);
    unsafe { crate::arch::context::resume(&ctx) }
}

/// Terminates the running task: moves it to the exited queue (reaped by
/// this same call) and switches away. Never returns.
pub fn exit_current(regs: &IsrRegs) -> ! {
    let mut guard = SCHEDULER.lock();
    let pid = guard.current;
    guard.task_mut(pid).context.regs = *regs;
    guard.task_mut(pid).state = TaskState::Exited;
    guard.exited.push_back(pid);
    guard.check_queue_integrity();
    guard.reap_exited();
    let next = guard.pick_next();
    guard.switch_to(next);
    let ctx = guard.resume_context();
    drop(guard);
    unsafe { crate::arch::context::resume(&ctx) }
}

/// Blocks the running task with the given wait conditions and deferred
/// completion, then switches away. Never returns to the caller directly —
/// the task resumes later, elsewhere, via [`wake`]/[`wake_with_value`].
pub fn block_current(
    regs: &IsrRegs,
    wait_canrecv_port: i32,
    wait_cansend_port: i32,
    sleep_deadline: Option<u64>,
    pending_completion: Option<PendingCompletion>,
) -> ! {
    let mut guard = SCHEDULER.lock();
    let pid = guard.current;
    {
        let task = guard.task_mut(pid);
        task.context.regs = *regs;
        task.state = TaskState::Sleeping;
        task.wait_canrecv_port = wait_canrecv_port;
        task.wait_cansend_port = wait_cansend_port;
        task.sleep_deadline = sleep_deadline;
        task.pending_completion = pending_completion;
    }
    guard.sleeping.push_back(pid);
    guard.check_queue_integrity();
    guard.reap_exited();
    let next = guard.pick_next();
    guard.switch_to(next);
    let ctx = guard.resume_context();
    drop(guard);
    unsafe { crate::arch::context::resume(&ctx) }
}

/// Blocks the running task for at least `ms` milliseconds.
pub fn sleep_current(regs: &IsrRegs, ms: u64) -> ! {
    let deadline = timer::now_ms() + ms;
    block_current(regs, INVALID_PORT, INVALID_PORT, Some(deadline), None)
}

/// Moves `pid` from sleeping to ready, setting its return value to 0. Fatal
/// if `pid` has never existed; harmless if it isn't currently sleeping.
pub fn wake(pid: i32) {
    SCHEDULER.lock().wake_locked(pid, Some(0));
}

/// Like [`wake`] but sets a specific return value — used to complete a
/// rendezvous (e.g. waking a blocked sender once its message is dequeued).
pub fn wake_with_value(pid: i32, value: u32) {
    SCHEDULER.lock().wake_locked(pid, Some(value));
}

/// Clears `wait_cansend_port` on every sleeper waiting for `port`.
///
/// In this port implementation a sender only ever blocks on
/// `wait_cansend_port` while the port doesn't exist yet, and its message
/// has already been staged in `ipc::port`'s pending-sends table by the time
/// it blocks — so there is nothing left to schedule here beyond clearing
/// the field once the port exists; the sender stays asleep until its
/// message is dequeued, exactly like the already-existing-port case.
pub fn wake_cansend(port: i32) {
    let mut guard = SCHEDULER.lock();
    let matching: Vec<i32> = guard
        .sleeping
        .iter()
        .copied()
        .filter(|&pid| guard.task_ref(pid).wait_cansend_port == port)
        .collect();
    for pid in matching {
        guard.task_mut(pid).wait_cansend_port = INVALID_PORT;
    }
}
