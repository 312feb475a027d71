//! Task control block (§3 data model): the state the scheduler and IPC layer
//! share about one schedulable entity.

use crate::arch::context::TaskContext;

pub const INVALID_PID: i32 = -1;
pub const INVALID_PORT: i32 = -1;

/// The original kernel's `encountered_pids` queue-integrity check is a
/// 64-bit bitmap; keeping the task table this size lets a `pid` double as
/// both the table index and the bitmap bit.
pub const MAX_TASKS: usize = 64;

pub const TASK_NAME_MAX: usize = 32;

/// Virtual-address layout shared by every address space (§3). Only the
/// backing physical frame differs between tasks — the window itself is
/// part of the ABI and never moves.
pub const USER_STACK_BOTTOM: u32 = 0xC000_0000 - 0x4000;
pub const USER_STACK_TOP: u32 = 0xC000_0000 - 0x3000;
pub const KERNEL_STACK_BOTTOM: u32 = 0xC000_0000 - 0x2000;
pub const KERNEL_STACK_TOP: u32 = 0xC000_0000 - 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    Exited,
}

/// Fixed-size task name, mirroring the original kernel's `char name[32]`
/// rather than reaching for a heap-backed `String` — `SETNAME`/
/// `GETTASKINFO` both copy it as a raw fixed-width field.
#[derive(Clone, Copy)]
pub struct TaskName {
    bytes: [u8; TASK_NAME_MAX],
    len: u8,
}

impl TaskName {
    pub const fn empty() -> Self {
        Self { bytes: [0u8; TASK_NAME_MAX], len: 0 }
    }

    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; TASK_NAME_MAX];
        let len = s.len().min(TASK_NAME_MAX);
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self { bytes, len: len as u8 }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn set(&mut self, s: &str) {
        *self = Self::new(s);
    }

    /// The raw fixed-width buffer, for copying into `GETTASKINFO`'s reply.
    pub fn as_bytes_padded(&self) -> &[u8; TASK_NAME_MAX] {
        &self.bytes
    }

    pub fn len(&self) -> u8 {
        self.len
    }
}

/// Work deferred until this task is actually resumed and its address space
/// is live — finishing it means touching the task's own user memory, which
/// is only safe once `cr3` points at that task's page directory again (see
/// `scheduler::switch_to`).
#[derive(Clone, Copy)]
pub enum PendingCompletion {
    /// A message arrived for a port we were blocked receiving on: dequeue it
    /// into our buffer (or report buffer-too-small) and set our return value.
    DrainPort { port: i32, buf_ptr: u32, buf_size: u32, out_size_ptr: u32 },
}

pub struct Task {
    pub pid: i32,
    pub name: TaskName,
    pub address_space: u32,
    pub context: TaskContext,
    pub state: TaskState,
    pub wait_canrecv_port: i32,
    pub wait_cansend_port: i32,
    pub sleep_deadline: Option<u64>,
    pub pending_completion: Option<PendingCompletion>,
}

impl Task {
    pub fn new(pid: i32, name: &str, address_space: u32, context: TaskContext) -> Self {
        Self {
            pid,
            name: TaskName::new(name),
            address_space,
            context,
            state: TaskState::Ready,
            wait_canrecv_port: INVALID_PORT,
            wait_cansend_port: INVALID_PORT,
            sleep_deadline: None,
            pending_completion: None,
        }
    }
}
