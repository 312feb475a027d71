//! System call dispatch (§4.6/§6): one shared trap vector, a syscall number
//! in `eax`, up to five word arguments in `ebx`/`ecx`/`edx`/`esi`/`edi`, and
//! a return value written back into `eax` before `iret` — mirroring the
//! original kernel's `syscall_handler.c` register convention exactly.

extern crate alloc;
use alloc::string::String;

use crate::arch::idt::{self, IsrRegs};
use crate::arch::reboot;
use crate::elf;
use crate::initrd;
use crate::ipc::port;
use crate::mm::frame_allocator;
use crate::mm::vmm;
use crate::sched::scheduler;
use crate::sched::task::{TaskState, TASK_NAME_MAX, USER_STACK_BOTTOM, USER_STACK_TOP};

pub const SYSCALL_VECTOR: u8 = 0x80;

pub const EXIT: u32 = 0;
pub const PORTOPEN: u32 = 1;
pub const MSGSEND: u32 = 2;
pub const MSGRECV: u32 = 3;
pub const MSGWAIT: u32 = 4;
pub const MSGPEEK: u32 = 5;
pub const YIELD: u32 = 6;
pub const FORK: u32 = 7;
pub const SETNAME: u32 = 8;
pub const SLEEP: u32 = 9;
pub const REBOOT: u32 = 10;
pub const EXEC: u32 = 11;
pub const GETTASKINFO: u32 = 12;
pub const INITRD_SIZE: u32 = 13;
pub const INITRD_READ: u32 = 14;

const EFLAGS_IF: u32 = 1 << 9;

/// Wire layout of the `GETTASKINFO` output buffer: `pid:i32, state:u32,
/// name_len:u8, name:[u8; TASK_NAME_MAX]`. Not part of the inter-task
/// message format (§6) — this is a syscall-local ABI, since the spec leaves
/// the exact encoding of `{pid, name, state}` unspecified.
const TASK_INFO_SIZE: u32 = 4 + 4 + 1 + TASK_NAME_MAX as u32;

/// Installs the syscall trap gate. Must run once, after the IDT is loaded.
pub fn init() {
    idt::install(SYSCALL_VECTOR, dispatch, true);
}

/// Issues the syscall trap directly, the way the original kernel's own
/// `kernel_task` calls `syscall(SYSCALL_FORK, ...)` from ring 0 rather than
/// duplicating the scheduler/IPC logic for a kernel-mode caller. `int`
/// requires only `CPL <= gate DPL`, and the gate is installed with DPL 3, so
/// this is as legal from ring 0 as it is from ring 3.
///
/// # Safety
/// Relies on the shared ISR entry stub (a driver-layer concern outside this
/// core) having pushed a well-formed [`IsrRegs`] before calling
/// [`dispatch`]; not meaningful to call before `init` has installed the gate.
pub unsafe fn syscall(num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> u32 {
    let result: u32;
    unsafe {
        core::arch::asm!(
            "int 0x80",
            inout("eax") num => result,
            in("ebx") a1,
            in("ecx") a2,
            in("edx") a3,
            in("esi") a4,
            in("edi") a5,
        );
    }
    result
}

/// Reads a NUL-terminated string out of user space, capped at `max_len`
/// bytes excluding the terminator — mirrors `strlcpy` into a fixed buffer,
/// the pattern the original syscall handlers use to copy a filename out
/// before it can be garbled by unmapping the caller's own memory.
///
/// # Safety
/// `ptr` must point at a NUL-terminated (or `max_len`-bounded) byte string
/// in the currently active address space.
unsafe fn read_c_string(ptr: u32, max_len: usize) -> String {
    let base = ptr as *const u8;
    let mut bytes = alloc::vec::Vec::with_capacity(max_len);
    for i in 0..max_len {
        let b = unsafe { core::ptr::read(base.add(i)) };
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// `EXEC`: replaces the current task's image in place. On a missing file,
/// leaves the caller untouched and returns 0; a malformed ELF in the initrd
/// is a data-corruption condition, not a recoverable one, and panics like
/// the original's header asserts (§7).
fn sys_exec(regs: &mut IsrRegs) {
    let filename = unsafe { read_c_string(regs.ebx, 63) };

    let Some(data) = initrd::read_file(&filename) else {
        regs.eax = 0;
        return;
    };

    let mut va = 0u32;
    while va < USER_STACK_BOTTOM {
        if let Some(pa) = vmm::get_physical(va) {
            let _ = vmm::unmap(va);
            let _ = frame_allocator::free_frame(pa);
        }
        va += crate::mm::PAGE_SIZE as u32;
    }

    let entry = elf::load_elf(&data).expect("exec: malformed ELF image in initrd");

    scheduler::set_current_name(&filename);
    regs.esp = USER_STACK_TOP;
    regs.useresp = USER_STACK_TOP;
    regs.eflags |= EFLAGS_IF;
    regs.eip = entry;
    regs.eax = 0;
}

/// `GETTASKINFO`: encodes `{pid, state, name}` into the caller's buffer.
fn sys_gettaskinfo(regs: &mut IsrRegs) {
    let pid = regs.ebx as i32;
    let buf_ptr = regs.ecx;
    let buf_size = regs.edx;

    let Some(info) = scheduler::task_info(pid) else {
        regs.eax = 1;
        return;
    };
    if buf_size < TASK_INFO_SIZE {
        regs.eax = 2;
        return;
    }

    let state_code: u32 = match info.state {
        TaskState::Ready => 0,
        TaskState::Running => 1,
        TaskState::Sleeping => 2,
        TaskState::Exited => 3,
    };

    unsafe {
        let base = buf_ptr as *mut u8;
        core::ptr::copy_nonoverlapping(info.pid.to_le_bytes().as_ptr(), base, 4);
        core::ptr::copy_nonoverlapping(state_code.to_le_bytes().as_ptr(), base.add(4), 4);
        core::ptr::write(base.add(8), info.name_len);
        core::ptr::copy_nonoverlapping(info.name.as_ptr(), base.add(9), TASK_NAME_MAX);
    }
    regs.eax = 0;
}

/// Dispatches one trap through the syscall table. Several branches (`EXIT`,
/// `YIELD`, `SLEEP`, `REBOOT`, and the blocking paths inside `MSGSEND`/
/// `MSGRECV`/`MSGWAIT`) never return — the trap frame they were given is
/// consumed by a context switch instead of an `iret` back through here.
fn dispatch(regs: &mut IsrRegs) {
    let num = regs.eax;
    let current = scheduler::current_pid();

    match num {
        EXIT => scheduler::exit_current(regs),
        PORTOPEN => {
            let requested = regs.ebx as i32;
            regs.eax = port::port_open(current, requested) as u32;
        }
        MSGSEND => {
            let msg_port = regs.ebx as i32;
            let msg_ptr = regs.ecx;
            regs.eax = port::msgsend(regs, current, msg_port, msg_ptr);
        }
        MSGRECV => {
            let msg_port = regs.ebx as i32;
            let buf_ptr = regs.ecx;
            let buf_size = regs.edx;
            let out_size_ptr = regs.esi;
            regs.eax = port::msgrecv(regs, current, msg_port, buf_ptr, buf_size, out_size_ptr);
        }
        MSGWAIT => {
            let msg_port = regs.ebx as i32;
            regs.eax = port::msgwait(regs, current, msg_port);
        }
        MSGPEEK => {
            let msg_port = regs.ebx as i32;
            regs.eax = port::msgpeek(current, msg_port);
        }
        YIELD => scheduler::yield_now(regs),
        FORK => {
            regs.eax = match scheduler::fork(regs) {
                Ok(pid) => pid as u32,
                Err(_) => u32::MAX,
            };
        }
        SETNAME => {
            let name = unsafe { read_c_string(regs.ebx, TASK_NAME_MAX - 1) };
            scheduler::set_current_name(&name);
            regs.eax = 0;
        }
        SLEEP => scheduler::sleep_current(regs, regs.ebx as u64),
        REBOOT => reboot::reboot(),
        EXEC => sys_exec(regs),
        GETTASKINFO => sys_gettaskinfo(regs),
        INITRD_SIZE => regs.eax = initrd::size(),
        INITRD_READ => {
            let offset = regs.ebx;
            let buf_ptr = regs.ecx;
            let len = regs.edx;
            regs.eax = unsafe { initrd::read(offset, buf_ptr, len) } as u32;
        }
        _ => panic!("unknown syscall number {num}"),
    }
}
