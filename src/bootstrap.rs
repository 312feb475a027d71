//! Kernel bootstrap sequence (§1B), the Rust port of the original's
//! `kernel_task_entry`.
//!
//! `start` is the pid-0 task's own entry point: it opens the reserved kernel
//! port, forks, and splits in two. The child loads and jumps to `init.elf`
//! from the initrd; the parent never returns from user mode (pid 0 always
//! stays in the kernel) and instead spends the rest of its life answering
//! RPCs sent to the kernel port.
//!
//! Both `fork` and the blocking `msgrecv` loop need a genuine trap frame to
//! suspend into — there is no "resume this Rust stack frame later" here, a
//! blocked task only ever comes back via [`crate::arch::context::resume`]
//! loading a fresh register snapshot. So, like the original, this calls
//! through the real syscall trap ([`crate::syscall::syscall`]) for those two
//! operations instead of calling the scheduler/IPC layers directly.

extern crate alloc;

use crate::elf;
use crate::initrd;
use crate::ipc::port::{self, KERNEL_PORT};
use crate::sched::scheduler;
use crate::syscall;

/// Message `code` the parent recognizes on the kernel port (§1B design
/// note): a kernel-local RPC convention, not part of the §6 wire format.
const KERNEL_RPC_REBOOT: u32 = 1;

const INIT_FILE: &str = "init.elf";

/// Runs as the body of pid 0. Never returns.
pub fn start() -> ! {
    let owner = scheduler::current_pid();
    let opened = port::port_open(owner, KERNEL_PORT);
    if opened != KERNEL_PORT {
        panic!("bootstrap: failed to open KernelPort");
    }

    let pid = unsafe { syscall::syscall(syscall::FORK, 0, 0, 0, 0, 0) };
    if pid == 0 {
        child_init();
    }

    parent_rpc_loop();
}

/// Child branch: loads `init.elf` from the initrd and jumps to it in user
/// mode. Never returns.
fn child_init() -> ! {
    scheduler::set_current_name(INIT_FILE);
    let data = initrd::read_file(INIT_FILE).expect("bootstrap: init.elf missing from initrd");
    let entry = elf::load_elf(&data).expect("bootstrap: init.elf failed to load");

    let pid = scheduler::current_pid();
    scheduler::prepare_usermode_entry(pid, entry).expect("bootstrap: failed to prepare init task");
    scheduler::resume_self();
}

/// Parent branch (pid 0): dispatches kernel-port RPCs forever. `GETTASKINFO`
/// is exposed directly as its own syscall (§1B design note) rather than
/// routed through this port, so the only RPC handled here is `REBOOT`.
fn parent_rpc_loop() -> ! {
    let mut buf = [0u8; crate::ipc::message::HEADER_SIZE];
    let mut out_size: u32 = 0;
    loop {
        let buf_ptr = buf.as_mut_ptr() as u32;
        let out_size_ptr = core::ptr::addr_of_mut!(out_size) as u32;
        let status = unsafe {
            syscall::syscall(
                syscall::MSGRECV,
                KERNEL_PORT as u32,
                buf_ptr,
                buf.len() as u32,
                out_size_ptr,
                0,
            )
        };
        if status != 0 {
            continue;
        }
        let code = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if code == KERNEL_RPC_REBOOT {
            unsafe { syscall::syscall(syscall::REBOOT, 0, 0, 0, 0, 0) };
        }
    }
}
