//! Nucleus kernel core: a 32-bit x86 preemptive microkernel providing
//! virtual memory, a trap-frame-driven scheduler, and port-based IPC.
//!
//! Built as a library so the host (`cargo test`) target can exercise the
//! allocator-independent pieces with the system allocator, while the
//! bare-metal binary (`src/main.rs`) uses [`mm::heap::KernelHeap`] instead.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(target_os = "none")]
use mm::heap::KernelHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap;

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
#[cfg(target_os = "none")]
mod intrinsics;
pub mod bootstrap;
pub mod elf;
pub mod error;
pub mod initrd;
pub mod ipc;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod syscall;

/// Heap allocation failure is unrecoverable this early in boot; the
/// `alloc_error_handler` ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
