//! Port registry: single-receiver, multi-sender, synchronous FIFO ports
//! (§4.5), adapted to the trap-frame context-switch model.
//!
//! The spec's `msgsend` blocks on `wait_cansend_port` until a missing port
//! is created, then resumes the same call to finish enqueuing. There is no
//! "resume the same call" here — a blocked task only ever comes back via
//! [`crate::arch::context::resume`] loading a fresh register snapshot, never
//! by continuing a suspended Rust stack frame. So a sender does all of its
//! work — checksum verification, the kernel-heap copy, stamping its own pid
//! in — *before* blocking, for both branches:
//!
//! - if the port already exists, the message is enqueued immediately and the
//!   sender blocks only on the rendezvous (woken by the matching `msgrecv`);
//! - if the port doesn't exist yet, the already-prepared message is stashed
//!   in [`PENDING_SENDS`] keyed by port number; [`port_open`] drains it
//!   straight into the new port's queue. The sender is never separately
//!   woken for "port now exists" — it stays asleep until a future `msgrecv`
//!   dequeues this exact message, which is the same rendezvous wakeup an
//!   already-existing-port send would have gotten. The net effect matches
//!   the spec: `msgsend` only returns once `msgrecv` has consumed it.
//!
//! A receiver blocked in `msgrecv` on an empty queue is resumed by the
//! scheduler itself: [`finish_drain`] runs once `cr3` is already switched to
//! the receiver (see `sched::scheduler::switch_to`), because only then is it
//! safe to write into the receiver's own buffer.

extern crate alloc;
use alloc::collections::{BTreeMap, VecDeque};

use spin::Mutex;

use crate::arch::idt::IsrRegs;
use crate::error::IpcError;
use crate::sched::scheduler;
use crate::sched::task::{PendingCompletion, INVALID_PORT};

use super::message::KernelMessage;

pub const RESERVED_PORT_COUNT: i32 = 32;
pub const FIRST_DYNAMIC_PORT: i32 = 32;

/// Well-known reserved ports (§6): the logger and the kernel RPC port.
pub const LOGGER_PORT: i32 = 1;
pub const KERNEL_PORT: i32 = 2;

struct PortEntry {
    receiver: i32,
    queue: VecDeque<KernelMessage>,
}

struct Registry {
    ports: BTreeMap<i32, PortEntry>,
    pending_sends: BTreeMap<i32, VecDeque<KernelMessage>>,
    reserved_mask: u32,
    next_dynamic: i32,
}

impl Registry {
    const fn new() -> Self {
        Self {
            ports: BTreeMap::new(),
            pending_sends: BTreeMap::new(),
            reserved_mask: 0,
            next_dynamic: FIRST_DYNAMIC_PORT,
        }
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// `PORTOPEN`: `requested = INVALID_PORT` assigns the next dynamic number;
/// `0..32` claims a specific reserved number once; anything else fails.
pub fn port_open(owner: i32, requested: i32) -> i32 {
    let mut reg = REGISTRY.lock();

    let number = if requested == INVALID_PORT {
        let n = reg.next_dynamic;
        reg.next_dynamic += 1;
        n
    } else if (0..RESERVED_PORT_COUNT).contains(&requested) {
        let bit = 1u32 << requested;
        if reg.reserved_mask & bit != 0 {
            return -1;
        }
        reg.reserved_mask |= bit;
        requested
    } else {
        return -1;
    };

    let queue = reg.pending_sends.remove(&number).unwrap_or_default();
    reg.ports.insert(number, PortEntry { receiver: owner, queue });
    drop(reg);

    // Cosmetic: clears any `wait_cansend_port == number` bookkeeping on
    // sleepers. In this design those senders are already asleep on a plain
    // rendezvous wait and don't need waking here — see the module doc.
    scheduler::wake_cansend(number);
    number
}

/// `MSGSEND`, verifying the sender's checksum and staging the message.
/// Returns `0` synchronously on a bad checksum/oversized message; otherwise
/// diverges into a block, resuming later via a rendezvous wake once
/// `msgrecv` consumes the message.
pub fn msgsend(regs: &IsrRegs, sender: i32, port: i32, msg_ptr: u32) -> u32 {
    let msg = match unsafe { KernelMessage::read_from_user(msg_ptr, sender) } {
        Ok(msg) => msg,
        Err(IpcError::ChecksumMismatch) | Err(IpcError::MessageTooLarge { .. }) => return 0,
        Err(_) => unreachable!("read_from_user only returns the two errors matched above"),
    };

    let mut reg = REGISTRY.lock();
    if let Some(entry) = reg.ports.get_mut(&port) {
        entry.queue.push_back(msg);
        let receiver = entry.receiver;
        drop(reg);
        scheduler::wake(receiver);
        scheduler::block_current(regs, INVALID_PORT, INVALID_PORT, None, None)
    } else {
        reg.pending_sends.entry(port).or_default().push_back(msg);
        drop(reg);
        scheduler::block_current(regs, INVALID_PORT, port, None, None)
    }
}

/// Delivers the head of `queue` into a receiver's buffer if it fits.
/// Returns `(return_code, sender_to_wake)`; `sender_to_wake` is only
/// `Some` when a message was actually dequeued.
///
/// # Safety
/// `buf_ptr`/`out_size_ptr` must be valid in the currently active address
/// space — the caller's own, for the synchronous path, or the receiver's,
/// for the deferred [`finish_drain`] path.
unsafe fn deliver_head(
    queue: &mut VecDeque<KernelMessage>,
    buf_ptr: u32,
    buf_size: u32,
    out_size_ptr: u32,
) -> (u32, Option<i32>) {
    let msg = queue.front().expect("deliver_head called on an empty queue");
    assert_eq!(
        msg.checksum,
        msg.recomputed_checksum(),
        "in-kernel IPC message corrupted between enqueue and dequeue"
    );

    let required = msg.encoded_len() as u32;
    unsafe {
        core::ptr::write(out_size_ptr as *mut u32, required);
    }
    if buf_size < required {
        return (3, None);
    }

    let msg = queue.pop_front().unwrap();
    unsafe {
        msg.encode_into(buf_ptr, buf_size).expect("buffer already checked to fit");
    }
    (0, Some(msg.sender))
}

/// `MSGRECV`. Returns directly for the bad-port/not-receiver/non-blocking
/// cases; diverges via [`scheduler::block_current`] when the queue is
/// empty, resuming later through [`finish_drain`].
pub fn msgrecv(regs: &IsrRegs, receiver: i32, port: i32, buf_ptr: u32, buf_size: u32, out_size_ptr: u32) -> u32 {
    let mut reg = REGISTRY.lock();
    let Some(entry) = reg.ports.get_mut(&port) else { return 1 };
    if entry.receiver != receiver {
        return 2;
    }

    if entry.queue.is_empty() {
        drop(reg);
        scheduler::wake_cansend(port);
        return scheduler::block_current(
            regs,
            port,
            INVALID_PORT,
            None,
            Some(PendingCompletion::DrainPort { port, buf_ptr, buf_size, out_size_ptr }),
        );
    }

    let (code, wake_sender) = unsafe { deliver_head(&mut entry.queue, buf_ptr, buf_size, out_size_ptr) };
    drop(reg);
    if let Some(sender) = wake_sender {
        scheduler::wake_with_value(sender, 1);
    }
    code
}

/// Runs the deferred completion for a task the scheduler just resumed,
/// once its address space (and therefore `buf_ptr`/`out_size_ptr`) is live.
/// Called only from `sched::scheduler::switch_to`.
pub fn finish_drain(port: i32, buf_ptr: u32, buf_size: u32, out_size_ptr: u32) -> (u32, Option<i32>) {
    let mut reg = REGISTRY.lock();
    let Some(entry) = reg.ports.get_mut(&port) else {
        // The receiver's own port cannot vanish out from under it — ports
        // are never destroyed (§9) — so an empty queue here would mean a
        // spurious wake, not a missing port.
        panic!("finish_drain: port {port} vanished while its receiver was blocked on it");
    };
    if entry.queue.is_empty() {
        panic!("finish_drain: port {port} woke its receiver with nothing queued");
    }
    unsafe { deliver_head(&mut entry.queue, buf_ptr, buf_size, out_size_ptr) }
}

/// `MSGWAIT`: blocks until the queue is non-empty, without dequeuing.
pub fn msgwait(regs: &IsrRegs, receiver: i32, port: i32) -> u32 {
    let mut reg = REGISTRY.lock();
    let Some(entry) = reg.ports.get_mut(&port) else { return u32::MAX };
    if entry.receiver != receiver {
        return u32::MAX;
    }
    if !entry.queue.is_empty() {
        return 0;
    }
    drop(reg);
    scheduler::block_current(regs, port, INVALID_PORT, None, None)
}

/// `MSGPEEK`: true iff the caller is the receiver and the queue is non-empty.
pub fn msgpeek(receiver: i32, port: i32) -> u32 {
    let reg = REGISTRY.lock();
    match reg.ports.get(&port) {
        Some(entry) if entry.receiver == receiver => u32::from(!entry.queue.is_empty()),
        _ => 0,
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    fn msg(sender: i32, code: u32, data: &[u8]) -> KernelMessage {
        KernelMessage {
            checksum: 0,
            sender,
            reply_port: INVALID_PORT,
            code,
            data: vec::Vec::from(data),
        }
    }

    #[test]
    fn reserved_port_collision_is_rejected() {
        let mut reg = Registry::new();
        let bit = 1u32 << 5;
        assert_eq!(reg.reserved_mask & bit, 0);
        reg.reserved_mask |= bit;
        assert_ne!(reg.reserved_mask & bit, 0);
    }

    #[test]
    fn fifo_ordering_within_a_port() {
        let mut queue: VecDeque<KernelMessage> = VecDeque::new();
        queue.push_back(msg(2, 1, b"a"));
        queue.push_back(msg(2, 2, b"b"));
        assert_eq!(queue.pop_front().unwrap().code, 1);
        assert_eq!(queue.pop_front().unwrap().code, 2);
    }
}
