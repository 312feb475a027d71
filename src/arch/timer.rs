//! PIT-driven millisecond tick.
//!
//! Like the PIC, programming the 8253/8254 is a driver contract (non-goal);
//! what matters to the rest of the kernel is the fixed tick period and a
//! monotonically increasing tick counter the scheduler reads for deadlines.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{idt::IsrRegs, pic};

/// Matches the original kernel's scheduler tick period exactly (§2).
pub const TICK_MS: u64 = 50;

pub const TIMER_VECTOR: u8 = pic::PIC_1_OFFSET; // IRQ0

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Milliseconds of wall-clock time elapsed since boot.
pub fn now_ms() -> u64 {
    TICKS.load(Ordering::Acquire) * TICK_MS
}

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn on_tick(regs: &mut IsrRegs) {
    TICKS.fetch_add(1, Ordering::AcqRel);
    // `scheduler::tick` resumes some task and never returns, so the EOI has
    // to go out first or IRQ0 is never acknowledged again.
    pic::notify_end_of_interrupt(TIMER_VECTOR);
    crate::sched::scheduler::tick(regs);
}

/// # Safety
/// Must run once, with interrupts still disabled, after [`pic::init`].
pub unsafe fn init() {
    crate::arch::idt::install(TIMER_VECTOR, on_tick, false);
}
