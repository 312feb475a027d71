//! 8259 PIC remap and end-of-interrupt contract.
//!
//! The core specification treats the PIC driver as an external contract
//! (§1 non-goals); `pic8259` does the actual remap/mask/EOI sequencing.

use pic8259::ChainedPics;
use spin::Mutex;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// # Safety
/// Must run once, early, before unmasking interrupts.
pub unsafe fn init() {
    unsafe {
        PICS.lock().initialize();
    }
}

pub fn notify_end_of_interrupt(vector: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
