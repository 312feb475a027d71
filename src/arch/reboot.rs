//! Hardware reboot via the keyboard controller (§6 "Exit codes / fatal
//! conditions": panics and the `REBOOT` syscall both end up here).

use x86::io::{inb, outb};

const KBD_STATUS_PORT: u16 = 0x64;
const KBD_COMMAND_PORT: u16 = 0x64;
const KBD_INPUT_FULL: u8 = 1 << 1;
const PULSE_RESET_LINE: u8 = 0xFE;

/// Pulses the 8042 keyboard controller's reset line. Never returns: if the
/// controller doesn't respond, falls back to halting forever rather than
/// continuing execution in an undefined state.
pub fn reboot() -> ! {
    unsafe {
        while inb(KBD_STATUS_PORT) & KBD_INPUT_FULL != 0 {}
        outb(KBD_COMMAND_PORT, PULSE_RESET_LINE);
    }
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
