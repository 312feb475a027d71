//! `print!`/`println!` macros, aliased onto the serial port.
//!
//! There is no VGA text-mode driver here (that's a driver-layer concern, out
//! of scope); serial is the only console this kernel has.

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::serial::_serial_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
