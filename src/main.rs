#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use nucleus_kernel::arch::{gdt, idt, multiboot, pic, reboot, timer};
use nucleus_kernel::arch::multiboot::MultibootInfo;
use nucleus_kernel::{bootstrap, initrd, mm, sched, serial, serial_println, syscall};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[KERNEL PANIC] {}", info);
    reboot::reboot();
}

/// Entry point called from the assembly stub in `arch::boot`, with `ebx`
/// holding the multiboot info pointer and `eax` the multiboot magic.
///
/// # Safety
/// `multiboot_magic`/`multiboot_info` must be exactly what GRUB placed in
/// `eax`/`ebx` at kernel entry; this function must run exactly once, before
/// any interrupt is enabled.
#[no_mangle]
pub unsafe extern "C" fn kernel_main(multiboot_magic: u32, multiboot_info: *const MultibootInfo) -> ! {
    serial::init();
    serial_println!("nucleus-kernel booting (multiboot magic {:#x})", multiboot_magic);

    unsafe {
        gdt::init();
        idt::init();
        pic::init();

        let info = &*multiboot_info;
        let regions: alloc::vec::Vec<_> = multiboot::available_regions(info).collect();
        mm::init(&regions);
        initrd::init(info);
    }

    sched::init();
    syscall::init();
    unsafe { timer::init() };

    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }

    bootstrap::start();
}
