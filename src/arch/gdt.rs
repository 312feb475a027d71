//! Global descriptor table: kernel/user code+data segments and the TSS.
//!
//! Selector values match the original kernel's `gdt.h` exactly, since the
//! trap frame's `cs`/`ds` fields and the syscall path both depend on them.

use core::mem::size_of;

pub const KERNEL_CODE_SEG: u16 = 0x08;
pub const KERNEL_DATA_SEG: u16 = 0x10;
pub const USER_CODE_SEG: u16 = 0x18 | 3; // RPL3
pub const USER_DATA_SEG: u16 = 0x20 | 3;
pub const TSS_SEG: u16 = 0x28;

#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self { limit_low: 0, base_low: 0, base_mid: 0, access: 0, granularity: 0, base_high: 0 }
    }

    const fn flat(access: u8, granularity: u8) -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_mid: 0,
            access,
            granularity: granularity | 0x0F,
            base_high: 0,
        }
    }

    fn tss(base: u32, limit: u32) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access: 0x89, // present, ring 0, 32-bit TSS (available)
            granularity: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

/// 32-bit TSS. Only `esp0`/`ss0` are used — ring transitions are the only
/// thing this kernel needs a hardware task-state segment for.
#[repr(C, packed)]
#[derive(Default)]
pub struct Tss {
    pub prev_tss: u32,
    pub esp0: u32,
    pub ss0: u32,
    _rest: [u32; 23],
    _iomap_base: u16,
}

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

const GDT_ENTRIES: usize = 6;

static mut GDT: [GdtEntry; GDT_ENTRIES] = [
    GdtEntry::null(),
    GdtEntry::flat(0x9A, 0xC0), // kernel code
    GdtEntry::flat(0x92, 0xC0), // kernel data
    GdtEntry::flat(0xFA, 0xC0), // user code
    GdtEntry::flat(0xF2, 0xC0), // user data
    GdtEntry::null(),           // TSS, patched in at init()
];

static mut TSS: Tss = Tss { prev_tss: 0, esp0: 0, ss0: 0, _rest: [0; 23], _iomap_base: 0 };

/// Builds the GDT/TSS and loads them. Must run once, early, before any
/// ring-3 transition.
///
/// # Safety
/// Must run with interrupts disabled and exactly once; mutates the
/// processor-global GDTR/TR.
pub unsafe fn init() {
    unsafe {
        TSS.ss0 = KERNEL_DATA_SEG as u32;
        let tss_base = core::ptr::addr_of!(TSS) as u32;
        GDT[5] = GdtEntry::tss(tss_base, size_of::<Tss>() as u32 - 1);

        let pointer = GdtPointer {
            limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
            base: core::ptr::addr_of!(GDT) as u32,
        };
        load(&pointer);
        load_tss();
    }
}

/// Updates the kernel stack pointer used on the next ring3→ring0 transition.
/// Called on every context switch (§4.7).
pub fn set_kernel_stack(esp0: u32) {
    unsafe {
        TSS.esp0 = esp0;
    }
}

unsafe fn load(pointer: &GdtPointer) {
    unsafe {
        core::arch::asm!(
            "lgdt [{0}]",
            "mov ax, {1:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            in(reg) pointer,
            in(reg) KERNEL_DATA_SEG,
            out("ax") _,
        );
    }
}

unsafe fn load_tss() {
    unsafe {
        core::arch::asm!("ltr ax", in("ax") TSS_SEG, options(nostack, preserves_flags));
    }
}
