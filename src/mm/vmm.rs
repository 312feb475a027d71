//! Recursive-mapping virtual memory manager.
//!
//! Grounded directly on the original kernel's `vmm.c`: page directory entry
//! 1023 always maps the directory to itself, which is what lets
//! [`transient_map`] and [`clone_pagetable`] reach arbitrary physical frames
//! without a separate physical-memory window.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::VmmError;
use crate::mm::{frame_allocator, PAGE_SIZE};

pub const PTE_PRESENT: u32 = 1 << 0;
pub const PTE_WRITABLE: u32 = 1 << 1;
pub const PTE_USER: u32 = 1 << 2;
pub const PTE_WRITETHROUGH: u32 = 1 << 3;
pub const PTE_NOT_CACHEABLE: u32 = 1 << 4;
pub const PTE_ACCESSED: u32 = 1 << 5;
pub const PTE_DIRTY: u32 = 1 << 6;

const ENTRIES_PER_TABLE: usize = 1024;
const RECURSIVE_MAPPING_PDE: usize = 1023;
const KERNEL_PDE_START: usize = 768;
const KERNEL_PDE_END: usize = 1022;
const USER_PDE_START: usize = 0;
const USER_PDE_END: usize = 767;

const RECURSIVE_BASE: u32 = 0xFFC0_0000;
const DIRECTORY_VA: u32 = 0xFFFF_F000;

fn page_directory_index(va: u32) -> usize {
    (va >> 22) as usize
}

fn page_table_index(va: u32) -> usize {
    ((va >> 12) & 0x3FF) as usize
}

/// Virtual address a page table for `dir_index` is mapped at, once the
/// directory's own recursive entry is installed.
fn table_window(dir_index: usize) -> u32 {
    RECURSIVE_BASE + (dir_index as u32) * PAGE_SIZE as u32
}

static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);
static CURRENT_PAGEDIR: AtomicU32 = AtomicU32::new(0);

static VMM_LOCK: Mutex<()> = Mutex::new(());

fn directory_entry(index: usize) -> *mut u32 {
    (DIRECTORY_VA as *mut u32).wrapping_add(index)
}

fn table_entry(dir_index: usize, table_index: usize) -> *mut u32 {
    (table_window(dir_index) as *mut u32).wrapping_add(table_index)
}

/// Allocates a fresh page directory with its recursive entry installed,
/// and the kernel's PDE range pre-populated from the currently active
/// directory (or left empty if called before paging is enabled, at boot).
///
/// # Safety
/// May only be called with `VMM_LOCK` held.
unsafe fn new_pagedir() -> Result<u32, VmmError> {
    let frame = frame_allocator::alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
    Ok(frame)
}

/// Sets up the boot page directory, maps the kernel image 1:1 below 16 MiB,
/// installs the recursive self-mapping, then enables paging.
///
/// # Safety
/// Must run exactly once, very early, before the heap or scheduler start.
pub unsafe fn init() {
    let _guard = VMM_LOCK.lock();
    let dir_phys = unsafe { new_pagedir() }.expect("initial page directory allocation");

    // Before paging is enabled physical == virtual, so the directory can be
    // written through its own physical address directly.
    let dir_ptr = dir_phys as *mut u32;
    unsafe {
        for i in 0..ENTRIES_PER_TABLE {
            dir_ptr.add(i).write(0);
        }
        dir_ptr.add(RECURSIVE_MAPPING_PDE).write(dir_phys | PTE_PRESENT | PTE_WRITABLE);

        // Identity-map the low 16 MiB so the kernel keeps running once CR0.PG
        // flips — four page tables' worth of 4 KiB pages.
        for pde in 0..4 {
            let table_phys = frame_allocator::alloc_frame().expect("boot page table");
            let table_ptr = table_phys as *mut u32;
            for pte in 0..ENTRIES_PER_TABLE {
                let phys = (pde * ENTRIES_PER_TABLE + pte) as u32 * PAGE_SIZE as u32;
                table_ptr.add(pte).write(phys | PTE_PRESENT | PTE_WRITABLE);
            }
            dir_ptr.add(pde).write(table_phys | PTE_PRESENT | PTE_WRITABLE);
        }

        core::arch::asm!("mov cr3, {0}", in(reg) dir_phys, options(nostack, preserves_flags));
        let mut cr0: u32;
        core::arch::asm!("mov {0}, cr0", out(reg) cr0, options(nostack, preserves_flags));
        cr0 |= (1 << 31) | (1 << 16); // PG | WP
        core::arch::asm!("mov cr0, {0}", in(reg) cr0, options(nostack, preserves_flags));
    }

    PAGING_ENABLED.store(true, Ordering::Release);
    CURRENT_PAGEDIR.store(dir_phys, Ordering::Release);
}

fn flush_tlb_single(va: u32) {
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) va, options(nostack, preserves_flags));
    }
}

/// Maps `va` to `frame`, allocating an intermediate page table if needed.
pub fn map(va: u32, frame: u32, flags: u32) -> Result<(), VmmError> {
    let _guard = VMM_LOCK.lock();
    let dir_index = page_directory_index(va);
    let table_index = page_table_index(va);

    unsafe {
        let pde = directory_entry(dir_index);
        if *pde & PTE_PRESENT == 0 {
            let table_frame = frame_allocator::alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
            *pde = table_frame | PTE_PRESENT | PTE_WRITABLE | (flags & PTE_USER);
            flush_tlb_single(table_window(dir_index));
            let table = table_entry(dir_index, table_index);
            for i in 0..ENTRIES_PER_TABLE {
                *(table_window(dir_index) as *mut u32).add(i) = 0;
            }
            let _ = table; // table zeroed via the window above
        }

        let pte = table_entry(dir_index, table_index);
        if *pte & PTE_PRESENT != 0 {
            return Err(VmmError::AlreadyMapped { va });
        }
        *pte = (frame & !0xFFF) | flags | PTE_PRESENT;
    }
    flush_tlb_single(va);
    Ok(())
}

/// Overwrites the flags of an already-present mapping, preserving its frame.
pub fn remap(va: u32, flags: u32) -> Result<(), VmmError> {
    let _guard = VMM_LOCK.lock();
    let dir_index = page_directory_index(va);
    let table_index = page_table_index(va);
    unsafe {
        if *directory_entry(dir_index) & PTE_PRESENT == 0 {
            return Err(VmmError::NotMapped { va });
        }
        let pte = table_entry(dir_index, table_index);
        if *pte & PTE_PRESENT == 0 {
            return Err(VmmError::NotMapped { va });
        }
        let frame = *pte & !0xFFF;
        *pte = frame | flags | PTE_PRESENT;
    }
    flush_tlb_single(va);
    Ok(())
}

/// Clears the present bit without freeing the underlying frame — the
/// caller owns the frame's lifetime.
pub fn unmap(va: u32) -> Result<(), VmmError> {
    let _guard = VMM_LOCK.lock();
    let dir_index = page_directory_index(va);
    let table_index = page_table_index(va);
    unsafe {
        let pte = table_entry(dir_index, table_index);
        if *pte & PTE_PRESENT == 0 {
            return Err(VmmError::NotMapped { va });
        }
        *pte &= !PTE_PRESENT;
    }
    flush_tlb_single(va);
    Ok(())
}

pub fn get_physical(va: u32) -> Option<u32> {
    let _guard = VMM_LOCK.lock();
    let dir_index = page_directory_index(va);
    let table_index = page_table_index(va);
    unsafe {
        if *directory_entry(dir_index) & PTE_PRESENT == 0 {
            return None;
        }
        let pte = *table_entry(dir_index, table_index);
        if pte & PTE_PRESENT == 0 {
            None
        } else {
            Some((pte & !0xFFF) | (va & 0xFFF))
        }
    }
}

pub fn get_flags(va: u32) -> Option<u32> {
    let _guard = VMM_LOCK.lock();
    let dir_index = page_directory_index(va);
    let table_index = page_table_index(va);
    unsafe {
        if *directory_entry(dir_index) & PTE_PRESENT == 0 {
            return None;
        }
        let pte = *table_entry(dir_index, table_index);
        (pte & PTE_PRESENT != 0).then_some(pte & 0xFFF)
    }
}

struct TransientMapping {
    throwaway_va: u32,
    original_frame: u32,
    original_flags: u32,
}

const TRANSIENT_SLOTS: usize = 8;
static TRANSIENT_SLOTS_TABLE: Mutex<[Option<TransientMapping>; TRANSIENT_SLOTS]> =
    Mutex::new([const { None }; TRANSIENT_SLOTS]);
const TRANSIENT_BASE: u32 = 0xFF80_0000;

/// Temporarily maps `frame` somewhere in kernel space so it can be read or
/// written without it being mapped anywhere else. Pairs with
/// [`transient_unmap`].
pub fn transient_map(frame: u32, flags: u32) -> Result<u32, VmmError> {
    let mut slots = TRANSIENT_SLOTS_TABLE.lock();
    let slot = slots
        .iter()
        .position(|s| s.is_none())
        .ok_or(VmmError::InvalidTransientAddress { va: 0 })?;
    let va = TRANSIENT_BASE + (slot as u32) * PAGE_SIZE as u32;

    let original_frame = get_physical(va).unwrap_or(0);
    let original_flags = get_flags(va).unwrap_or(0);
    if get_flags(va).is_some() {
        unmap(va)?;
    }
    map(va, frame, flags)?;

    slots[slot] = Some(TransientMapping { throwaway_va: va, original_frame, original_flags });
    Ok(va)
}

/// Restores whatever `address` pointed at before [`transient_map`].
pub fn transient_unmap(address: u32) -> Result<(), VmmError> {
    let mut slots = TRANSIENT_SLOTS_TABLE.lock();
    let slot = slots
        .iter()
        .position(|s| s.as_ref().is_some_and(|m| m.throwaway_va == address))
        .ok_or(VmmError::InvalidTransientAddress { va: address })?;
    let mapping = slots[slot].take().unwrap();
    unmap(mapping.throwaway_va)?;
    if mapping.original_flags & PTE_PRESENT != 0 {
        map(mapping.throwaway_va, mapping.original_frame, mapping.original_flags)?;
    }
    Ok(())
}

/// Deep-copies every present PTE of `src_table_va` into a freshly allocated
/// table, returning the new table's physical frame.
unsafe fn clone_pagetable(src_dir_index: usize) -> Result<u32, VmmError> {
    let new_table = frame_allocator::alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
    let dst_va = transient_map(new_table, PTE_PRESENT | PTE_WRITABLE)?;
    unsafe {
        for i in 0..ENTRIES_PER_TABLE {
            (dst_va as *mut u32).add(i).write(0);
        }
    }

    let src_table_va = table_window(src_dir_index);
    for i in 0..ENTRIES_PER_TABLE {
        let src_pte = unsafe { *(src_table_va as *const u32).add(i) };
        if src_pte & PTE_PRESENT == 0 {
            continue;
        }
        let flags = src_pte & 0xFFF;
        let src_frame = src_pte & !0xFFF;
        let new_frame = frame_allocator::alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
        let src_frame_va = transient_map(src_frame, PTE_PRESENT)?;
        let new_frame_va = transient_map(new_frame, PTE_PRESENT | PTE_WRITABLE)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                src_frame_va as *const u8,
                new_frame_va as *mut u8,
                PAGE_SIZE,
            );
        }
        transient_unmap(src_frame_va)?;
        transient_unmap(new_frame_va)?;
        unsafe {
            (dst_va as *mut u32).add(i).write(new_frame | flags);
        }
    }

    transient_unmap(dst_va)?;
    Ok(new_table)
}

/// Creates a new address space: user PDE range deep-copied, kernel PDE
/// range shared by identical entry, own recursive entry pointing at self.
pub fn clone_pagedir() -> Result<u32, VmmError> {
    let _guard = VMM_LOCK.lock();
    let new_dir = frame_allocator::alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
    let new_dir_va = transient_map(new_dir, PTE_PRESENT | PTE_WRITABLE)?;

    unsafe {
        for i in 0..ENTRIES_PER_TABLE {
            (new_dir_va as *mut u32).add(i).write(0);
        }

        for pde in USER_PDE_START..=USER_PDE_END {
            let src = *directory_entry(pde);
            if src & PTE_PRESENT == 0 {
                continue;
            }
            let new_table = clone_pagetable(pde)?;
            (new_dir_va as *mut u32).add(pde).write(new_table | (src & 0xFFF));
        }

        for pde in KERNEL_PDE_START..=KERNEL_PDE_END {
            let src = *directory_entry(pde);
            (new_dir_va as *mut u32).add(pde).write(src);
        }

        (new_dir_va as *mut u32)
            .add(RECURSIVE_MAPPING_PDE)
            .write(new_dir | PTE_PRESENT | PTE_WRITABLE);
    }

    transient_unmap(new_dir_va)?;
    Ok(new_dir)
}

/// Frees every frame a user address space owns, then the directory itself.
pub fn destroy_pagedir(dir_phys: u32) -> Result<(), VmmError> {
    let _guard = VMM_LOCK.lock();
    let dir_va = transient_map(dir_phys, PTE_PRESENT | PTE_WRITABLE)?;

    for pde in USER_PDE_START..=USER_PDE_END {
        let entry = unsafe { *(dir_va as *const u32).add(pde) };
        if entry & PTE_PRESENT == 0 {
            continue;
        }
        let table_frame = entry & !0xFFF;
        let table_va = transient_map(table_frame, PTE_PRESENT | PTE_WRITABLE)?;
        for i in 0..ENTRIES_PER_TABLE {
            let pte = unsafe { *(table_va as *const u32).add(i) };
            if pte & PTE_PRESENT != 0 {
                let _ = frame_allocator::free_frame(pte & !0xFFF);
            }
        }
        transient_unmap(table_va)?;
        let _ = frame_allocator::free_frame(table_frame);
    }

    transient_unmap(dir_va)?;
    let _ = frame_allocator::free_frame(dir_phys);
    Ok(())
}

/// Copies the current address space's kernel PDE range into `dir_phys`,
/// asserting its recursive entry already points at itself.
fn copy_kernel_mappings(dir_phys: u32) -> Result<(), VmmError> {
    let dir_va = transient_map(dir_phys, PTE_PRESENT | PTE_WRITABLE)?;
    unsafe {
        debug_assert_eq!((dir_va as *const u32).add(RECURSIVE_MAPPING_PDE).read() & !0xFFF, dir_phys);
        for pde in KERNEL_PDE_START..=KERNEL_PDE_END {
            let src = *directory_entry(pde);
            (dir_va as *mut u32).add(pde).write(src);
        }
    }
    transient_unmap(dir_va)
}

/// Switches the active address space, copying kernel mappings across first.
///
/// # Safety
/// `dir_phys` must be a page directory built by [`clone_pagedir`] or
/// [`init`]; switching to anything else leaves the CPU unable to fetch its
/// next instruction.
pub unsafe fn switch_pagedir(dir_phys: u32) -> Result<(), VmmError> {
    copy_kernel_mappings(dir_phys)?;
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) dir_phys, options(nostack, preserves_flags));
    }
    CURRENT_PAGEDIR.store(dir_phys, Ordering::Release);
    Ok(())
}

pub fn current_pagedir() -> u32 {
    CURRENT_PAGEDIR.load(Ordering::Acquire)
}
