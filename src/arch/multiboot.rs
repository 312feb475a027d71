//! Multiboot v1 info block, as passed in EBX at kernel entry.
//!
//! Parsing this structure is itself a non-goal (it belongs to the
//! bootloader contract); what PMM init needs is the available-memory
//! regions it carries, in the same order they appear in the map.

pub const MULTIBOOT_MEMORY_AVAILABLE: u32 = 1;

/// Set in `MultibootInfo::flags` when `mods_count`/`mods_addr` are valid.
pub const MULTIBOOT_FLAG_MODS: u32 = 1 << 3;

#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_len: u32,
    pub mmap_addr: u32,
    pub drives_len: u32,
    pub drives_addr: u32,
    pub config_table: u32,
    pub apm_table: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u32,
    pub vbe_interface_seg: u32,
    pub vbe_interface_off: u32,
    pub vbe_interface_len: u32,
}

#[repr(C, packed)]
pub struct MultibootMmapEntry {
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub entry_type: u32,
}

/// One entry of the multiboot module list (used to locate the initrd tar
/// image the bootloader loaded alongside the kernel).
#[repr(C)]
pub struct MultibootModule {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string: u32,
    pub reserved: u32,
}

/// The first loaded module's physical `[start, end)` range, if the
/// bootloader reported any modules at all.
///
/// # Safety
/// `info` must point at a valid multiboot info block with `mods_addr`
/// pointing at `mods_count` `MultibootModule` records when
/// `MULTIBOOT_FLAG_MODS` is set.
pub unsafe fn first_module(info: &MultibootInfo) -> Option<(u32, u32)> {
    if info.flags & MULTIBOOT_FLAG_MODS == 0 || info.mods_count == 0 {
        return None;
    }
    let module = unsafe { &*(info.mods_addr as *const MultibootModule) };
    Some((module.mod_start, module.mod_end))
}

/// A physical `(base, length)` range available for the PMM to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableRegion {
    pub base: u32,
    pub len: u32,
}

/// Walks the multiboot memory map, yielding every available region whose
/// address and length fit in 32 bits — matching the original kernel's
/// `HIDWORD(entry->addr) == 0` filter for a 32-bit address space.
///
/// # Safety
/// `info` must point at a valid multiboot info block with `mmap_addr`
/// pointing at `mmap_len` bytes of `MultibootMmapEntry` records.
pub unsafe fn available_regions(info: &MultibootInfo) -> impl Iterator<Item = AvailableRegion> {
    let entry_size = core::mem::size_of::<MultibootMmapEntry>() as u32;
    let count = if entry_size == 0 { 0 } else { info.mmap_len / entry_size };
    let base_ptr = info.mmap_addr as *const MultibootMmapEntry;

    (0..count).filter_map(move |i| {
        let entry = unsafe { &*base_ptr.add(i as usize) };
        let hi = (entry.addr >> 32) as u32;
        if hi == 0 && entry.entry_type == MULTIBOOT_MEMORY_AVAILABLE {
            Some(AvailableRegion { base: entry.addr as u32, len: entry.len as u32 })
        } else {
            None
        }
    })
}
