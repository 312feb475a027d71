//! ELF32 program loader (§1B addition / §6 `EXEC`).
//!
//! Grounded on the original kernel's `elf.c`: walks the program header table
//! of a static `ET_EXEC`/`EM_386` image and maps each `PT_LOAD` segment into
//! the *current* address space. The caller is responsible for having already
//! switched to the target task's page directory — there is no out-of-process
//! variant, matching the original (`exec` always loads into the caller's own
//! space).

use crate::error::ElfError;
use crate::mm::vmm::{self, PTE_PRESENT, PTE_USER, PTE_WRITABLE};
use crate::mm::{frame_allocator, PAGE_SIZE};

const EI_MAG0: usize = 0;
const EI_MAG1: usize = 1;
const EI_MAG2: usize = 2;
const EI_MAG3: usize = 3;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_NIDENT: usize = 16;

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;

const PT_LOAD: u32 = 1;
const PF_W: u32 = 1 << 1;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

/// Bounds of the user half of the address space (§3): every `PT_LOAD`
/// segment must land entirely inside this range. Mirrors `vmm`'s own
/// `USER_PDE_START..=USER_PDE_END` window (PDE 0..767, i.e. below the
/// kernel's PDE 768).
const USER_START: u32 = 0x0000_0000;
const USER_END: u32 = 0xC000_0000;

struct Ehdr {
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn parse_ehdr(data: &[u8]) -> Result<Ehdr, ElfError> {
    if data.len() < EHDR_SIZE {
        return Err(ElfError::NotElf);
    }
    if data[EI_MAG0] != 0x7F || data[EI_MAG1] != b'E' || data[EI_MAG2] != b'L' || data[EI_MAG3] != b'F' {
        return Err(ElfError::NotElf);
    }
    if data[EI_CLASS] != ELFCLASS32 {
        return Err(ElfError::WrongClass);
    }
    if data[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::WrongByteOrder);
    }

    let e_type = read_u16(data, EI_NIDENT);
    let e_machine = read_u16(data, EI_NIDENT + 2);
    let e_version = read_u32(data, EI_NIDENT + 4);
    let e_entry = read_u32(data, EI_NIDENT + 8);
    let e_phoff = read_u32(data, EI_NIDENT + 12);
    let e_phentsize = read_u16(data, EI_NIDENT + 32);
    let e_phnum = read_u16(data, EI_NIDENT + 34);

    if e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if e_machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    if e_version != 1 {
        return Err(ElfError::NotElf);
    }
    if e_entry == 0 {
        return Err(ElfError::NotExecutable);
    }

    Ok(Ehdr { e_entry, e_phoff, e_phentsize, e_phnum })
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

fn parse_phdr(data: &[u8], off: usize) -> Result<Phdr, ElfError> {
    if off + PHDR_SIZE > data.len() {
        return Err(ElfError::BadProgramHeaderSize);
    }
    Ok(Phdr {
        p_type: read_u32(data, off),
        p_offset: read_u32(data, off + 4),
        p_vaddr: read_u32(data, off + 8),
        p_filesz: read_u32(data, off + 16),
        p_memsz: read_u32(data, off + 20),
        p_flags: read_u32(data, off + 24),
    })
}

/// Loads a static ELF32 executable into the currently active address space
/// and returns its entry point. Every `PT_LOAD` segment is mapped writable
/// while its contents are copied in, then remapped to its declared
/// permissions — matching the original's two-pass approach, since the
/// segment has to be writable for the `memcpy`/`bzero` regardless of what
/// the ELF header says the final permissions should be.
pub fn load_elf(data: &[u8]) -> Result<u32, ElfError> {
    let ehdr = parse_ehdr(data)?;
    if ehdr.e_phentsize as usize != PHDR_SIZE {
        return Err(ElfError::BadProgramHeaderSize);
    }

    for i in 0..ehdr.e_phnum {
        let phdr = parse_phdr(data, ehdr.e_phoff as usize + i as usize * PHDR_SIZE)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_memsz == 0 {
            return Err(ElfError::SegmentOutOfRange { vaddr: phdr.p_vaddr });
        }

        let segment_start = phdr.p_vaddr;
        let segment_end = segment_start
            .checked_add(phdr.p_memsz)
            .ok_or(ElfError::SegmentOutOfRange { vaddr: segment_start })?;
        if segment_start < USER_START || segment_end > USER_END {
            return Err(ElfError::SegmentOutOfRange { vaddr: segment_start });
        }

        let page_flags = PTE_PRESENT | PTE_USER | if phdr.p_flags & PF_W != 0 { PTE_WRITABLE } else { 0 };

        let first_page = segment_start & !(PAGE_SIZE as u32 - 1);
        let mut page = first_page;
        while page < segment_end {
            let frame = frame_allocator::alloc_frame().map_err(|_| ElfError::OutOfMemory)?;
            vmm::map(page, frame, PTE_PRESENT | PTE_WRITABLE).map_err(|_| ElfError::MappingFailed)?;
            page += PAGE_SIZE as u32;
        }

        unsafe {
            core::ptr::write_bytes(segment_start as *mut u8, 0, phdr.p_memsz as usize);
            if phdr.p_filesz > 0 {
                let src = data
                    .get(phdr.p_offset as usize..phdr.p_offset as usize + phdr.p_filesz as usize)
                    .ok_or(ElfError::BadProgramHeaderSize)?;
                core::ptr::copy_nonoverlapping(src.as_ptr(), segment_start as *mut u8, src.len());
            }
        }

        let mut page = first_page;
        while page < segment_end {
            vmm::remap(page, page_flags).map_err(|_| ElfError::MappingFailed)?;
            page += PAGE_SIZE as u32;
        }
    }

    Ok(ehdr.e_entry)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn minimal_ehdr(e_type: u16, e_machine: u16, e_entry: u32, phnum: u16) -> [u8; EHDR_SIZE] {
        let mut buf = [0u8; EHDR_SIZE];
        buf[EI_MAG0] = 0x7F;
        buf[EI_MAG1] = b'E';
        buf[EI_MAG2] = b'L';
        buf[EI_MAG3] = b'F';
        buf[EI_CLASS] = ELFCLASS32;
        buf[EI_DATA] = ELFDATA2LSB;
        buf[EI_NIDENT..EI_NIDENT + 2].copy_from_slice(&e_type.to_le_bytes());
        buf[EI_NIDENT + 2..EI_NIDENT + 4].copy_from_slice(&e_machine.to_le_bytes());
        buf[EI_NIDENT + 4..EI_NIDENT + 8].copy_from_slice(&1u32.to_le_bytes());
        buf[EI_NIDENT + 8..EI_NIDENT + 12].copy_from_slice(&e_entry.to_le_bytes());
        buf[EI_NIDENT + 32..EI_NIDENT + 34].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[EI_NIDENT + 34..EI_NIDENT + 36].copy_from_slice(&phnum.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = minimal_ehdr(ET_EXEC, EM_386, 0x1000, 0);
        buf[0] = 0;
        assert_eq!(parse_ehdr(&buf).unwrap_err(), ElfError::NotElf);
    }

    #[test]
    fn rejects_wrong_machine() {
        let buf = minimal_ehdr(ET_EXEC, 0x28, 0x1000, 0);
        assert_eq!(parse_ehdr(&buf).unwrap_err(), ElfError::WrongMachine);
    }

    #[test]
    fn rejects_non_executable_type() {
        let buf = minimal_ehdr(1, EM_386, 0x1000, 0);
        assert_eq!(parse_ehdr(&buf).unwrap_err(), ElfError::NotExecutable);
    }

    #[test]
    fn accepts_well_formed_header_with_no_segments() {
        let buf = minimal_ehdr(ET_EXEC, EM_386, 0x1000, 0);
        let ehdr = parse_ehdr(&buf).unwrap();
        assert_eq!(ehdr.e_entry, 0x1000);
        assert_eq!(ehdr.e_phnum, 0);
    }
}
