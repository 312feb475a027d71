//! Read-only tar-shaped initrd (§1B, §6 `INITRD_SIZE`/`INITRD_READ`).
//!
//! Grounded on the original kernel's `initrd.c`: the bootloader hands the
//! kernel one multiboot module, a plain POSIX tar archive with no
//! compression. The kernel copies it into its own heap once at boot, walks
//! the tar headers to build a name → byte-range index (used by `exec` to
//! find `init.elf` and friends), and otherwise exposes the whole blob to
//! user space unparsed through the size/copy-range syscall pair — the VFS
//! server, not the kernel, understands tar.

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::multiboot::{self, MultibootInfo};

const TAR_BLOCK: usize = 512;
const NAME_FIELD: usize = 100;
const SIZE_FIELD_OFFSET: usize = 124;
const SIZE_FIELD_LEN: usize = 12;

struct FileEntry {
    name: String,
    offset: u32,
    size: u32,
}

struct Initrd {
    blob: Vec<u8>,
    files: Vec<FileEntry>,
}

impl Initrd {
    const fn empty() -> Self {
        Self { blob: Vec::new(), files: Vec::new() }
    }
}

static INITRD: Mutex<Initrd> = Mutex::new(Initrd::empty());

/// Parses a tar numeric field (ASCII octal digits, as C's `getsize` does).
fn octal_size(field: &[u8]) -> u32 {
    let mut size: u32 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            break;
        }
        size = size * 8 + (b - b'0') as u32;
    }
    size
}

fn tar_name(header: &[u8]) -> String {
    let raw = &header[0..NAME_FIELD];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Copies the bootloader-supplied initrd module into the kernel heap and
/// indexes the tar entries it contains. A no-op if the bootloader reported
/// no modules (e.g. running a unit-test host build).
///
/// # Safety
/// `info` must be the multiboot info block passed in at kernel entry, with
/// its module list (if any) still mapped and untouched.
pub unsafe fn init(info: &MultibootInfo) {
    let Some((start, end)) = (unsafe { multiboot::first_module(info) }) else {
        return;
    };
    let len = (end - start) as usize;
    let mut blob = alloc::vec![0u8; len];
    unsafe {
        core::ptr::copy_nonoverlapping(start as *const u8, blob.as_mut_ptr(), len);
    }

    let mut files = Vec::new();
    let mut pos = 0usize;
    while pos + TAR_BLOCK <= blob.len() {
        let header = &blob[pos..pos + TAR_BLOCK];
        if header[0] == 0 {
            break;
        }
        let name = tar_name(header);
        let size = octal_size(&header[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + SIZE_FIELD_LEN]);
        let data_offset = pos + TAR_BLOCK;
        files.push(FileEntry { name, offset: data_offset as u32, size });
        pos = data_offset + align_up(size as usize, TAR_BLOCK);
    }

    let mut guard = INITRD.lock();
    guard.blob = blob;
    guard.files = files;
}

/// `INITRD_SIZE`: total byte length of the whole tar blob.
pub fn size() -> u32 {
    INITRD.lock().blob.len() as u32
}

/// `INITRD_READ`: copies up to `len` bytes starting at `offset` into the
/// caller's buffer. Returns the number of bytes actually copied, `0` at
/// end-of-image, or `-1` if `offset` is past the end of the blob.
///
/// # Safety
/// `buf_ptr` must point at `len` writable bytes in the currently active
/// address space.
pub unsafe fn read(offset: u32, buf_ptr: u32, len: u32) -> i32 {
    let guard = INITRD.lock();
    let blob_len = guard.blob.len() as u32;
    if offset > blob_len {
        return -1;
    }
    let remaining = blob_len - offset;
    if remaining == 0 {
        return 0;
    }
    let copy_len = remaining.min(len);
    unsafe {
        core::ptr::copy_nonoverlapping(
            guard.blob.as_ptr().add(offset as usize),
            buf_ptr as *mut u8,
            copy_len as usize,
        );
    }
    copy_len as i32
}

/// Looks up a file by exact name and returns an owned copy of its bytes, for
/// `exec` to hand to [`crate::elf::load_elf`].
pub fn read_file(name: &str) -> Option<Vec<u8>> {
    let guard = INITRD.lock();
    let entry = guard.files.iter().find(|f| f.name == name)?;
    let start = entry.offset as usize;
    let end = start + entry.size as usize;
    Some(guard.blob.get(start..end)?.to_vec())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn tar_entry(name: &str, data: &[u8]) -> Vec<u8> {
        let mut header = alloc::vec![0u8; TAR_BLOCK];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let octal = alloc::format!("{:011o}", data.len());
        header[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + octal.len()].copy_from_slice(octal.as_bytes());

        let mut out = header;
        out.extend_from_slice(data);
        out.resize(TAR_BLOCK + align_up(data.len(), TAR_BLOCK), 0);
        out
    }

    #[test]
    fn octal_size_parses_tar_numeric_field() {
        let mut field = [b'0'; SIZE_FIELD_LEN];
        field[SIZE_FIELD_LEN - 3..].copy_from_slice(b"012");
        assert_eq!(octal_size(&field), 10);
    }

    #[test]
    fn tar_name_stops_at_nul() {
        let mut header = [0u8; TAR_BLOCK];
        header[..8].copy_from_slice(b"init.elf");
        assert_eq!(tar_name(&header), "init.elf");
    }

    #[test]
    fn align_up_rounds_to_block_size() {
        assert_eq!(align_up(0, TAR_BLOCK), 0);
        assert_eq!(align_up(1, TAR_BLOCK), TAR_BLOCK);
        assert_eq!(align_up(TAR_BLOCK, TAR_BLOCK), TAR_BLOCK);
    }

    #[test]
    fn parses_single_file_archive_and_reads_it_back() {
        let blob = tar_entry("init.elf", b"hello world");
        let mut files = Vec::new();
        let mut pos = 0usize;
        while pos + TAR_BLOCK <= blob.len() {
            let header = &blob[pos..pos + TAR_BLOCK];
            if header[0] == 0 {
                break;
            }
            let name = tar_name(header);
            let size = octal_size(&header[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + SIZE_FIELD_LEN]);
            let data_offset = pos + TAR_BLOCK;
            files.push(FileEntry { name, offset: data_offset as u32, size });
            pos = data_offset + align_up(size as usize, TAR_BLOCK);
        }
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "init.elf");
        assert_eq!(&blob[files[0].offset as usize..(files[0].offset + files[0].size) as usize], b"hello world");
    }
}
