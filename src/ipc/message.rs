//! Wire format for IPC messages (§6) and the sdbm checksum that protects
//! them from sender to receiver.

extern crate alloc;
use alloc::vec::Vec;

use crate::error::IpcError;

/// `checksum, sender, reply_port, code, len` — the fixed part of the wire
/// format before the variable-length payload.
pub const HEADER_SIZE: usize = 20;

/// Bound on a single message's payload. Not named by the wire format itself,
/// but a `len` read from user space has to be bounded before the kernel
/// trusts it enough to allocate and copy that many bytes.
pub const MAX_MESSAGE_DATA: usize = 4096;

/// A message once it has been accepted into the kernel: `sender` is always
/// the real sender pid (the kernel overwrites whatever the caller supplied)
/// and `checksum` is the value recomputed at that point, stored so a later
/// dequeue can detect in-kernel corruption rather than just re-deriving it.
#[derive(Clone)]
pub struct KernelMessage {
    pub checksum: u32,
    pub sender: i32,
    pub reply_port: i32,
    pub code: u32,
    pub data: Vec<u8>,
}

/// sdbm rolling hash over the header fields (sender, reply_port, code, len),
/// in declaration order, followed by `data` (§6).
fn sdbm(sender: i32, reply_port: i32, code: u32, data: &[u8]) -> u32 {
    let mut h: u32 = 0;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            h = (b as u32).wrapping_add(h << 6).wrapping_add(h << 16).wrapping_sub(h);
        }
    };
    feed(&sender.to_le_bytes());
    feed(&reply_port.to_le_bytes());
    feed(&code.to_le_bytes());
    feed(&(data.len() as u32).to_le_bytes());
    feed(data);
    h
}

impl KernelMessage {
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Re-derives the checksum from the message's current contents. Used to
    /// detect corruption between enqueue and dequeue — it must equal
    /// `self.checksum` or the in-kernel copy has been clobbered.
    pub fn recomputed_checksum(&self) -> u32 {
        sdbm(self.sender, self.reply_port, self.code, &self.data)
    }

    /// Reads a message out of the calling task's own address space,
    /// verifying the sender-supplied checksum before trusting `len`, then
    /// stamps `real_sender` in and recomputes the checksum for storage.
    ///
    /// # Safety
    /// `ptr` must point at a valid message in the currently active address
    /// space whose declared `len` field does not claim more bytes than are
    /// actually readable there.
    pub unsafe fn read_from_user(ptr: u32, real_sender: i32) -> Result<Self, IpcError> {
        let base = ptr as *const u8;
        let mut header = [0u8; HEADER_SIZE];
        unsafe { core::ptr::copy_nonoverlapping(base, header.as_mut_ptr(), HEADER_SIZE) };

        let claimed_checksum = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let claimed_sender = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let reply_port = i32::from_le_bytes(header[8..12].try_into().unwrap());
        let code = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;

        if len > MAX_MESSAGE_DATA {
            return Err(IpcError::MessageTooLarge { size: len, max: MAX_MESSAGE_DATA });
        }

        let mut data = alloc::vec![0u8; len];
        if len > 0 {
            unsafe { core::ptr::copy_nonoverlapping(base.add(HEADER_SIZE), data.as_mut_ptr(), len) };
        }

        if sdbm(claimed_sender, reply_port, code, &data) != claimed_checksum {
            return Err(IpcError::ChecksumMismatch);
        }

        let checksum = sdbm(real_sender, reply_port, code, &data);
        Ok(Self { checksum, sender: real_sender, reply_port, code, data })
    }

    /// Writes this message into a receiver's buffer. Returns `None` without
    /// touching `buf_ptr` if `buf_size` is too small for [`Self::encoded_len`].
    ///
    /// # Safety
    /// `buf_ptr` must point at `buf_size` writable bytes in the currently
    /// active address space.
    pub unsafe fn encode_into(&self, buf_ptr: u32, buf_size: u32) -> Option<usize> {
        let total = self.encoded_len();
        if (buf_size as usize) < total {
            return None;
        }
        unsafe {
            let base = buf_ptr as *mut u8;
            core::ptr::copy_nonoverlapping(self.checksum.to_le_bytes().as_ptr(), base, 4);
            core::ptr::copy_nonoverlapping(self.sender.to_le_bytes().as_ptr(), base.add(4), 4);
            core::ptr::copy_nonoverlapping(self.reply_port.to_le_bytes().as_ptr(), base.add(8), 4);
            core::ptr::copy_nonoverlapping(self.code.to_le_bytes().as_ptr(), base.add(12), 4);
            core::ptr::copy_nonoverlapping(
                (self.data.len() as u32).to_le_bytes().as_ptr(),
                base.add(16),
                4,
            );
            if !self.data.is_empty() {
                core::ptr::copy_nonoverlapping(self.data.as_ptr(), base.add(HEADER_SIZE), self.data.len());
            }
        }
        Some(total)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn checksum_changes_on_any_bit_flip() {
        let base = sdbm(3, -1, 7, b"hello");
        assert_ne!(base, sdbm(4, -1, 7, b"hello"));
        assert_ne!(base, sdbm(3, -1, 7, b"hellp"));
        assert_ne!(base, sdbm(3, -1, 8, b"hello"));
    }

    #[test]
    fn recomputed_checksum_matches_stored_for_untouched_message() {
        let msg = KernelMessage {
            checksum: sdbm(5, 2, 9, b"abc"),
            sender: 5,
            reply_port: 2,
            code: 9,
            data: alloc::vec![b'a', b'b', b'c'],
        };
        assert_eq!(msg.checksum, msg.recomputed_checksum());
    }

    #[test]
    fn encoded_len_accounts_for_header_and_payload() {
        let msg = KernelMessage { checksum: 0, sender: 0, reply_port: 0, code: 0, data: alloc::vec![0u8; 10] };
        assert_eq!(msg.encoded_len(), HEADER_SIZE + 10);
    }
}
