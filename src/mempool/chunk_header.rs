//! Chunk header: fixed-layout metadata ahead of every user payload

use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::mempool::chunk::ChunkManagement;
use crate::relative_ptr::RelPtr;

/// Bytes reserved directly ahead of the payload for the back-offset
const BACK_OFFSET_BYTES: usize = size_of::<u32>();

/// Metadata at the start of every pool block.
///
/// The user payload begins at `header + user_payload_offset`; the same offset
/// is mirrored in the four bytes directly ahead of the payload so a payload
/// pointer can be mapped back to its header.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHeader {
    /// Total block size this chunk occupies
    pub chunk_size: u64,
    /// Bytes of the user payload
    pub user_payload_size: u64,
    /// Alignment requested for the user payload
    pub user_payload_alignment: u32,
    /// Offset of the payload from the start of this header
    pub user_payload_offset: u32,
    /// Unique id of the publisher port that produced this chunk
    pub origin_id: u128,
    /// Per-publisher sequence number, stamped on send
    pub sequence_number: u64,
    /// Nanoseconds since the UNIX epoch, stamped on send
    pub timestamp_ns: u64,
    /// Back-pointer to the management record
    pub management: RelPtr<ChunkManagement>,
}

impl ChunkHeader {
    /// Size of the header itself
    pub const SIZE: usize = size_of::<ChunkHeader>();

    /// Payload offset for a given alignment
    pub fn payload_offset(alignment: usize) -> usize {
        let align = alignment.max(size_of::<u64>());
        super::layout::align_up(Self::SIZE + BACK_OFFSET_BYTES, align)
    }

    /// Smallest block that holds a payload of `payload_size` at `alignment`
    pub fn required_chunk_size(payload_size: usize, alignment: usize) -> usize {
        Self::payload_offset(alignment) + payload_size
    }

    /// Write a fresh header into a raw pool block
    ///
    /// # Safety
    /// `block` must point to at least `chunk_size` writable bytes.
    pub unsafe fn init(
        block: *mut u8,
        chunk_size: usize,
        payload_size: usize,
        alignment: usize,
    ) -> *mut ChunkHeader {
        let offset = Self::payload_offset(alignment);
        debug_assert!(offset + payload_size <= chunk_size);

        let header = block as *mut ChunkHeader;
        header.write(ChunkHeader {
            chunk_size: chunk_size as u64,
            user_payload_size: payload_size as u64,
            user_payload_alignment: alignment as u32,
            user_payload_offset: offset as u32,
            origin_id: 0,
            sequence_number: 0,
            timestamp_ns: 0,
            management: RelPtr::null(),
        });

        // Mirror the offset ahead of the payload for the reverse lookup
        let back = block.add(offset - BACK_OFFSET_BYTES) as *mut u32;
        back.write_unaligned(offset as u32);

        header
    }

    /// Pointer to the user payload
    pub fn user_payload(&self) -> *mut u8 {
        let base = self as *const ChunkHeader as *const u8;
        unsafe { base.add(self.user_payload_offset as usize) as *mut u8 }
    }

    /// Recover the header from a user payload pointer
    ///
    /// # Safety
    /// `payload` must have been produced by [`ChunkHeader::user_payload`].
    pub unsafe fn from_user_payload(payload: *const u8) -> *mut ChunkHeader {
        let back = payload.sub(BACK_OFFSET_BYTES) as *const u32;
        let offset = back.read_unaligned() as usize;
        payload.sub(offset) as *mut ChunkHeader
    }

    /// Stamp origin, sequence and wall-clock time; called on send
    pub fn stamp(&mut self, origin_id: u128, sequence_number: u64) {
        self.origin_id = origin_id;
        self.sequence_number = sequence_number;
        self.timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
    }
}
