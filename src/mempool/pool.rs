//! Fixed-size block pool with a lock-free index free list
//!
//! The pool control record, its free-list index array, and the block array
//! all live inside the shared segment; any process mapping the segment may
//! claim and release blocks concurrently. The free-list head packs a
//! generation tag next to the index so a stale compare-exchange cannot
//! re-link a popped entry.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::fatal;
use crate::relative_ptr::{RelPtr, SegmentRegistry};

/// Sentinel index terminating the free list
pub const INDEX_NONE: u32 = u32::MAX;

/// In-segment control record of one fixed-size block pool
#[repr(C)]
#[derive(Debug)]
pub struct MemPool {
    /// Size of each block in bytes
    block_size: u64,
    /// Total number of blocks
    block_count: u32,
    /// Blocks currently claimed; observational
    used_count: AtomicU32,
    /// Free-list head: `{generation << 32 | index}`
    head: AtomicU64,
    /// Index array of `block_count` entries linking free blocks
    next: RelPtr<u32>,
    /// First block
    blocks: RelPtr<u8>,
}

fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

impl MemPool {
    /// Initialise a pool in place inside its segment.
    ///
    /// Links every block into the free list. `next` must point to an array of
    /// `block_count` `u32` entries and `blocks` to `block_count * block_size`
    /// bytes, both inside a registered segment.
    ///
    /// # Safety
    /// `pool` must point to writable, properly aligned memory for a
    /// `MemPool`; the referenced arrays must be unused by anyone else.
    pub unsafe fn init(
        pool: *mut MemPool,
        registry: &SegmentRegistry,
        block_size: usize,
        block_count: u32,
        next: RelPtr<u32>,
        blocks: RelPtr<u8>,
    ) {
        pool.write(MemPool {
            block_size: block_size as u64,
            block_count,
            used_count: AtomicU32::new(0),
            head: AtomicU64::new(pack(0, if block_count > 0 { 0 } else { INDEX_NONE })),
            next,
            blocks,
        });

        let next_arr = next.resolve(registry);
        for i in 0..block_count {
            let link = if i + 1 < block_count { i + 1 } else { INDEX_NONE };
            next_arr.add(i as usize).write(link);
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Number of claimed blocks; may be racy
    pub fn used_count(&self) -> u32 {
        self.used_count.load(Ordering::Relaxed)
    }

    /// Number of free blocks; may be racy
    pub fn free_count(&self) -> u32 {
        self.block_count - self.used_count()
    }

    /// Claim one block, or `None` when the pool is exhausted
    pub fn get_chunk(&self, registry: &SegmentRegistry) -> Option<*mut u8> {
        let next_arr = self.next.resolve(registry);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, index) = unpack(head);
            if index == INDEX_NONE {
                return None;
            }
            let next_index = unsafe { next_arr.add(index as usize).read() };
            let replacement = pack(generation.wrapping_add(1), next_index);
            match self.head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.used_count.fetch_add(1, Ordering::Relaxed);
                    let base = self.blocks.resolve(registry);
                    return Some(unsafe { base.add(index as usize * self.block_size as usize) });
                }
                Err(_) => {
                    std::hint::spin_loop();
                    continue;
                }
            }
        }
    }

    /// Return a block to the pool.
    ///
    /// The address must lie inside this pool's block array on a block
    /// boundary; anything else signifies corruption and is fatal.
    pub fn free_chunk(&self, registry: &SegmentRegistry, ptr: *mut u8) {
        let base = self.blocks.resolve(registry) as usize;
        let addr = ptr as usize;
        let span = self.block_count as usize * self.block_size as usize;
        if addr < base || addr >= base + span {
            fatal("freeing a block that does not belong to the claimed pool");
        }
        let offset = addr - base;
        if offset % self.block_size as usize != 0 {
            fatal("freeing a block that is not block-aligned");
        }
        let index = (offset / self.block_size as usize) as u32;

        let next_arr = self.next.resolve(registry);
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (generation, head_index) = unpack(head);
            unsafe { next_arr.add(index as usize).write(head_index) };
            let replacement = pack(generation.wrapping_add(1), index);
            match self.head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.used_count.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => {
                    std::hint::spin_loop();
                    continue;
                }
            }
        }
    }
}
