//! Fixed segment layout: header, pool records, placement computation

use crate::config::{PoolEntry, MAX_POOLS_PER_SEGMENT};
use crate::error::{Result, VermeerError};
use crate::mempool::chunk::ChunkManagement;
use crate::mempool::chunk_header::ChunkHeader;

/// Magic number at the start of every segment
pub const SEGMENT_MAGIC: u64 = 0x5645524D45455253; // "VERMEERS"

/// Current segment layout version
pub const SEGMENT_VERSION: u32 = 1;

/// Alignment of pool block arrays
pub const BLOCK_ALIGNMENT: usize = 64;

/// Align a value up to the given power-of-two alignment
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Descriptor of one pool inside a segment, stored in the segment header
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PoolRecord {
    /// Full block size in bytes (chunk header plus payload capacity)
    pub block_size: u64,
    /// Number of blocks
    pub block_count: u64,
    /// Offset of the in-segment `MemPool` control record
    pub pool_offset: u64,
    /// Offset of the first block
    pub base_offset: u64,
}

impl PoolRecord {
    pub const EMPTY: Self = Self {
        block_size: 0,
        block_count: 0,
        pool_offset: 0,
        base_offset: 0,
    };
}

/// Fixed-layout header at offset 0 of every data segment
#[repr(C)]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Layout version
    pub version: u32,
    /// Number of valid entries in `pools`
    pub pool_count: u32,
    /// Total segment size in bytes
    pub total_size: u64,
    /// Pool of `ChunkManagement` records
    pub management_pool: PoolRecord,
    /// Payload pools, ascending block size
    pub pools: [PoolRecord; MAX_POOLS_PER_SEGMENT],
}

impl SegmentHeader {
    /// Validate magic and version after mapping a foreign segment
    pub fn validate(&self) -> Result<()> {
        if self.magic != SEGMENT_MAGIC {
            return Err(VermeerError::invalid_parameter(
                "magic",
                "Invalid segment magic number",
            ));
        }
        if self.version != SEGMENT_VERSION {
            return Err(VermeerError::invalid_parameter(
                "version",
                "Unsupported segment layout version",
            ));
        }
        if self.pool_count == 0 || self.pool_count as usize > MAX_POOLS_PER_SEGMENT {
            return Err(VermeerError::invalid_parameter(
                "pool_count",
                "Pool count out of range",
            ));
        }
        Ok(())
    }
}

/// Placement of one pool's pieces inside the segment
#[derive(Debug, Clone, Copy)]
pub struct PoolPlacement {
    pub block_size: usize,
    pub block_count: usize,
    pub pool_offset: usize,
    pub freelist_offset: usize,
    pub base_offset: usize,
}

/// Complete placement plan for a segment
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    pub total_size: usize,
    pub management: PoolPlacement,
    pub pools: Vec<PoolPlacement>,
}

impl SegmentLayout {
    /// Compute the back-to-back layout for the configured size classes.
    ///
    /// Configured sizes are user payload capacities; each block additionally
    /// carries the chunk header and payload alignment slack. One management
    /// record exists per payload block, plus a small reserve so records for
    /// in-flight chunks never starve allocation.
    pub fn compute(entries: &[PoolEntry]) -> Result<Self> {
        use std::mem::size_of;

        if entries.is_empty() || entries.len() > MAX_POOLS_PER_SEGMENT {
            return Err(VermeerError::invalid_parameter(
                "entries",
                format!("Between 1 and {} pools per segment", MAX_POOLS_PER_SEGMENT),
            ));
        }

        let header_end = align_up(size_of::<SegmentHeader>(), BLOCK_ALIGNMENT);
        let pool_records = entries.len() + 1; // management pool first
        let records_end = align_up(
            header_end + pool_records * size_of::<super::pool::MemPool>(),
            BLOCK_ALIGNMENT,
        );

        let total_blocks: usize = entries.iter().map(|e| e.block_count).sum();
        let management_count = total_blocks + total_blocks / 8 + 1;
        let management_block = align_up(size_of::<ChunkManagement>(), 8);

        // Free-list index arrays for the management pool and every payload pool
        let mut cursor = records_end;
        let management_freelist = cursor;
        cursor += management_count * size_of::<u32>();
        let mut pool_freelists = Vec::with_capacity(entries.len());
        for entry in entries {
            pool_freelists.push(cursor);
            cursor += entry.block_count * size_of::<u32>();
        }
        cursor = align_up(cursor, BLOCK_ALIGNMENT);

        // Management record blocks
        let management_base = cursor;
        cursor = align_up(cursor + management_count * management_block, BLOCK_ALIGNMENT);

        let management = PoolPlacement {
            block_size: management_block,
            block_count: management_count,
            pool_offset: header_end,
            freelist_offset: management_freelist,
            base_offset: management_base,
        };

        // Payload pools, ascending
        let mut pools = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let block_size = align_up(
                ChunkHeader::required_chunk_size(entry.block_size, BLOCK_ALIGNMENT.min(8)),
                BLOCK_ALIGNMENT,
            );
            let base_offset = cursor;
            cursor = align_up(cursor + block_size * entry.block_count, BLOCK_ALIGNMENT);
            pools.push(PoolPlacement {
                block_size,
                block_count: entry.block_count,
                pool_offset: header_end + (i + 1) * std::mem::size_of::<super::pool::MemPool>(),
                freelist_offset: pool_freelists[i],
                base_offset,
            });
        }

        Ok(Self {
            total_size: cursor,
            management,
            pools,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_ordered_and_disjoint() {
        let entries = [PoolEntry::new(256, 4), PoolEntry::new(1024, 2)];
        let layout = SegmentLayout::compute(&entries).unwrap();

        assert_eq!(layout.pools.len(), 2);
        assert!(layout.management.base_offset < layout.pools[0].base_offset);
        let p0_end =
            layout.pools[0].base_offset + layout.pools[0].block_size * layout.pools[0].block_count;
        assert!(p0_end <= layout.pools[1].base_offset);
        let p1_end =
            layout.pools[1].base_offset + layout.pools[1].block_size * layout.pools[1].block_count;
        assert!(p1_end <= layout.total_size);
    }

    #[test]
    fn test_blocks_carry_header_overhead() {
        let entries = [PoolEntry::new(128, 2)];
        let layout = SegmentLayout::compute(&entries).unwrap();
        assert!(layout.pools[0].block_size > 128);
        assert_eq!(layout.pools[0].block_size % BLOCK_ALIGNMENT, 0);
    }

    #[test]
    fn test_management_records_cover_all_blocks() {
        let entries = [PoolEntry::new(256, 16), PoolEntry::new(4096, 16)];
        let layout = SegmentLayout::compute(&entries).unwrap();
        assert!(layout.management.block_count >= 32);
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(SegmentLayout::compute(&[]).is_err());
    }
}
