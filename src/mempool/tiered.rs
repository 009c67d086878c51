//! Tiered pool: size-class selection over the pools of one segment

use std::sync::Arc;

use crate::config::PoolEntry;
use crate::error::{Result, VermeerError};
use crate::mempool::chunk::{ChunkManagement, SharedChunk};
use crate::mempool::chunk_header::ChunkHeader;
use crate::mempool::layout::{SegmentHeader, SegmentLayout, SEGMENT_MAGIC, SEGMENT_VERSION};
use crate::mempool::pool::MemPool;
use crate::relative_ptr::{RelPtr, SegmentId, SegmentRegistry};

/// Observational view of one pool's fill level
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub block_size: usize,
    pub block_count: u32,
    pub used_count: u32,
}

/// Process-local view of the pools laid out in one data segment.
///
/// The broker constructs the layout once at startup; clients open the mapped
/// segment and parse the header. Chunk allocation picks the smallest size
/// class that fits and never falls back to a larger one, keeping worst-case
/// latency independent of neighbour pools.
#[derive(Clone)]
pub struct TieredPool {
    segment_id: SegmentId,
    registry: Arc<SegmentRegistry>,
}

impl TieredPool {
    /// Lay out and initialise the pools of a freshly created segment.
    ///
    /// # Safety
    /// `base` must be the mapped base of a zeroed region of at least
    /// `SegmentLayout::compute(entries)?.total_size` bytes, already
    /// registered with `registry` under `segment_id`.
    pub unsafe fn create_in(
        base: *mut u8,
        segment_id: SegmentId,
        entries: &[PoolEntry],
        registry: Arc<SegmentRegistry>,
    ) -> Result<Self> {
        let layout = SegmentLayout::compute(entries)?;

        let header = base as *mut SegmentHeader;
        (*header).magic = SEGMENT_MAGIC;
        (*header).version = SEGMENT_VERSION;
        (*header).pool_count = layout.pools.len() as u32;
        (*header).total_size = layout.total_size as u64;

        let place = |p: &crate::mempool::layout::PoolPlacement| {
            crate::mempool::layout::PoolRecord {
                block_size: p.block_size as u64,
                block_count: p.block_count as u64,
                pool_offset: p.pool_offset as u64,
                base_offset: p.base_offset as u64,
            }
        };
        (*header).management_pool = place(&layout.management);
        (*header).pools = [crate::mempool::layout::PoolRecord::EMPTY;
            crate::config::MAX_POOLS_PER_SEGMENT];
        for (i, placement) in layout.pools.iter().enumerate() {
            (*header).pools[i] = place(placement);
        }

        let init_pool = |placement: &crate::mempool::layout::PoolPlacement| unsafe {
            let pool = base.add(placement.pool_offset) as *mut MemPool;
            MemPool::init(
                pool,
                &registry,
                placement.block_size,
                placement.block_count as u32,
                RelPtr::new(segment_id, placement.freelist_offset as u64),
                RelPtr::new(segment_id, placement.base_offset as u64),
            );
        };
        init_pool(&layout.management);
        for placement in &layout.pools {
            init_pool(placement);
        }

        Ok(Self {
            segment_id,
            registry,
        })
    }

    /// Open the pools of an already initialised, already registered segment
    pub fn open(segment_id: SegmentId, registry: Arc<SegmentRegistry>) -> Result<Self> {
        let pool = Self {
            segment_id,
            registry,
        };
        pool.header().validate()?;
        Ok(pool)
    }

    fn header(&self) -> &SegmentHeader {
        let ptr = self.registry.resolve(self.segment_id, 0) as *const SegmentHeader;
        unsafe { &*ptr }
    }

    fn pool_at(&self, offset: u64) -> &MemPool {
        unsafe { &*(self.registry.resolve(self.segment_id, offset) as *const MemPool) }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    /// Loan a chunk for a payload of `payload_size` bytes at `alignment`.
    ///
    /// Picks the smallest pool whose blocks fit header, alignment slack and
    /// payload; exhaustion of that pool is an error even when larger pools
    /// have free blocks.
    pub fn loan(&self, payload_size: usize, alignment: usize) -> Result<SharedChunk> {
        if !alignment.is_power_of_two() {
            return Err(VermeerError::invalid_parameter(
                "alignment",
                "Payload alignment must be a power of two",
            ));
        }
        let needed = ChunkHeader::required_chunk_size(payload_size, alignment);
        let header = self.header();

        let mut chosen = None;
        for record in header.pools.iter().take(header.pool_count as usize) {
            if record.block_size as usize >= needed {
                chosen = Some(*record);
                break;
            }
        }
        let record = chosen.ok_or(VermeerError::ChunkTooLarge { payload_size })?;

        let pool = self.pool_at(record.pool_offset);
        let block = pool
            .get_chunk(&self.registry)
            .ok_or(VermeerError::OutOfChunks { payload_size })?;

        let management_pool = self.pool_at(header.management_pool.pool_offset);
        let record_block = match management_pool.get_chunk(&self.registry) {
            Some(ptr) => ptr,
            None => {
                pool.free_chunk(&self.registry, block);
                return Err(VermeerError::pool_exhausted("chunk management records"));
            }
        };

        unsafe {
            let chunk_header = ChunkHeader::init(
                block,
                record.block_size as usize,
                payload_size,
                alignment,
            );
            let management = record_block as *mut ChunkManagement;
            ChunkManagement::init(
                management,
                RelPtr::from_addr(&self.registry, chunk_header),
                RelPtr::new(self.segment_id, record.pool_offset),
                RelPtr::new(self.segment_id, header.management_pool.pool_offset),
            );
            (*chunk_header).management = RelPtr::from_addr(&self.registry, management);

            Ok(SharedChunk::from_ref(
                RelPtr::from_addr(&self.registry, management),
                Arc::clone(&self.registry),
            ))
        }
    }

    /// Fill levels of every payload pool, ascending by block size
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        let header = self.header();
        header
            .pools
            .iter()
            .take(header.pool_count as usize)
            .map(|record| {
                let pool = self.pool_at(record.pool_offset);
                PoolStatus {
                    block_size: pool.block_size(),
                    block_count: pool.block_count(),
                    used_count: pool.used_count(),
                }
            })
            .collect()
    }

    /// Fill level of the management-record pool
    pub fn management_status(&self) -> PoolStatus {
        let header = self.header();
        let pool = self.pool_at(header.management_pool.pool_offset);
        PoolStatus {
            block_size: pool.block_size(),
            block_count: pool.block_count(),
            used_count: pool.used_count(),
        }
    }

    /// Total payload blocks currently claimed across all pools
    pub fn used_chunks(&self) -> u32 {
        self.pool_status().iter().map(|s| s.used_count).sum()
    }
}

impl std::fmt::Debug for TieredPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredPool")
            .field("segment_id", &self.segment_id)
            .field("pools", &self.pool_status())
            .finish()
    }
}

/// Heap-backed pool construction for unit tests of the layers above
#[cfg(test)]
pub(crate) fn backing_pool(entries: &[PoolEntry]) -> (TieredPool, Vec<u64>) {
    let layout = SegmentLayout::compute(entries).unwrap();
    let mut backing = vec![0u64; layout.total_size / 8 + 8];
    let registry = Arc::new(SegmentRegistry::new());
    registry
        .register(1, backing.as_mut_ptr() as *mut u8, layout.total_size)
        .unwrap();
    let pool = unsafe {
        TieredPool::create_in(backing.as_mut_ptr() as *mut u8, 1, entries, registry).unwrap()
    };
    (pool, backing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loan_and_release_returns_block() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(256, 4)]);

        let mut chunk = pool.loan(128, 8).unwrap();
        chunk.payload_mut().copy_from_slice(&[0xCD; 128]);
        assert_eq!(pool.used_chunks(), 1);
        assert_eq!(chunk.ref_count(), 1);

        drop(chunk);
        assert_eq!(pool.used_chunks(), 0);
        assert_eq!(pool.management_status().used_count, 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(128, 2)]);

        let a = pool.loan(64, 8).unwrap();
        let _b = pool.loan(64, 8).unwrap();
        assert!(matches!(
            pool.loan(64, 8),
            Err(VermeerError::OutOfChunks { .. })
        ));

        drop(a);
        assert!(pool.loan(64, 8).is_ok());
    }

    #[test]
    fn test_smallest_fitting_pool_chosen() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(128, 2), PoolEntry::new(4096, 2)]);

        let small = pool.loan(64, 8).unwrap();
        let status = pool.pool_status();
        assert_eq!(status[0].used_count, 1);
        assert_eq!(status[1].used_count, 0);

        let large = pool.loan(2048, 8).unwrap();
        let status = pool.pool_status();
        assert_eq!(status[0].used_count, 1);
        assert_eq!(status[1].used_count, 1);

        drop(small);
        drop(large);
    }

    #[test]
    fn test_no_fallback_to_larger_pool() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(128, 1), PoolEntry::new(4096, 4)]);

        let _held = pool.loan(64, 8).unwrap();
        // The small class is exhausted; the larger class must not serve it.
        assert!(matches!(
            pool.loan(64, 8),
            Err(VermeerError::OutOfChunks { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(128, 2)]);
        assert!(matches!(
            pool.loan(1 << 20, 8),
            Err(VermeerError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_clone_tracks_ref_count() {
        let (pool, _backing) = backing_pool(&[PoolEntry::new(256, 2)]);

        let chunk = pool.loan(32, 8).unwrap();
        let copy = chunk.clone();
        assert_eq!(chunk.ref_count(), 2);

        drop(chunk);
        assert_eq!(copy.ref_count(), 1);
        assert_eq!(pool.used_chunks(), 1);

        drop(copy);
        assert_eq!(pool.used_chunks(), 0);
    }

    #[test]
    fn test_open_validates_header() {
        let entries = [PoolEntry::new(256, 2)];
        let (pool, mut backing) = backing_pool(&entries);
        let registry = Arc::clone(pool.registry());

        // Reopening over the same registration sees the same pools
        let reopened = TieredPool::open(1, Arc::clone(&registry)).unwrap();
        assert_eq!(reopened.pool_status().len(), 1);

        // A trashed magic is rejected
        backing[0] = 0;
        assert!(TieredPool::open(1, registry).is_err());
    }
}
