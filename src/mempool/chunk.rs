//! Chunk management records and the owning chunk handle

use std::mem::ManuallyDrop;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::fatal;
use crate::mempool::chunk_header::ChunkHeader;
use crate::mempool::pool::MemPool;
use crate::relative_ptr::{RelPtr, SegmentRegistry};

/// Shared-memory record tracking one live chunk.
///
/// Lives in a dedicated small-block pool so chunk headers stay payload-sized.
/// While any port or sample holds the chunk the reference count is at least
/// one; the unique 1 → 0 transition returns the payload block and then this
/// record to their pools.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkManagement {
    /// The chunk this record manages
    pub chunk_header: RelPtr<ChunkHeader>,
    /// Outstanding references across all processes
    pub ref_count: AtomicU64,
    /// Pool the payload block came from
    pub mem_pool: RelPtr<MemPool>,
    /// Pool this record itself came from; read last during release
    pub management_pool: RelPtr<MemPool>,
}

impl ChunkManagement {
    /// Write a fresh record with a reference count of one
    ///
    /// # Safety
    /// `record` must point to writable, properly aligned memory inside the
    /// management pool's block array.
    pub unsafe fn init(
        record: *mut ChunkManagement,
        chunk_header: RelPtr<ChunkHeader>,
        mem_pool: RelPtr<MemPool>,
        management_pool: RelPtr<MemPool>,
    ) {
        std::ptr::addr_of_mut!((*record).chunk_header).write(chunk_header);
        std::ptr::addr_of_mut!((*record).mem_pool).write(mem_pool);
        std::ptr::addr_of_mut!((*record).management_pool).write(management_pool);
        // The count is what other processes probe; publish it last so a
        // concurrent conditional increment either sees the dead record (0)
        // or the fully initialised one.
        (*record).ref_count.store(1, Ordering::Release);
    }

    /// Increment the count behind a raw reference, ahead of handing it off
    pub fn increment_ref(reference: RelPtr<ChunkManagement>, registry: &SegmentRegistry) {
        let record = unsafe { &*reference.resolve(registry) };
        record.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment only while the record is alive.
    ///
    /// Returns false when the count is zero, which means the chunk was
    /// released (and its record possibly not yet reused). Used by readers
    /// that discovered the reference through a concurrently mutated
    /// structure and must not revive a dead record.
    pub fn try_increment_ref(reference: RelPtr<ChunkManagement>, registry: &SegmentRegistry) -> bool {
        let record = unsafe { &*reference.resolve(registry) };
        let mut count = record.ref_count.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match record.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }
}

/// Owning handle to a chunk; clone increments, drop releases.
///
/// Only the relative pointer inside ever crosses the process boundary; the
/// handle itself is process-local.
pub struct SharedChunk {
    management: RelPtr<ChunkManagement>,
    registry: Arc<SegmentRegistry>,
}

impl SharedChunk {
    /// Adopt an already-counted reference.
    ///
    /// # Safety
    /// `management` must point to a live record whose reference count
    /// includes the reference being adopted.
    pub unsafe fn from_ref(
        management: RelPtr<ChunkManagement>,
        registry: Arc<SegmentRegistry>,
    ) -> Self {
        debug_assert!(!management.is_null());
        Self {
            management,
            registry,
        }
    }

    /// Give up ownership without touching the reference count
    pub fn into_ref(self) -> RelPtr<ChunkManagement> {
        let this = ManuallyDrop::new(self);
        this.management
    }

    /// The relative pointer identifying this chunk
    pub fn chunk_ref(&self) -> RelPtr<ChunkManagement> {
        self.management
    }

    fn management(&self) -> &ChunkManagement {
        unsafe { &*self.management.resolve(&self.registry) }
    }

    /// The chunk header
    pub fn header(&self) -> &ChunkHeader {
        let mgmt = self.management();
        unsafe { &*mgmt.chunk_header.resolve(&self.registry) }
    }

    /// Mutable access to the chunk header; the loaning publisher is the only
    /// writer before the chunk is sent
    pub fn header_mut(&mut self) -> &mut ChunkHeader {
        let mgmt = self.management();
        unsafe { &mut *mgmt.chunk_header.resolve(&self.registry) }
    }

    /// The user payload bytes
    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        unsafe {
            std::slice::from_raw_parts(header.user_payload(), header.user_payload_size as usize)
        }
    }

    /// Writable user payload bytes
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header = self.header();
        unsafe {
            std::slice::from_raw_parts_mut(header.user_payload(), header.user_payload_size as usize)
        }
    }

    /// Current reference count; observational
    pub fn ref_count(&self) -> u64 {
        self.management().ref_count.load(Ordering::Relaxed)
    }

    /// Increment the count on behalf of a reference handed to someone else
    pub fn add_ref(&self) {
        self.management().ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Release one counted reference held as a raw relative pointer
    pub fn release_ref(management: RelPtr<ChunkManagement>, registry: &Arc<SegmentRegistry>) {
        // An adopt-and-drop keeps the release path in one place
        drop(unsafe { SharedChunk::from_ref(management, Arc::clone(registry)) });
    }
}

impl Clone for SharedChunk {
    fn clone(&self) -> Self {
        self.add_ref();
        Self {
            management: self.management,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for SharedChunk {
    fn drop(&mut self) {
        let mgmt_ptr = self.management.resolve(&self.registry);
        let mgmt = unsafe { &*mgmt_ptr };

        let previous = mgmt.ref_count.fetch_sub(1, Ordering::Release);
        if previous == 0 {
            fatal("chunk reference count underflow");
        }
        if previous != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Last reference: payload block first, management record last. The
        // record holds the pool back-pointers, so it must outlive the payload
        // free.
        let header_ptr = mgmt.chunk_header.resolve(&self.registry);
        let mem_pool = unsafe { &*mgmt.mem_pool.resolve(&self.registry) };
        let management_pool = unsafe { &*mgmt.management_pool.resolve(&self.registry) };

        mem_pool.free_chunk(&self.registry, header_ptr as *mut u8);
        management_pool.free_chunk(&self.registry, mgmt_ptr as *mut u8);
    }
}

impl std::fmt::Debug for SharedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedChunk")
            .field("management", &self.management)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

unsafe impl Send for SharedChunk {}
unsafe impl Sync for SharedChunk {}
