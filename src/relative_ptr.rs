//! Relative pointers and the per-process segment registry
//!
//! Absolute addresses never cross the shared-memory boundary: every pointer
//! stored inside a segment is a `(segment id, byte offset)` pair that each
//! process resolves through its own table of mapped bases. The same segment
//! id maps to different virtual addresses in different processes.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::MAX_SEGMENTS;
use crate::error::{fatal, Result, VermeerError};

/// Segment identifier; `NULL_SEGMENT_ID` encodes the null pointer
pub type SegmentId = u64;

/// Distinguished id for the null relative pointer
pub const NULL_SEGMENT_ID: SegmentId = 0;

#[derive(Debug)]
struct SegmentSlot {
    /// Mapped base address; 0 means unregistered
    base: AtomicUsize,
    /// Mapped size in bytes
    size: AtomicU64,
}

impl SegmentSlot {
    const fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            size: AtomicU64::new(0),
        }
    }
}

/// Per-process table of mapped segments
///
/// Registration and unregistration serialise on a lock; resolution is two
/// atomic loads on a slot indexed directly by segment id.
#[derive(Debug)]
pub struct SegmentRegistry {
    slots: [SegmentSlot; MAX_SEGMENTS],
    registration: Mutex<()>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        const EMPTY: SegmentSlot = SegmentSlot::new();
        Self {
            slots: [EMPTY; MAX_SEGMENTS],
            registration: Mutex::new(()),
        }
    }

    /// Register a mapped segment under a broker-assigned id
    pub fn register(&self, id: SegmentId, base: *mut u8, size: usize) -> Result<()> {
        if id == NULL_SEGMENT_ID || id as usize >= MAX_SEGMENTS {
            return Err(VermeerError::invalid_parameter(
                "id",
                format!("Segment id must be in 1..{}", MAX_SEGMENTS),
            ));
        }
        if base.is_null() || size == 0 {
            return Err(VermeerError::invalid_parameter(
                "base",
                "Segment base and size must be non-zero",
            ));
        }
        let _guard = self.registration.lock().unwrap();
        let slot = &self.slots[id as usize];
        if slot.base.load(Ordering::Relaxed) != 0 {
            return Err(VermeerError::segment_exists(format!("segment {}", id)));
        }
        slot.size.store(size as u64, Ordering::Relaxed);
        slot.base.store(base as usize, Ordering::Release);
        Ok(())
    }

    /// Remove a segment from the table
    pub fn unregister(&self, id: SegmentId) -> Result<()> {
        if id == NULL_SEGMENT_ID || id as usize >= MAX_SEGMENTS {
            return Err(VermeerError::invalid_parameter("id", "Invalid segment id"));
        }
        let _guard = self.registration.lock().unwrap();
        let slot = &self.slots[id as usize];
        if slot.base.load(Ordering::Relaxed) == 0 {
            return Err(VermeerError::segment_not_found(format!("segment {}", id)));
        }
        slot.base.store(0, Ordering::Release);
        slot.size.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Resolve `(id, offset)` to a local address; wait-free
    ///
    /// Resolving through an unregistered id is a fatal invariant violation.
    pub fn resolve(&self, id: SegmentId, offset: u64) -> *mut u8 {
        if id == NULL_SEGMENT_ID {
            return std::ptr::null_mut();
        }
        if id as usize >= MAX_SEGMENTS {
            fatal("relative pointer with out-of-range segment id");
        }
        let slot = &self.slots[id as usize];
        let base = slot.base.load(Ordering::Acquire);
        if base == 0 {
            fatal("relative pointer with unregistered segment id");
        }
        if offset >= slot.size.load(Ordering::Relaxed) {
            fatal("relative pointer offset beyond segment bounds");
        }
        (base + offset as usize) as *mut u8
    }

    /// Find the segment containing `ptr`, returning `(id, offset)`
    pub fn find(&self, ptr: *const u8) -> Option<(SegmentId, u64)> {
        let addr = ptr as usize;
        for id in 1..MAX_SEGMENTS {
            let slot = &self.slots[id];
            let base = slot.base.load(Ordering::Acquire);
            if base == 0 {
                continue;
            }
            let size = slot.size.load(Ordering::Relaxed) as usize;
            if addr >= base && addr < base + size {
                return Some((id as SegmentId, (addr - base) as u64));
            }
        }
        None
    }

    /// Whether a segment id is currently registered
    pub fn is_registered(&self, id: SegmentId) -> bool {
        id != NULL_SEGMENT_ID
            && (id as usize) < MAX_SEGMENTS
            && self.slots[id as usize].base.load(Ordering::Acquire) != 0
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A pointer that is valid in every process mapping the segment
///
/// Stored inside shared memory wherever one shared-memory object refers to
/// another. Plain data: copying it does not imply ownership.
#[repr(C)]
pub struct RelPtr<T> {
    id: SegmentId,
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RelPtr<T> {
    /// The null relative pointer
    pub const NULL: Self = Self {
        id: NULL_SEGMENT_ID,
        offset: 0,
        _marker: PhantomData,
    };

    pub fn null() -> Self {
        Self::NULL
    }

    pub fn new(id: SegmentId, offset: u64) -> Self {
        Self {
            id,
            offset,
            _marker: PhantomData,
        }
    }

    /// Build a relative pointer from a local address
    ///
    /// The address must lie inside a registered segment; anything else is a
    /// programmer error and fatal.
    pub fn from_addr(registry: &SegmentRegistry, ptr: *const T) -> Self {
        if ptr.is_null() {
            return Self::NULL;
        }
        match registry.find(ptr as *const u8) {
            Some((id, offset)) => Self::new(id, offset),
            None => fatal("address does not belong to any registered segment"),
        }
    }

    pub fn is_null(&self) -> bool {
        self.id == NULL_SEGMENT_ID
    }

    pub fn segment_id(&self) -> SegmentId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Resolve to a local raw pointer; null resolves to null
    pub fn resolve(&self, registry: &SegmentRegistry) -> *mut T {
        registry.resolve(self.id, self.offset) as *mut T
    }

    /// Reinterpret as a relative pointer to another type at the same location
    pub fn cast<U>(&self) -> RelPtr<U> {
        RelPtr::new(self.id, self.offset)
    }
}

impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelPtr<T> {}

impl<T> std::fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelPtr")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> PartialEq for RelPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.offset == other.offset
    }
}

impl<T> Eq for RelPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_roundtrip() {
        let registry = SegmentRegistry::new();
        let mut backing = vec![0u8; 4096];
        let base = backing.as_mut_ptr();

        registry.register(3, base, backing.len()).unwrap();
        assert!(registry.is_registered(3));

        let ptr = registry.resolve(3, 128);
        assert_eq!(ptr as usize, base as usize + 128);

        registry.unregister(3).unwrap();
        assert!(!registry.is_registered(3));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = SegmentRegistry::new();
        let mut backing = vec![0u8; 1024];
        registry.register(1, backing.as_mut_ptr(), 1024).unwrap();
        assert!(registry.register(1, backing.as_mut_ptr(), 1024).is_err());
    }

    #[test]
    fn test_find_by_address() {
        let registry = SegmentRegistry::new();
        let mut backing = vec![0u8; 2048];
        let base = backing.as_mut_ptr();
        registry.register(7, base, 2048).unwrap();

        let inside = unsafe { base.add(100) };
        assert_eq!(registry.find(inside), Some((7, 100)));

        let outside = 0x1usize as *const u8;
        assert_eq!(registry.find(outside), None);
    }

    #[test]
    fn test_null_pointer_resolves_to_null() {
        let registry = SegmentRegistry::new();
        let ptr: RelPtr<u64> = RelPtr::null();
        assert!(ptr.is_null());
        assert!(ptr.resolve(&registry).is_null());
    }

    #[test]
    fn test_relative_pointer_across_two_mappings() {
        // Two registries with the same id at different bases model two
        // processes mapping the same segment.
        let registry_a = SegmentRegistry::new();
        let registry_b = SegmentRegistry::new();
        let mut mapping_a = vec![0u8; 1024];
        let mut mapping_b = vec![0u8; 1024];

        registry_a.register(5, mapping_a.as_mut_ptr(), 1024).unwrap();
        registry_b.register(5, mapping_b.as_mut_ptr(), 1024).unwrap();

        let rel = RelPtr::<u32>::from_addr(&registry_a, unsafe {
            mapping_a.as_ptr().add(64) as *const u32
        });
        assert_eq!(rel.segment_id(), 5);
        assert_eq!(rel.offset(), 64);

        let in_b = rel.resolve(&registry_b);
        assert_eq!(in_b as usize, mapping_b.as_mut_ptr() as usize + 64);
    }
}
