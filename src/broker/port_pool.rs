//! Fixed-capacity record pools inside the management segment
//!
//! Publisher records, subscriber records and condition variables are
//! allocated from slot tables laid out once at broker startup. A slot is a
//! used flag plus an inline record; the broker dispatch thread is the only
//! allocator, the flag is atomic so other processes may safely read it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Result, VermeerError};
use crate::mempool::layout::align_up;
use crate::port::descriptor::PortDescriptor;
use crate::port::{PublisherData, SubscriberData};
use crate::relative_ptr::{RelPtr, SegmentId, SegmentRegistry};
use crate::sync::ConditionVariableData;

/// Magic number at the start of the management segment
pub const MANAGEMENT_MAGIC: u64 = 0x5645524D4D474D54; // "VERMMGMT"

const AREA_ALIGNMENT: usize = 64;

/// Header at offset 0 of the management segment
#[repr(C)]
pub struct ManagementHeader {
    pub magic: u64,
    pub version: u32,
    _pad: u32,
    pub total_size: u64,
    pub publishers: AreaRecord,
    pub subscribers: AreaRecord,
    pub conditions: AreaRecord,
}

/// Placement of one slot table
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AreaRecord {
    pub capacity: u32,
    _pad: u32,
    /// Offset of the `capacity` used flags
    pub flags_offset: u64,
    /// Offset of the first record
    pub records_offset: u64,
    /// Bytes from one record to the next
    pub stride: u64,
}

impl AreaRecord {
    const EMPTY: Self = Self {
        capacity: 0,
        _pad: 0,
        flags_offset: 0,
        records_offset: 0,
        stride: 0,
    };
}

/// Computed placement for the whole management segment
#[derive(Debug, Clone)]
pub struct PortPoolLayout {
    pub total_size: usize,
    publishers: AreaRecord,
    subscribers: AreaRecord,
    conditions: AreaRecord,
}

impl PortPoolLayout {
    pub fn compute(
        max_publishers: usize,
        max_subscribers: usize,
        max_conditions: usize,
    ) -> Result<Self> {
        if max_publishers == 0 || max_subscribers == 0 || max_conditions == 0 {
            return Err(VermeerError::invalid_parameter(
                "capacity",
                "Port pool capacities must be non-zero",
            ));
        }

        let mut cursor = align_up(std::mem::size_of::<ManagementHeader>(), AREA_ALIGNMENT);
        let mut area = |capacity: usize, record_size: usize, record_align: usize| {
            let flags_offset = cursor;
            cursor = align_up(
                cursor + capacity * std::mem::size_of::<AtomicU32>(),
                record_align.max(AREA_ALIGNMENT),
            );
            let stride = align_up(record_size, record_align);
            let records_offset = cursor;
            cursor = align_up(cursor + capacity * stride, AREA_ALIGNMENT);
            AreaRecord {
                capacity: capacity as u32,
                _pad: 0,
                flags_offset: flags_offset as u64,
                records_offset: records_offset as u64,
                stride: stride as u64,
            }
        };

        let publishers = area(
            max_publishers,
            std::mem::size_of::<PublisherData>(),
            std::mem::align_of::<PublisherData>(),
        );
        let subscribers = area(
            max_subscribers,
            std::mem::size_of::<SubscriberData>(),
            std::mem::align_of::<SubscriberData>(),
        );
        let conditions = area(
            max_conditions,
            std::mem::size_of::<ConditionVariableData>(),
            std::mem::align_of::<ConditionVariableData>(),
        );

        Ok(Self {
            total_size: cursor,
            publishers,
            subscribers,
            conditions,
        })
    }
}

/// Broker-side allocator over the management segment's slot tables
pub struct PortPool {
    segment_id: SegmentId,
    registry: Arc<SegmentRegistry>,
}

impl PortPool {
    /// Initialise the management segment in place
    ///
    /// # Safety
    /// `base` must be the mapped base of a zeroed region of at least
    /// `layout.total_size` bytes, registered under `segment_id`.
    pub unsafe fn create_in(
        base: *mut u8,
        segment_id: SegmentId,
        layout: &PortPoolLayout,
        registry: Arc<SegmentRegistry>,
    ) -> Self {
        let header = base as *mut ManagementHeader;
        header.write(ManagementHeader {
            magic: MANAGEMENT_MAGIC,
            version: 1,
            _pad: 0,
            total_size: layout.total_size as u64,
            publishers: layout.publishers,
            subscribers: layout.subscribers,
            conditions: layout.conditions,
        });
        // Flags and records start zeroed; a zero flag is a free slot.
        Self {
            segment_id,
            registry,
        }
    }

    fn header(&self) -> &ManagementHeader {
        unsafe { &*(self.registry.resolve(self.segment_id, 0) as *const ManagementHeader) }
    }

    fn flag(&self, area: &AreaRecord, index: usize) -> &AtomicU32 {
        let offset = area.flags_offset + (index * std::mem::size_of::<AtomicU32>()) as u64;
        unsafe { &*(self.registry.resolve(self.segment_id, offset) as *const AtomicU32) }
    }

    fn claim(&self, area: &AreaRecord, kind: &'static str) -> Result<u64> {
        for index in 0..area.capacity as usize {
            if self
                .flag(area, index)
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(area.records_offset + index as u64 * area.stride);
            }
        }
        Err(VermeerError::pool_exhausted(kind))
    }

    fn release(&self, area: &AreaRecord, offset: u64) -> Result<usize> {
        if offset < area.records_offset {
            return Err(VermeerError::UnknownHandle);
        }
        let relative = offset - area.records_offset;
        if relative % area.stride != 0 {
            return Err(VermeerError::UnknownHandle);
        }
        let index = (relative / area.stride) as usize;
        if index >= area.capacity as usize {
            return Err(VermeerError::UnknownHandle);
        }
        if self.flag(area, index).swap(0, Ordering::AcqRel) == 0 {
            return Err(VermeerError::UnknownHandle);
        }
        Ok(index)
    }

    /// Allocate and initialise a publisher record
    pub fn alloc_publisher(&self, descriptor: PortDescriptor) -> Result<RelPtr<PublisherData>> {
        let header = self.header();
        let offset = self.claim(&header.publishers, "publisher ports")?;
        let record = RelPtr::<PublisherData>::new(self.segment_id, offset);
        unsafe { PublisherData::init(record.resolve(&self.registry), descriptor) };
        Ok(record)
    }

    /// Return a publisher record; the caller must have torn it down
    pub fn free_publisher(&self, record: RelPtr<PublisherData>) -> Result<()> {
        if record.segment_id() != self.segment_id {
            return Err(VermeerError::UnknownHandle);
        }
        self.release(&self.header().publishers, record.offset())?;
        Ok(())
    }

    /// Allocate and initialise a subscriber record
    pub fn alloc_subscriber(&self, descriptor: PortDescriptor) -> Result<RelPtr<SubscriberData>> {
        let header = self.header();
        let offset = self.claim(&header.subscribers, "subscriber ports")?;
        let record = RelPtr::<SubscriberData>::new(self.segment_id, offset);
        if let Err(error) = unsafe { SubscriberData::init(record.resolve(&self.registry), descriptor) } {
            let _ = self.release(&self.header().subscribers, offset);
            return Err(error);
        }
        Ok(record)
    }

    /// Return a subscriber record; the caller must have drained its queue
    pub fn free_subscriber(&self, record: RelPtr<SubscriberData>) -> Result<()> {
        if record.segment_id() != self.segment_id {
            return Err(VermeerError::UnknownHandle);
        }
        self.release(&self.header().subscribers, record.offset())?;
        Ok(())
    }

    /// Allocate and initialise a condition variable
    pub fn alloc_condition(&self) -> Result<RelPtr<ConditionVariableData>> {
        let header = self.header();
        let offset = self.claim(&header.conditions, "condition variables")?;
        let record = RelPtr::<ConditionVariableData>::new(self.segment_id, offset);
        unsafe { ConditionVariableData::init(record.resolve(&self.registry)) };
        Ok(record)
    }

    /// Return a condition variable after waking its waiters
    pub fn free_condition(&self, record: RelPtr<ConditionVariableData>) -> Result<()> {
        if record.segment_id() != self.segment_id {
            return Err(VermeerError::UnknownHandle);
        }
        unsafe { &*record.resolve(&self.registry) }.shutdown();
        self.release(&self.header().conditions, record.offset())?;
        Ok(())
    }

    /// Slots in use: `(publishers, subscribers, conditions)`
    pub fn used(&self) -> (usize, usize, usize) {
        let header = self.header();
        let count = |area: &AreaRecord| {
            (0..area.capacity as usize)
                .filter(|&i| self.flag(area, i).load(Ordering::Relaxed) != 0)
                .count()
        };
        (
            count(&header.publishers),
            count(&header.subscribers),
            count(&header.conditions),
        )
    }

    /// Whether an offset is a currently live record of the given area
    pub fn is_live_publisher(&self, record: RelPtr<PublisherData>) -> bool {
        let header = self.header();
        record.segment_id() == self.segment_id
            && self.area_slot_live(&header.publishers, record.offset())
    }

    pub fn is_live_subscriber(&self, record: RelPtr<SubscriberData>) -> bool {
        let header = self.header();
        record.segment_id() == self.segment_id
            && self.area_slot_live(&header.subscribers, record.offset())
    }

    fn area_slot_live(&self, area: &AreaRecord, offset: u64) -> bool {
        if offset < area.records_offset {
            return false;
        }
        let relative = offset - area.records_offset;
        if relative % area.stride != 0 {
            return false;
        }
        let index = (relative / area.stride) as usize;
        index < area.capacity as usize && self.flag(area, index).load(Ordering::Acquire) != 0
    }
}
