//! Bounded lock-free delivery queue of chunk references
//!
//! One instance lives in shared memory per subscriber. The implementation is
//! a sequenced-slot array queue: every slot carries a ticket that encodes
//! whether it is free for the producer at a given position or holds a value
//! for the consumer. A reference is published to a slot only after its
//! count was already incremented by the producer, so a consumer can never
//! observe an uncounted chunk.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::MAX_QUEUE_CAPACITY;
use crate::error::{Result, VermeerError};
use crate::mempool::ChunkManagement;
use crate::relative_ptr::{RelPtr, SegmentId};
use crate::sync::condition::ConditionVariableData;

/// Behaviour when a push hits a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum OverflowPolicy {
    /// Evict the oldest entry to make room; the queue never rejects
    DiscardOldest = 0,
    /// Reject the new entry and report `QueueFull`
    RejectNew = 1,
}

impl OverflowPolicy {
    fn from_u32(raw: u32) -> Self {
        if raw == OverflowPolicy::RejectNew as u32 {
            OverflowPolicy::RejectNew
        } else {
            OverflowPolicy::DiscardOldest
        }
    }
}

/// Outcome of a push
#[derive(Debug)]
pub enum PushResult {
    /// Enqueued without displacement
    Pushed,
    /// Enqueued after evicting the oldest entries; the caller owns the
    /// returned references and must release them
    PushedWithEviction(Vec<RelPtr<ChunkManagement>>),
    /// Queue full under `RejectNew`; nothing was enqueued
    Rejected,
}

/// Sentinel for "no notification index attached"
pub const NO_NOTIFICATION_INDEX: u64 = u64::MAX;

/// Smallest usable queue capacity; below two the slot tickets of a push at
/// position `p` and a pop at position `p - capacity` become ambiguous
pub const MIN_QUEUE_CAPACITY: usize = 2;

#[repr(C)]
struct QueueSlot {
    /// Ticket: `position` when free for the producer at `position`,
    /// `position + 1` when holding that producer's value
    sequence: AtomicU64,
    value: UnsafeCell<RelPtr<ChunkManagement>>,
}

impl QueueSlot {
    const EMPTY: Self = Self {
        sequence: AtomicU64::new(0),
        value: UnsafeCell::new(RelPtr::NULL),
    };
}

/// Shared-memory state of one delivery queue
#[repr(C)]
pub struct ChunkQueueData {
    /// Usable capacity, at most `MAX_QUEUE_CAPACITY`
    capacity: u64,
    policy: u32,
    /// Set when an entry was evicted; cleared when read out
    overflow_flag: AtomicU32,
    push_position: AtomicU64,
    pop_position: AtomicU64,
    /// Attached condition variable, split into atomically readable halves
    condition_id: AtomicU64,
    condition_offset: AtomicU64,
    notification_index: AtomicU64,
    /// Statistics; observational
    pushed: AtomicU64,
    popped: AtomicU64,
    evicted: AtomicU64,
    slots: [QueueSlot; MAX_QUEUE_CAPACITY],
}

unsafe impl Send for ChunkQueueData {}
unsafe impl Sync for ChunkQueueData {}

impl ChunkQueueData {
    /// Initialise a queue in place
    ///
    /// # Safety
    /// `queue` must point to writable, properly aligned memory that nobody
    /// else is using.
    pub unsafe fn init(
        queue: *mut ChunkQueueData,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<()> {
        if capacity < MIN_QUEUE_CAPACITY || capacity > MAX_QUEUE_CAPACITY {
            return Err(VermeerError::invalid_parameter(
                "capacity",
                format!(
                    "Queue capacity must be in {}..={}",
                    MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY
                ),
            ));
        }
        queue.write(ChunkQueueData {
            capacity: capacity as u64,
            policy: policy as u32,
            overflow_flag: AtomicU32::new(0),
            push_position: AtomicU64::new(0),
            pop_position: AtomicU64::new(0),
            condition_id: AtomicU64::new(0),
            condition_offset: AtomicU64::new(0),
            notification_index: AtomicU64::new(NO_NOTIFICATION_INDEX),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            slots: [QueueSlot::EMPTY; MAX_QUEUE_CAPACITY],
        });
        for i in 0..capacity {
            (*queue).slots[i].sequence.store(i as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_u32(self.policy)
    }

    /// Entries currently enqueued; may be racy
    pub fn size(&self) -> usize {
        let push = self.push_position.load(Ordering::Relaxed);
        let pop = self.pop_position.load(Ordering::Relaxed);
        push.saturating_sub(pop) as usize
    }

    /// Push one reference; the reference must already be counted
    pub fn try_push(&self, value: RelPtr<ChunkManagement>) -> PushResult {
        let mut evictions: Vec<RelPtr<ChunkManagement>> = Vec::new();
        loop {
            match self.try_push_raw(value) {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    return if evictions.is_empty() {
                        PushResult::Pushed
                    } else {
                        self.evicted
                            .fetch_add(evictions.len() as u64, Ordering::Relaxed);
                        PushResult::PushedWithEviction(evictions)
                    };
                }
                Err(()) => match self.policy() {
                    OverflowPolicy::RejectNew => return PushResult::Rejected,
                    OverflowPolicy::DiscardOldest => {
                        if let Some(old) = self.try_pop() {
                            self.overflow_flag.store(1, Ordering::Release);
                            evictions.push(old);
                        }
                        // Either we made room or a consumer did; retry.
                    }
                },
            }
        }
    }

    /// One push attempt; `Err` means the queue was full at that instant
    fn try_push_raw(&self, value: RelPtr<ChunkManagement>) -> std::result::Result<(), ()> {
        loop {
            let position = self.push_position.load(Ordering::Relaxed);
            let slot = &self.slots[(position % self.capacity) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == position {
                if self
                    .push_position
                    .compare_exchange_weak(
                        position,
                        position + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    unsafe { slot.value.get().write(value) };
                    slot.sequence.store(position + 1, Ordering::Release);
                    return Ok(());
                }
            } else if sequence < position {
                return Err(());
            }
            // A competing producer advanced the position; reload.
            std::hint::spin_loop();
        }
    }

    /// Pop the oldest reference, or `None` when empty; wait-free
    pub fn try_pop(&self) -> Option<RelPtr<ChunkManagement>> {
        loop {
            let position = self.pop_position.load(Ordering::Relaxed);
            let slot = &self.slots[(position % self.capacity) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == position + 1 {
                if self
                    .pop_position
                    .compare_exchange_weak(
                        position,
                        position + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let value = unsafe { slot.value.get().read() };
                    // Hand the slot back to the producer lap
                    slot.sequence
                        .store(position + self.capacity, Ordering::Release);
                    self.popped.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
            } else if sequence <= position {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Surface and clear the overflow condition; true at most once per
    /// overflow episode
    pub fn take_overflow_flag(&self) -> bool {
        self.overflow_flag.swap(0, Ordering::AcqRel) != 0
    }

    /// Attach the wake-up trigger fired on every delivery
    pub fn attach_condition(&self, condition: RelPtr<ConditionVariableData>, index: u64) {
        self.condition_id
            .store(condition.segment_id(), Ordering::Relaxed);
        self.condition_offset
            .store(condition.offset(), Ordering::Relaxed);
        self.notification_index.store(index, Ordering::Release);
    }

    /// Remove the wake-up trigger
    pub fn detach_condition(&self) {
        self.notification_index
            .store(NO_NOTIFICATION_INDEX, Ordering::Release);
        self.condition_id.store(0, Ordering::Relaxed);
        self.condition_offset.store(0, Ordering::Relaxed);
    }

    /// Attached condition and notification index, if any
    pub fn condition(&self) -> Option<(RelPtr<ConditionVariableData>, u64)> {
        let index = self.notification_index.load(Ordering::Acquire);
        if index == NO_NOTIFICATION_INDEX {
            return None;
        }
        let id = self.condition_id.load(Ordering::Relaxed) as SegmentId;
        let offset = self.condition_offset.load(Ordering::Relaxed);
        if id == 0 {
            return None;
        }
        Some((RelPtr::new(id, offset), index))
    }

    /// Lifetime counters `(pushed, popped, evicted)`
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.pushed.load(Ordering::Relaxed),
            self.popped.load(Ordering::Relaxed),
            self.evicted.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn heap_queue(capacity: usize, policy: OverflowPolicy) -> Box<ChunkQueueData> {
        let layout = std::alloc::Layout::new::<ChunkQueueData>();
        unsafe {
            let raw = std::alloc::alloc(layout) as *mut ChunkQueueData;
            assert!(!raw.is_null());
            ChunkQueueData::init(raw, capacity, policy).unwrap();
            Box::from_raw(raw)
        }
    }

    fn chunk_ref(n: u64) -> RelPtr<ChunkManagement> {
        RelPtr::new(1, n * 64)
    }

    #[test]
    fn test_fifo_order() {
        let queue = heap_queue(8, OverflowPolicy::DiscardOldest);

        for i in 0..5 {
            assert!(matches!(queue.try_push(chunk_ref(i)), PushResult::Pushed));
        }
        assert_eq!(queue.size(), 5);

        for i in 0..5 {
            assert_eq!(queue.try_pop(), Some(chunk_ref(i)));
        }
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_discard_oldest_eviction() {
        let queue = heap_queue(2, OverflowPolicy::DiscardOldest);

        assert!(matches!(queue.try_push(chunk_ref(1)), PushResult::Pushed));
        assert!(matches!(queue.try_push(chunk_ref(2)), PushResult::Pushed));

        match queue.try_push(chunk_ref(3)) {
            PushResult::PushedWithEviction(evicted) => {
                assert_eq!(evicted, vec![chunk_ref(1)]);
            }
            other => panic!("expected eviction, got {:?}", other),
        }

        assert!(queue.take_overflow_flag());
        assert!(!queue.take_overflow_flag());

        assert_eq!(queue.try_pop(), Some(chunk_ref(2)));
        assert_eq!(queue.try_pop(), Some(chunk_ref(3)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_reject_new() {
        let queue = heap_queue(2, OverflowPolicy::RejectNew);

        assert!(matches!(queue.try_push(chunk_ref(1)), PushResult::Pushed));
        assert!(matches!(queue.try_push(chunk_ref(2)), PushResult::Pushed));
        assert!(matches!(queue.try_push(chunk_ref(3)), PushResult::Rejected));

        // Rejection is not an overflow: nothing was lost from the queue
        assert!(!queue.take_overflow_flag());

        assert_eq!(queue.try_pop(), Some(chunk_ref(1)));
        assert_eq!(queue.try_pop(), Some(chunk_ref(2)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(heap_queue(MIN_QUEUE_CAPACITY, OverflowPolicy::RejectNew).capacity() == 2);

        let layout = std::alloc::Layout::new::<ChunkQueueData>();
        unsafe {
            let raw = std::alloc::alloc(layout) as *mut ChunkQueueData;
            assert!(ChunkQueueData::init(raw, 0, OverflowPolicy::RejectNew).is_err());
            assert!(ChunkQueueData::init(raw, 1, OverflowPolicy::RejectNew).is_err());
            assert!(
                ChunkQueueData::init(raw, MAX_QUEUE_CAPACITY + 1, OverflowPolicy::RejectNew)
                    .is_err()
            );
            std::alloc::dealloc(raw as *mut u8, layout);
        }
    }

    #[test]
    fn test_condition_attachment() {
        let queue = heap_queue(4, OverflowPolicy::DiscardOldest);
        assert!(queue.condition().is_none());

        queue.attach_condition(RelPtr::new(2, 4096), 7);
        let (cond, index) = queue.condition().unwrap();
        assert_eq!(cond.segment_id(), 2);
        assert_eq!(cond.offset(), 4096);
        assert_eq!(index, 7);

        queue.detach_condition();
        assert!(queue.condition().is_none());
    }

    #[test]
    fn test_concurrent_producers_no_loss_no_duplicates() {
        let queue = Arc::new(heap_queue(MAX_QUEUE_CAPACITY, OverflowPolicy::RejectNew));
        let barrier = Arc::new(Barrier::new(3));
        const PER_PRODUCER: u64 = 100;

        let producers: Vec<_> = (0..2)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        let value = chunk_ref(p * 1000 + i + 1);
                        loop {
                            match queue.try_push(value) {
                                PushResult::Pushed => break,
                                _ => std::thread::yield_now(),
                            }
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        let mut seen = std::collections::HashSet::new();
        let mut collected = 0;
        while collected < 2 * PER_PRODUCER {
            if let Some(value) = queue.try_pop() {
                assert!(seen.insert(value.offset()), "duplicate pop");
                collected += 1;
            }
        }

        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(queue.try_pop(), None);
        assert_eq!(seen.len(), 2 * PER_PRODUCER as usize);
    }

    #[test]
    fn test_counters() {
        let queue = heap_queue(2, OverflowPolicy::DiscardOldest);
        queue.try_push(chunk_ref(1));
        queue.try_push(chunk_ref(2));
        queue.try_push(chunk_ref(3)); // evicts 1
        queue.try_pop();

        let (pushed, popped, evicted) = queue.counters();
        assert_eq!(pushed, 3);
        assert_eq!(evicted, 1);
        // The eviction pops internally as well
        assert_eq!(popped, 2);
    }
}
