//! Subscriber port: delivery queue, subscription state and wake-up hookup

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::mempool::SharedChunk;
use crate::port::descriptor::{PortDescriptor, SubscriberState};
use crate::config::MAX_QUEUE_CAPACITY;
use crate::queue::{ChunkQueueData, MIN_QUEUE_CAPACITY};
use crate::relative_ptr::{RelPtr, SegmentRegistry};
use crate::sync::condition::ConditionVariableData;

/// Shared-memory state of one subscriber port
#[repr(C)]
pub struct SubscriberData {
    pub descriptor: PortDescriptor,
    state: AtomicU32,
    /// Chunks taken by the consumer; observational
    received: AtomicU64,
    /// Chunks dropped because a peer disappeared; observational
    liveness_drops: AtomicU64,
    queue: ChunkQueueData,
}

impl SubscriberData {
    /// Initialise a subscriber record in place.
    ///
    /// The delivery queue takes its capacity and overflow policy from the
    /// descriptor's QoS; the subscription starts in `SubscribeRequested` and
    /// is advanced by the broker.
    ///
    /// # Safety
    /// `data` must point to writable, properly aligned, otherwise unused
    /// memory inside a registered segment.
    pub unsafe fn init(data: *mut SubscriberData, descriptor: PortDescriptor) -> Result<()> {
        std::ptr::addr_of_mut!((*data).descriptor).write(descriptor);
        std::ptr::addr_of_mut!((*data).state)
            .write(AtomicU32::new(SubscriberState::SubscribeRequested as u32));
        std::ptr::addr_of_mut!((*data).received).write(AtomicU64::new(0));
        std::ptr::addr_of_mut!((*data).liveness_drops).write(AtomicU64::new(0));

        let capacity = (descriptor.qos.queue_capacity as usize)
            .clamp(MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY);
        ChunkQueueData::init(
            std::ptr::addr_of_mut!((*data).queue),
            capacity,
            descriptor.qos.overflow_policy,
        )
    }

    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SubscriberState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// The delivery queue
    pub fn queue(&self) -> &ChunkQueueData {
        &self.queue
    }

    /// Relative pointer to the delivery queue, given this record's location
    pub fn queue_ref(&self, own: RelPtr<SubscriberData>) -> RelPtr<ChunkQueueData> {
        let queue_offset = {
            let base = self as *const SubscriberData as usize;
            let queue = &self.queue as *const ChunkQueueData as usize;
            (queue - base) as u64
        };
        RelPtr::new(own.segment_id(), own.offset() + queue_offset)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn liveness_drops(&self) -> u64 {
        self.liveness_drops.load(Ordering::Relaxed)
    }

    pub fn count_liveness_drops(&self, dropped: u64) {
        self.liveness_drops.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Pop and release everything still enqueued; returns the number of
    /// chunks released. Used on unsubscribe and port removal.
    pub fn drain(&self, registry: &Arc<SegmentRegistry>) -> usize {
        let mut drained = 0;
        while let Some(reference) = self.queue.try_pop() {
            SharedChunk::release_ref(reference, registry);
            drained += 1;
        }
        drained
    }
}

/// Process-local handle to a subscriber port
pub struct SubscriberPort {
    data: RelPtr<SubscriberData>,
    registry: Arc<SegmentRegistry>,
}

impl SubscriberPort {
    /// Wrap an existing subscriber record
    pub fn new(data: RelPtr<SubscriberData>, registry: Arc<SegmentRegistry>) -> Self {
        Self { data, registry }
    }

    pub fn data_ref(&self) -> RelPtr<SubscriberData> {
        self.data
    }

    fn data(&self) -> &SubscriberData {
        unsafe { &*self.data.resolve(&self.registry) }
    }

    pub fn descriptor(&self) -> PortDescriptor {
        self.data().descriptor
    }

    pub fn state(&self) -> SubscriberState {
        self.data().state()
    }

    /// Ask to be connected to matching offers; the broker completes the
    /// transition
    pub fn subscribe(&self) {
        let data = self.data();
        if data.state() == SubscriberState::NotSubscribed {
            data.set_state(SubscriberState::SubscribeRequested);
        }
    }

    /// Ask to be disconnected; the broker completes the transition
    pub fn unsubscribe(&self) {
        let data = self.data();
        match data.state() {
            SubscriberState::Subscribed | SubscriberState::WaitForOffer => {
                data.set_state(SubscriberState::UnsubscribeRequested)
            }
            _ => {}
        }
    }

    /// Pop the next delivered chunk, or `None` when the queue is empty
    pub fn take(&self) -> Option<SharedChunk> {
        let data = self.data();
        let reference = data.queue.try_pop()?;
        data.received.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { SharedChunk::from_ref(reference, Arc::clone(&self.registry)) })
    }

    /// Release a taken chunk; equivalent to dropping it
    pub fn release(&self, chunk: SharedChunk) {
        drop(chunk);
    }

    /// Whether deliveries were lost to overflow since the last call;
    /// reported once per overflow episode
    pub fn has_overflowed(&self) -> bool {
        self.data().queue.take_overflow_flag()
    }

    /// Register the wake-up trigger fired on every delivery
    pub fn attach_condition(&self, condition: RelPtr<ConditionVariableData>, index: u64) {
        self.data().queue.attach_condition(condition, index);
    }

    /// Remove the wake-up trigger
    pub fn detach_condition(&self) {
        self.data().queue.detach_condition();
    }

    /// Entries currently waiting in the delivery queue
    pub fn pending(&self) -> usize {
        self.data().queue.size()
    }

    pub fn received_count(&self) -> u64 {
        self.data().received_count()
    }

    /// Pop and release everything still enqueued
    pub fn drain(&self) -> usize {
        self.data().drain(&self.registry)
    }
}

impl std::fmt::Debug for SubscriberPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data();
        f.debug_struct("SubscriberPort")
            .field("service", &data.descriptor.service_description.to_string())
            .field("state", &data.state())
            .field("pending", &data.queue().size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolEntry;
    use crate::mempool::tiered::backing_pool;
    use crate::mempool::{ChunkManagement, TieredPool};
    use crate::port::descriptor::{PortQos, PortRole, ServiceDescription};
    use crate::queue::OverflowPolicy;

    /// Subscriber record carved out of the test pool's segment
    fn subscriber_in_segment(
        pool: &TieredPool,
        qos: PortQos,
    ) -> (SubscriberPort, RelPtr<SubscriberData>) {
        let descriptor = PortDescriptor::new(
            ServiceDescription::new("svc", "inst", "evt"),
            PortRole::Subscriber,
            qos,
            "unit_test",
        );
        let chunk = pool
            .loan(std::mem::size_of::<SubscriberData>() + 64, 64)
            .unwrap();
        let target = chunk.header().user_payload() as *mut SubscriberData;
        unsafe { SubscriberData::init(target, descriptor).unwrap() };
        let record = RelPtr::from_addr(pool.registry(), target);
        // The record's block stays claimed for the whole test
        std::mem::forget(chunk);
        (
            SubscriberPort::new(record, Arc::clone(pool.registry())),
            record,
        )
    }

    fn test_pool() -> (TieredPool, Vec<u64>) {
        backing_pool(&[PoolEntry::new(256, 16), PoolEntry::new(16 * 1024, 4)])
    }

    #[test]
    fn test_subscription_state_machine() {
        let (pool, _backing) = test_pool();
        let (port, _record) = subscriber_in_segment(&pool, PortQos::default());
        assert_eq!(port.state(), SubscriberState::SubscribeRequested);

        let data = unsafe { &*_record.resolve(pool.registry()) };
        data.set_state(SubscriberState::Subscribed);
        port.unsubscribe();
        assert_eq!(port.state(), SubscriberState::UnsubscribeRequested);

        data.set_state(SubscriberState::NotSubscribed);
        port.subscribe();
        assert_eq!(port.state(), SubscriberState::SubscribeRequested);
    }

    #[test]
    fn test_queue_ref_points_at_own_queue() {
        let (pool, _backing) = test_pool();
        let (port, record) = subscriber_in_segment(&pool, PortQos::default());
        let data = unsafe { &*record.resolve(pool.registry()) };

        let queue_ref = data.queue_ref(record);
        let resolved = queue_ref.resolve(pool.registry()) as usize;
        assert_eq!(resolved, data.queue() as *const _ as usize);
        drop(port);
    }

    #[test]
    fn test_take_owns_the_reference() {
        let (pool, _backing) = test_pool();
        let (port, record) = subscriber_in_segment(&pool, PortQos::default());
        let data = unsafe { &*record.resolve(pool.registry()) };
        let before = pool.used_chunks();

        let mut chunk = pool.loan(32, 8).unwrap();
        chunk.payload_mut().fill(0x77);
        // Hand one counted reference to the queue, as a publisher would
        ChunkManagement::increment_ref(chunk.chunk_ref(), pool.registry());
        data.queue().try_push(chunk.chunk_ref());
        drop(chunk);

        let sample = port.take().expect("queued sample");
        assert_eq!(sample.payload(), &[0x77; 32][..]);
        assert_eq!(port.received_count(), 1);
        assert!(port.take().is_none());

        port.release(sample);
        assert_eq!(pool.used_chunks(), before);
    }

    #[test]
    fn test_drain_releases_everything() {
        let (pool, _backing) = test_pool();
        let (port, record) = subscriber_in_segment(&pool, PortQos::default());
        let data = unsafe { &*record.resolve(pool.registry()) };
        let before = pool.used_chunks();

        for _ in 0..3 {
            let chunk = pool.loan(16, 8).unwrap();
            ChunkManagement::increment_ref(chunk.chunk_ref(), pool.registry());
            data.queue().try_push(chunk.chunk_ref());
            drop(chunk);
        }
        assert_eq!(port.pending(), 3);

        assert_eq!(port.drain(), 3);
        assert_eq!(port.pending(), 0);
        assert_eq!(pool.used_chunks(), before);
    }

    #[test]
    fn test_overflow_policy_from_qos() {
        let (pool, _backing) = test_pool();
        let (_port, record) = subscriber_in_segment(
            &pool,
            PortQos {
                queue_capacity: 4,
                overflow_policy: OverflowPolicy::RejectNew,
                ..Default::default()
            },
        );
        let data = unsafe { &*record.resolve(pool.registry()) };
        assert_eq!(data.queue().capacity(), 4);
        assert_eq!(data.queue().policy(), OverflowPolicy::RejectNew);
    }
}
