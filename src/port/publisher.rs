//! Publisher port: chunk sender, history ring and lock-free fan-out
//!
//! The send path takes no lock and makes no blocking call. The connection
//! list is a table of atomically versioned slots the sender only reads; the
//! history ring is a single-writer sequenced ring in the style of the
//! delivery queue, validated by entry position so the broker can replay it
//! concurrently with live sends. Every pointer a concurrent reader may see
//! is packed into one atomic word, so a half-updated reference can never be
//! observed.
//!
//! Coordination with the broker (connect, disconnect, teardown) is by
//! bounded quiescence instead of mutual exclusion: a sender announces itself
//! in `sends_in_flight` for the duration of one send, and the broker waits,
//! with a timeout, for that count to reach zero before it frees anything a
//! sender might still touch. A process that dies mid-send therefore costs
//! the broker one bounded wait, never a wedge.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{MAX_HISTORY_CAPACITY, MAX_SUBSCRIBERS_PER_PUBLISHER};
use crate::error::{Result, VermeerError};
use crate::mempool::{ChunkManagement, SharedChunk, TieredPool};
use crate::port::descriptor::{PortDescriptor, PublisherState};
use crate::queue::{ChunkQueueData, PushResult};
use crate::relative_ptr::{RelPtr, SegmentRegistry};

/// Slot is empty and claimable
const SLOT_FREE: u32 = 0;
/// Broker claimed the slot and may be replaying history into it
const SLOT_CONNECTING: u32 = 1;
/// Live; senders deliver to it
const SLOT_ACTIVE: u32 = 2;

/// Marks a history entry as vacant or mid-update
const POSITION_INVALID: u64 = u64::MAX;

/// `(segment id, offset)` packed into one word so readers load it in one
/// atomic operation; segment ids are small and offsets fit 48 bits
fn pack_ref<T>(reference: RelPtr<T>) -> u64 {
    debug_assert!(reference.segment_id() < (1 << 16));
    debug_assert!(reference.offset() < (1 << 48));
    (reference.segment_id() << 48) | reference.offset()
}

fn unpack_ref<T>(packed: u64) -> RelPtr<T> {
    RelPtr::new(packed >> 48, packed & ((1 << 48) - 1))
}

/// One entry of the publisher's connection list
#[repr(C)]
#[derive(Debug)]
struct SubscriberSlot {
    state: AtomicU32,
    /// Valid while `state` is not `SLOT_FREE`; written before activation
    packed_queue: AtomicU64,
}

impl SubscriberSlot {
    const EMPTY: Self = Self {
        state: AtomicU32::new(SLOT_FREE),
        packed_queue: AtomicU64::new(0),
    };
}

/// One entry of the history ring.
///
/// `position` is the monotonic append index of the held chunk, or
/// `POSITION_INVALID` while vacant or being rewritten. A replayer validates
/// the position, conditionally claims the reference, and validates again;
/// an entry overwritten mid-replay fails the second check and the claim is
/// rolled back.
#[repr(C)]
#[derive(Debug)]
struct HistoryEntry {
    position: AtomicU64,
    packed_ref: AtomicU64,
}

impl HistoryEntry {
    const EMPTY: Self = Self {
        position: AtomicU64::new(POSITION_INVALID),
        packed_ref: AtomicU64::new(0),
    };
}

/// Shared-memory state of one publisher port.
///
/// One thread sends on a publisher at a time (sends are totally ordered per
/// publisher); the broker's dispatch thread connects, disconnects and
/// replays concurrently through the protocols above.
#[repr(C)]
pub struct PublisherData {
    pub descriptor: PortDescriptor,
    state: AtomicU32,
    sequence: AtomicU64,
    /// Chunks accepted by `send_chunk`; observational
    sent: AtomicU64,
    /// Senders currently inside a send; the broker's quiescence word
    sends_in_flight: AtomicU32,
    /// Next history append position
    history_head: AtomicU64,
    history: [HistoryEntry; MAX_HISTORY_CAPACITY],
    subscribers: [SubscriberSlot; MAX_SUBSCRIBERS_PER_PUBLISHER],
}

impl PublisherData {
    /// Initialise a publisher record in place
    ///
    /// # Safety
    /// `data` must point to writable, properly aligned, otherwise unused
    /// memory inside a registered segment.
    pub unsafe fn init(data: *mut PublisherData, descriptor: PortDescriptor) {
        let initial = if descriptor.qos.offers_on_create() {
            PublisherState::Offered
        } else {
            PublisherState::NotOffered
        };
        data.write(PublisherData {
            descriptor,
            state: AtomicU32::new(initial as u32),
            sequence: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            sends_in_flight: AtomicU32::new(0),
            history_head: AtomicU64::new(0),
            history: [HistoryEntry::EMPTY; MAX_HISTORY_CAPACITY],
            subscribers: [SubscriberSlot::EMPTY; MAX_SUBSCRIBERS_PER_PUBLISHER],
        });
    }

    pub fn state(&self) -> PublisherState {
        PublisherState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PublisherState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// User request to advertise; acknowledged by the broker's dispatch
    pub fn request_offer(&self) {
        match self.state() {
            PublisherState::NotOffered | PublisherState::StopOfferRequested => {
                self.set_state(PublisherState::OfferRequested)
            }
            _ => {}
        }
    }

    /// User request to withdraw the advertisement
    pub fn request_stop_offer(&self) {
        match self.state() {
            PublisherState::Offered | PublisherState::OfferRequested => {
                self.set_state(PublisherState::StopOfferRequested)
            }
            _ => {}
        }
    }

    /// Broker-side acknowledgement of a pending offer request
    pub fn acknowledge_offer(&self) {
        if self.state() == PublisherState::OfferRequested {
            self.set_state(PublisherState::Offered);
        }
    }

    /// Broker-side acknowledgement of a pending stop-offer request
    pub fn acknowledge_stop_offer(&self) {
        if self.state() == PublisherState::StopOfferRequested {
            self.set_state(PublisherState::NotOffered);
        }
    }

    /// Broker-side forced withdrawal ahead of teardown.
    ///
    /// Sequentially consistent so it pairs with the in-flight announcement
    /// in `send_chunk`: once the broker additionally observes
    /// `sends_in_flight == 0`, no sender can still slip past the state
    /// check.
    pub fn revoke(&self) {
        self.state
            .store(PublisherState::NotOffered as u32, Ordering::SeqCst);
    }

    pub fn is_offered(&self) -> bool {
        self.state() == PublisherState::Offered
    }

    /// Chunks accepted so far
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn history_capacity(&self) -> usize {
        (self.descriptor.qos.history_capacity as usize).min(MAX_HISTORY_CAPACITY)
    }

    /// Wait until no sender is inside a send; bounded.
    ///
    /// Returns false when the timeout elapsed with the count still non-zero,
    /// which after a revoke can only mean the counted sender died mid-send;
    /// the caller proceeds and logs, it must not wait forever.
    pub fn await_send_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.sends_in_flight.load(Ordering::SeqCst) != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    /// Deliver one chunk to every active subscriber and record it in the
    /// history ring. Lock-free: slot states and the ring are only ever
    /// updated through atomic publication. Returns the number of queues
    /// that accepted the chunk.
    pub fn send_chunk(
        &self,
        registry: &Arc<SegmentRegistry>,
        mut chunk: SharedChunk,
    ) -> Result<usize> {
        // Announce before the state check; revoke-then-quiesce on the broker
        // side relies on this order.
        self.sends_in_flight.fetch_add(1, Ordering::SeqCst);
        if PublisherState::from_u32(self.state.load(Ordering::SeqCst)) != PublisherState::Offered {
            self.sends_in_flight.fetch_sub(1, Ordering::Release);
            return Err(VermeerError::InvalidState {
                operation: "send",
                required: "an offered publisher port",
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let origin = self.descriptor.unique_id;
        chunk.header_mut().stamp(origin, sequence);

        let mut deliveries = 0usize;
        for slot in self.subscribers.iter() {
            if slot.state.load(Ordering::Acquire) != SLOT_ACTIVE {
                continue;
            }
            let queue = unpack_ref::<ChunkQueueData>(slot.packed_queue.load(Ordering::Relaxed));
            if queue.is_null() {
                continue;
            }
            if Self::deliver(registry, queue, chunk.chunk_ref()) {
                deliveries += 1;
            }
        }

        self.append_history(registry, chunk);
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.sends_in_flight.fetch_sub(1, Ordering::Release);
        Ok(deliveries)
    }

    /// Hand the caller's reference to the ring; a full ring releases its
    /// oldest entry first. Single writer: only the sending thread appends.
    fn append_history(&self, registry: &Arc<SegmentRegistry>, chunk: SharedChunk) {
        let capacity = self.history_capacity();
        if capacity == 0 {
            drop(chunk);
            return;
        }

        let position = self.history_head.load(Ordering::Relaxed);
        let entry = &self.history[(position % capacity as u64) as usize];

        let old_position = entry.position.load(Ordering::Relaxed);
        let old_packed = entry.packed_ref.load(Ordering::Relaxed);
        // Invalidate before releasing so a replayer that claimed the old
        // reference fails its revalidation and rolls the claim back.
        entry.position.store(POSITION_INVALID, Ordering::Release);
        if old_position != POSITION_INVALID {
            SharedChunk::release_ref(unpack_ref(old_packed), registry);
        }

        entry.packed_ref.store(pack_ref(chunk.into_ref()), Ordering::Relaxed);
        entry.position.store(position, Ordering::Release);
        self.history_head.store(position + 1, Ordering::Release);
    }

    /// Push one already-counted reference into one queue, handling policy
    /// and the refcount discipline. Returns whether the queue accepted it.
    fn deliver(
        registry: &Arc<SegmentRegistry>,
        queue: RelPtr<ChunkQueueData>,
        reference: RelPtr<ChunkManagement>,
    ) -> bool {
        let queue = unsafe { &*queue.resolve(registry) };
        // Counted before it becomes observable to the consumer
        ChunkManagement::increment_ref(reference, registry);
        match queue.try_push(reference) {
            PushResult::Pushed => {
                Self::notify(registry, queue);
                true
            }
            PushResult::PushedWithEviction(evicted) => {
                for old in evicted {
                    SharedChunk::release_ref(old, registry);
                }
                Self::notify(registry, queue);
                true
            }
            PushResult::Rejected => {
                // Roll the increment back; the consumer never saw it
                SharedChunk::release_ref(reference, registry);
                false
            }
        }
    }

    fn notify(registry: &Arc<SegmentRegistry>, queue: &ChunkQueueData) {
        if let Some((condition, index)) = queue.condition() {
            let condition = unsafe { &*condition.resolve(registry) };
            condition.post(index);
        }
    }

    /// Connect a subscriber queue, replaying up to `requested_history` of
    /// the most recent chunks in send order before the slot goes live.
    ///
    /// Broker-side. The slot rests in `SLOT_CONNECTING` during replay, so
    /// live sends skip it and the subscriber observes history strictly
    /// before its live stream starts.
    pub fn connect_subscriber(
        &self,
        registry: &Arc<SegmentRegistry>,
        queue: RelPtr<ChunkQueueData>,
        requested_history: u64,
        quiesce_timeout: Duration,
    ) -> Result<()> {
        let packed = pack_ref(queue);
        if self
            .subscribers
            .iter()
            .any(|slot| {
                slot.state.load(Ordering::Acquire) != SLOT_FREE
                    && slot.packed_queue.load(Ordering::Relaxed) == packed
            })
        {
            return Ok(());
        }

        let slot = self
            .subscribers
            .iter()
            .find(|slot| {
                slot.state
                    .compare_exchange(
                        SLOT_FREE,
                        SLOT_CONNECTING,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            })
            .ok_or(VermeerError::TooManyConsumers)?;

        // A sender may still hold a snapshot of this slot from its previous
        // occupant; let in-flight sends drain before rewriting the pointer.
        if !self.await_send_quiescence(quiesce_timeout) {
            log::warn!("send quiescence timed out while connecting a subscriber");
        }
        slot.packed_queue.store(packed, Ordering::Relaxed);

        self.replay_history(registry, queue, requested_history);
        slot.state.store(SLOT_ACTIVE, Ordering::Release);
        Ok(())
    }

    /// Push up to `requested` of the most recent history chunks, oldest
    /// first, validating each entry against concurrent appends.
    fn replay_history(
        &self,
        registry: &Arc<SegmentRegistry>,
        queue: RelPtr<ChunkQueueData>,
        requested: u64,
    ) {
        let capacity = self.history_capacity() as u64;
        if capacity == 0 || requested == 0 {
            return;
        }
        let head = self.history_head.load(Ordering::Acquire);
        let available = head.min(capacity);
        let replay = requested.min(available);

        for position in (head - replay)..head {
            let entry = &self.history[(position % capacity) as usize];
            if entry.position.load(Ordering::Acquire) != position {
                continue;
            }
            let reference =
                unpack_ref::<ChunkManagement>(entry.packed_ref.load(Ordering::Relaxed));
            if reference.is_null() {
                continue;
            }
            // Claim, then make sure the entry still held this reference;
            // an entry rewritten in between gets its claim rolled back.
            if !ChunkManagement::try_increment_ref(reference, registry) {
                continue;
            }
            if entry.position.load(Ordering::Acquire) != position {
                SharedChunk::release_ref(reference, registry);
                continue;
            }
            let queue_data = unsafe { &*queue.resolve(registry) };
            match queue_data.try_push(reference) {
                PushResult::Pushed => Self::notify(registry, queue_data),
                PushResult::PushedWithEviction(evicted) => {
                    for old in evicted {
                        SharedChunk::release_ref(old, registry);
                    }
                    Self::notify(registry, queue_data);
                }
                PushResult::Rejected => SharedChunk::release_ref(reference, registry),
            }
        }
    }

    /// Remove a subscriber queue from the connection list. In-flight chunks
    /// keep their counts; the consumer or its teardown releases them.
    pub fn disconnect_subscriber(&self, queue: RelPtr<ChunkQueueData>) {
        let packed = pack_ref(queue);
        for slot in self.subscribers.iter() {
            if slot.state.load(Ordering::Acquire) != SLOT_FREE
                && slot.packed_queue.load(Ordering::Relaxed) == packed
            {
                slot.state.store(SLOT_FREE, Ordering::Release);
            }
        }
    }

    /// Drop every connection; used on withdrawal and port removal
    pub fn disconnect_all(&self) {
        for slot in self.subscribers.iter() {
            slot.state.store(SLOT_FREE, Ordering::Release);
        }
    }

    /// Release every chunk held by the history ring.
    ///
    /// Broker-side, on port removal, after a revoke and a quiescence wait:
    /// by then no sender is appending, so plain entry reads are stable.
    pub fn release_history(&self, registry: &Arc<SegmentRegistry>) {
        for entry in self.history.iter() {
            let position = entry.position.load(Ordering::Acquire);
            if position == POSITION_INVALID {
                continue;
            }
            let reference =
                unpack_ref::<ChunkManagement>(entry.packed_ref.load(Ordering::Relaxed));
            entry.position.store(POSITION_INVALID, Ordering::Release);
            if !reference.is_null() {
                SharedChunk::release_ref(reference, registry);
            }
        }
    }

    /// Connected subscriber count; observational
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_ACTIVE)
            .count()
    }

    /// Chunks currently held in the history ring; observational
    pub fn history_size(&self) -> u64 {
        self.history
            .iter()
            .filter(|entry| entry.position.load(Ordering::Acquire) != POSITION_INVALID)
            .count() as u64
    }
}

/// Process-local handle to a publisher port
pub struct PublisherPort {
    data: RelPtr<PublisherData>,
    pool: TieredPool,
}

impl PublisherPort {
    /// Wrap an existing publisher record
    pub fn new(data: RelPtr<PublisherData>, pool: TieredPool) -> Self {
        Self { data, pool }
    }

    pub fn data_ref(&self) -> RelPtr<PublisherData> {
        self.data
    }

    fn data(&self) -> &PublisherData {
        unsafe { &*self.data.resolve(self.pool.registry()) }
    }

    pub fn descriptor(&self) -> PortDescriptor {
        self.data().descriptor
    }

    pub fn state(&self) -> PublisherState {
        self.data().state()
    }

    /// Advertise this publisher; the broker completes the transition
    pub fn offer(&self) {
        self.data().request_offer();
    }

    /// Withdraw the advertisement; the broker completes the transition
    pub fn stop_offer(&self) {
        self.data().request_stop_offer();
    }

    /// Loan a chunk for in-place writing
    pub fn loan(&self, payload_size: usize, alignment: usize) -> Result<SharedChunk> {
        let mut chunk = self.pool.loan(payload_size, alignment)?;
        chunk.header_mut().origin_id = self.data().descriptor.unique_id;
        Ok(chunk)
    }

    /// Send a loaned chunk to all connected subscribers
    pub fn send(&self, chunk: SharedChunk) -> Result<usize> {
        let registry = Arc::clone(self.pool.registry());
        self.data().send_chunk(&registry, chunk)
    }

    /// Loan, fill from a byte slice and send in one step
    pub fn publish(&self, payload: &[u8]) -> Result<usize> {
        let mut chunk = self.loan(payload.len(), std::mem::align_of::<u64>())?;
        chunk.payload_mut().copy_from_slice(payload);
        self.send(chunk)
    }

    pub fn sent_count(&self) -> u64 {
        self.data().sent_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.data().subscriber_count()
    }
}

impl std::fmt::Debug for PublisherPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data();
        f.debug_struct("PublisherPort")
            .field("service", &data.descriptor.service_description.to_string())
            .field("state", &data.state())
            .field("sent", &data.sent_count())
            .finish()
    }
}
