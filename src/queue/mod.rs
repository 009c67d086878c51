//! Lock-free delivery queues

pub mod chunk_queue;

pub use chunk_queue::{
    ChunkQueueData, OverflowPolicy, PushResult, MIN_QUEUE_CAPACITY, NO_NOTIFICATION_INDEX,
};
