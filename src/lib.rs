//! # Vermeer - Zero-Copy Shared-Memory Publish/Subscribe
//!
//! Vermeer is a publish/subscribe transport for co-located processes.
//! Publishers loan fixed-size blocks from pre-sized pools inside shared
//! segments, write their payload in place and hand off a reference;
//! subscribers read the same bytes without any kernel-mediated copy. A
//! central broker owns the segments and mediates discovery, connection and
//! teardown.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Broker process                       │
//! │  segment manager │ port graph │ discovery │ control loop │
//! └──────────┬───────────────────────────────────┬───────────┘
//!            │ shared segments                   │ unix datagram
//!            ▼                                   ▼ control channel
//! ┌─────────────────────────┐        ┌─────────────────────────┐
//! │  Publisher process      │        │  Subscriber process     │
//! │  loan → write → send    │  ───►  │  take → read → release  │
//! └─────────────────────────┘        └─────────────────────────┘
//! ```
//!
//! Everything stored inside a segment refers to other shared objects through
//! relative pointers; the reference count next to each payload keeps a chunk
//! alive until its last holder, in whatever process, releases it.

// Core modules
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod mempool;
pub mod port;
pub mod queue;
pub mod relative_ptr;
pub mod sync;

// Main API re-exports
pub use broker::{Broker, PortGraph, SegmentManager};
pub use client::Runtime;
pub use config::{BrokerConfig, PoolEntry, SegmentConfig};
pub use error::{Result, VermeerError};
pub use memory::{BackingType, RegionConfig, SharedMemoryRegion};
pub use mempool::{ChunkHeader, MemPool, SharedChunk, TieredPool};
pub use port::{
    PortQos, PortRole, PublisherPort, PublisherState, ServiceDescription, SubscriberPort,
    SubscriberState,
};
pub use queue::OverflowPolicy;
pub use relative_ptr::{RelPtr, SegmentId, SegmentRegistry};
pub use sync::{ConditionListener, ConditionNotifier, IntervalTimer};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 4;
pub const VERSION_PATCH: u32 = 0;
