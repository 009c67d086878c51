//! Pool allocator and chunk lifecycle
//!
//! Segments are carved into pools of equally sized blocks at broker startup.
//! A chunk is one claimed block (header plus user payload) together with its
//! management record; the record's reference count keeps the block alive
//! across processes until the last holder releases it.

pub mod chunk;
pub mod chunk_header;
pub mod layout;
pub mod pool;
pub mod tiered;

pub use chunk::{ChunkManagement, SharedChunk};
pub use chunk_header::ChunkHeader;
pub use layout::{PoolRecord, SegmentHeader, SegmentLayout};
pub use pool::MemPool;
pub use tiered::{PoolStatus, TieredPool};
