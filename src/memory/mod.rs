//! Shared memory regions

mod region;

pub use region::{BackingType, RegionConfig, SharedMemoryRegion};
