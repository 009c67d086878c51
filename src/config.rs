//! Broker and pool configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VermeerError};

/// Upper bound on pools inside one data segment
pub const MAX_POOLS_PER_SEGMENT: usize = 16;

/// Upper bound on shared segments a process can map (id 0 is the null id)
pub const MAX_SEGMENTS: usize = 64;

/// Upper bound on the delivery-queue capacity a subscriber may request
pub const MAX_QUEUE_CAPACITY: usize = 256;

/// Upper bound on a publisher's history depth
pub const MAX_HISTORY_CAPACITY: usize = 16;

/// Upper bound on subscribers connected to one publisher
pub const MAX_SUBSCRIBERS_PER_PUBLISHER: usize = 64;

/// Upper bound on notification indices per condition variable
pub const MAX_NOTIFICATION_INDICES: usize = 64;

/// Upper bound on segments advertised in one registration handshake
pub const MAX_HANDSHAKE_SEGMENTS: usize = 16;

/// One `{block size, block count}` size class inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    /// Size of each block in bytes (payload capacity including chunk header)
    pub block_size: usize,
    /// Number of blocks in this pool
    pub block_count: usize,
}

impl PoolEntry {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
        }
    }
}

/// Pools of one access group, carved into one shared segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Access group owning the segment; becomes part of the segment name
    pub access_group: String,
    /// Size classes, ascending by block size
    pub pools: Vec<PoolEntry>,
}

impl SegmentConfig {
    pub fn new(access_group: impl Into<String>) -> Self {
        Self {
            access_group: access_group.into(),
            pools: Vec::new(),
        }
    }

    /// Add a size class
    pub fn with_pool(mut self, block_size: usize, block_count: usize) -> Self {
        self.pools.push(PoolEntry::new(block_size, block_count));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_group.is_empty() {
            return Err(VermeerError::invalid_parameter(
                "access_group",
                "Access group name cannot be empty",
            ));
        }
        if self.pools.is_empty() {
            return Err(VermeerError::invalid_parameter(
                "pools",
                "Segment needs at least one pool",
            ));
        }
        if self.pools.len() > MAX_POOLS_PER_SEGMENT {
            return Err(VermeerError::invalid_parameter(
                "pools",
                format!("At most {} pools per segment", MAX_POOLS_PER_SEGMENT),
            ));
        }
        let mut previous = 0usize;
        for entry in &self.pools {
            if entry.block_size == 0 || entry.block_count == 0 {
                return Err(VermeerError::invalid_parameter(
                    "pools",
                    "Block size and count must be non-zero",
                ));
            }
            if entry.block_size <= previous {
                return Err(VermeerError::invalid_parameter(
                    "pools",
                    "Pool block sizes must be strictly ascending",
                ));
            }
            previous = entry.block_size;
        }
        Ok(())
    }
}

/// Configuration recognised by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// One entry per access group / data segment
    pub segments: Vec<SegmentConfig>,
    /// Interval between discovery ticks in milliseconds
    pub discovery_interval_ms: u64,
    /// A process whose keep-alive epoch is older than this is considered dead
    pub keep_alive_threshold_ms: u64,
    /// Capacity of the publisher-port record pool
    pub max_publishers: usize,
    /// Capacity of the subscriber-port record pool
    pub max_subscribers: usize,
    /// Maximum registered client processes
    pub max_processes: usize,
    /// Directory for the broker and client control sockets
    pub runtime_dir: PathBuf,
    /// Directory for segment backing files
    pub segment_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            segments: vec![SegmentConfig::new("default")
                .with_pool(256, 128)
                .with_pool(1024, 64)
                .with_pool(16 * 1024, 32)
                .with_pool(128 * 1024, 8)],
            discovery_interval_ms: 100,
            keep_alive_threshold_ms: 1500,
            max_publishers: 64,
            max_subscribers: 128,
            max_processes: 32,
            runtime_dir: PathBuf::from("/tmp/vermeer"),
            segment_dir: PathBuf::from("/dev/shm"),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(VermeerError::invalid_parameter(
                "segments",
                "At least one segment is required",
            ));
        }
        // One handshake slot is reserved for the management segment.
        if self.segments.len() > MAX_HANDSHAKE_SEGMENTS - 1 {
            return Err(VermeerError::invalid_parameter(
                "segments",
                format!("At most {} data segments", MAX_HANDSHAKE_SEGMENTS - 1),
            ));
        }
        for segment in &self.segments {
            segment.validate()?;
        }
        if self.discovery_interval_ms == 0 || self.keep_alive_threshold_ms == 0 {
            return Err(VermeerError::invalid_parameter(
                "discovery_interval_ms",
                "Discovery interval and keep-alive threshold must be non-zero",
            ));
        }
        if self.max_publishers == 0 || self.max_subscribers == 0 || self.max_processes == 0 {
            return Err(VermeerError::invalid_parameter(
                "max_publishers",
                "Port and process pool capacities must be non-zero",
            ));
        }
        Ok(())
    }

    /// Path of the well-known broker request socket
    pub fn broker_socket(&self) -> PathBuf {
        self.runtime_dir.join("broker.sock")
    }

    /// Path of a client's reply socket
    pub fn client_socket(&self, app_name: &str) -> PathBuf {
        self.runtime_dir.join(format!("client_{}.sock", app_name))
    }
}
