//! Broker: segments, port graph, discovery and the control channel

pub mod channel;
pub mod control;
pub mod daemon;
pub mod port_graph;
pub mod port_pool;
pub mod segment_manager;

pub use channel::ControlChannel;
pub use daemon::Broker;
pub use port_graph::{PortGraph, ProcessInfo};
pub use port_pool::{PortPool, PortPoolLayout};
pub use segment_manager::{SegmentInfo, SegmentManager, MANAGEMENT_SEGMENT_ID};
