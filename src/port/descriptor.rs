//! Port descriptors: service identity, QoS, roles and states

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::queue::OverflowPolicy;

/// Capacity of the capped identifier strings
pub const MAX_ID_STRING_LENGTH: usize = 64;

/// Fixed-capacity string stored inline in shared memory.
///
/// Oversized input is cut at a character boundary and flagged as truncated.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FixedString<const N: usize> {
    len: u32,
    truncated: u32,
    bytes: [u8; N],
}

impl<const N: usize> FixedString<N> {
    pub const EMPTY: Self = Self {
        len: 0,
        truncated: 0,
        bytes: [0; N],
    };

    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(N);
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; N];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self {
            len: end as u32,
            truncated: (end < s.len()) as u32,
            bytes,
        }
    }

    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(N);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated != 0
    }
}

impl<const N: usize> PartialEq for FixedString<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<const N: usize> Eq for FixedString<N> {}

impl<const N: usize> std::fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Capped identifier string used for services, instances, events and apps
pub type IdString = FixedString<MAX_ID_STRING_LENGTH>;

/// The `{service, instance, event}` triple a port is known by
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescription {
    pub service: IdString,
    pub instance: IdString,
    pub event: IdString,
}

impl ServiceDescription {
    pub fn new(service: &str, instance: &str, event: &str) -> Self {
        Self {
            service: IdString::new(service),
            instance: IdString::new(instance),
            event: IdString::new(event),
        }
    }
}

impl std::fmt::Display for ServiceDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.instance, self.event)
    }
}

/// Role of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PortRole {
    Publisher = 0,
    Subscriber = 1,
}

/// Quality of service of a port
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortQos {
    /// Publisher: chunks kept for late joiners
    pub history_capacity: u64,
    /// Subscriber: history chunks wanted on connect
    pub requested_history: u64,
    /// Subscriber: delivery queue capacity
    pub queue_capacity: u64,
    /// Subscriber: behaviour when the delivery queue is full
    pub overflow_policy: OverflowPolicy,
    /// Publisher: start in the offered state without an explicit `offer`
    pub offer_on_create: u32,
}

impl Default for PortQos {
    fn default() -> Self {
        Self {
            history_capacity: 0,
            requested_history: 0,
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::DiscardOldest,
            offer_on_create: 1,
        }
    }
}

impl PortQos {
    pub fn offers_on_create(&self) -> bool {
        self.offer_on_create != 0
    }
}

/// Chunk-sender states of a publisher port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PublisherState {
    NotOffered = 0,
    OfferRequested = 1,
    Offered = 2,
    StopOfferRequested = 3,
}

impl PublisherState {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::OfferRequested,
            2 => Self::Offered,
            3 => Self::StopOfferRequested,
            _ => Self::NotOffered,
        }
    }
}

/// Subscription states of a subscriber port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubscriberState {
    NotSubscribed = 0,
    SubscribeRequested = 1,
    Subscribed = 2,
    UnsubscribeRequested = 3,
    WaitForOffer = 4,
}

impl SubscriberState {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::SubscribeRequested,
            2 => Self::Subscribed,
            3 => Self::UnsubscribeRequested,
            4 => Self::WaitForOffer,
            _ => Self::NotSubscribed,
        }
    }
}

/// Persistent identification of a port, stored in shared memory
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PortDescriptor {
    pub service_description: ServiceDescription,
    /// Process-unique 128-bit id; also the chunk origin id for publishers
    pub unique_id: u128,
    pub role: u32,
    pub qos: PortQos,
    pub owner_pid: u32,
    pub owner_app: IdString,
}

impl PortDescriptor {
    pub fn new(
        service_description: ServiceDescription,
        role: PortRole,
        qos: PortQos,
        owner_app: &str,
    ) -> Self {
        Self {
            service_description,
            unique_id: next_unique_port_id(),
            role: role as u32,
            qos,
            owner_pid: std::process::id(),
            owner_app: IdString::new(owner_app),
        }
    }

    pub fn role(&self) -> PortRole {
        if self.role == PortRole::Subscriber as u32 {
            PortRole::Subscriber
        } else {
            PortRole::Publisher
        }
    }
}

/// Allocate a fresh 128-bit port id: a per-process salt in the upper half,
/// a monotonic counter in the lower
pub fn next_unique_port_id() -> u128 {
    static SALT: OnceLock<u64> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let salt = *SALT.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        nanos ^ ((std::process::id() as u64) << 32)
    });
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    ((salt as u128) << 64) | counter as u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_string_roundtrip() {
        let s = IdString::new("radar/front");
        assert_eq!(s.as_str(), "radar/front");
        assert!(!s.is_truncated());
        assert_eq!(s, IdString::new("radar/front"));
        assert_ne!(s, IdString::new("radar/rear"));
    }

    #[test]
    fn test_fixed_string_truncation() {
        let long = "x".repeat(100);
        let s = IdString::new(&long);
        assert_eq!(s.as_str().len(), MAX_ID_STRING_LENGTH);
        assert!(s.is_truncated());
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let s: FixedString<4> = FixedString::new("ab\u{00E9}c"); // é is 2 bytes
        assert!(s.is_truncated() || s.as_str().len() <= 4);
        assert!(std::str::from_utf8(s.as_str().as_bytes()).is_ok());
    }

    #[test]
    fn test_service_description_equality() {
        let a = ServiceDescription::new("radar", "front", "objects");
        let b = ServiceDescription::new("radar", "front", "objects");
        let c = ServiceDescription::new("radar", "front", "status");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_unique_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(next_unique_port_id()));
        }
    }

    #[test]
    fn test_descriptor_construction() {
        let descriptor = PortDescriptor::new(
            ServiceDescription::new("lidar", "roof", "points"),
            PortRole::Publisher,
            PortQos::default(),
            "driver",
        );
        assert_eq!(descriptor.role(), PortRole::Publisher);
        assert_eq!(descriptor.owner_pid, std::process::id());
        assert_eq!(descriptor.owner_app.as_str(), "driver");
        assert_ne!(descriptor.unique_id, 0);
    }
}
