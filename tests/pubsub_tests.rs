//! End-to-end publish/subscribe behaviour through the port graph
//!
//! The broker pieces run in-process: a port graph over real shared segments,
//! with user-facing port handles wrapped around the records it hands out.

use std::sync::Arc;

use tempfile::TempDir;
use vermeer::broker::PortGraph;
use vermeer::port::{PublisherPort, SubscriberPort};
use vermeer::{
    BrokerConfig, OverflowPolicy, PoolEntry, PortQos, PublisherState, SegmentConfig,
    ServiceDescription, SubscriberState, VermeerError,
};

struct Fixture {
    graph: PortGraph,
    _dir: TempDir,
}

fn fixture(pools: &[(usize, usize)]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut segment = SegmentConfig::new("default");
    for &(size, count) in pools {
        segment = segment.with_pool(size, count);
    }
    let config = BrokerConfig {
        segments: vec![segment],
        runtime_dir: dir.path().to_path_buf(),
        segment_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut graph = PortGraph::new(&config).unwrap();
    graph.register_process("test_app", std::process::id(), "default").unwrap();
    Fixture { graph, _dir: dir }
}

impl Fixture {
    fn publisher(&mut self, qos: PortQos) -> PublisherPort {
        let record = self
            .graph
            .create_publisher("test_app", ServiceDescription::new("radar", "front", "objects"), qos)
            .unwrap();
        let pool = self.graph.segments().default_pool().clone();
        PublisherPort::new(record, pool)
    }

    fn subscriber(&mut self, qos: PortQos) -> SubscriberPort {
        let record = self
            .graph
            .create_subscriber("test_app", ServiceDescription::new("radar", "front", "objects"), qos)
            .unwrap();
        SubscriberPort::new(record, Arc::clone(self.graph.registry()))
    }

    fn used_chunks(&self) -> u32 {
        self.graph.segments().default_pool().used_chunks()
    }
}

#[test]
fn test_round_trip() {
    let mut fixture = fixture(&[(256, 4)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos::default());
    assert_eq!(subscriber.state(), SubscriberState::Subscribed);

    let payload: Vec<u8> = (0x01..=0x80).collect();
    let delivered = publisher.publish(&payload).unwrap();
    assert_eq!(delivered, 1);

    let sample = subscriber.take().expect("one sample pending");
    assert_eq!(sample.payload(), payload.as_slice());
    assert_eq!(sample.header().sequence_number, 0);
    subscriber.release(sample);

    assert!(subscriber.take().is_none());
    assert_eq!(fixture.used_chunks(), 0);
}

#[test]
fn test_send_requires_offered_state() {
    let mut fixture = fixture(&[(256, 4)]);
    let publisher = fixture.publisher(PortQos {
        offer_on_create: 0,
        ..Default::default()
    });
    assert_eq!(publisher.state(), PublisherState::NotOffered);

    let chunk = publisher.loan(16, 8).unwrap();
    assert!(matches!(
        publisher.send(chunk),
        Err(VermeerError::InvalidState { .. })
    ));
    // The failed send released its chunk
    assert_eq!(fixture.used_chunks(), 0);

    publisher.offer();
    assert_eq!(publisher.state(), PublisherState::OfferRequested);
    fixture.graph.process_state_changes();
    assert_eq!(publisher.state(), PublisherState::Offered);
    assert!(publisher.publish(b"ok").is_ok());
}

#[test]
fn test_overflow_discard_oldest() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::DiscardOldest,
        ..Default::default()
    });

    publisher.publish(b"a").unwrap();
    publisher.publish(b"b").unwrap();
    publisher.publish(b"c").unwrap();

    let first = subscriber.take().unwrap();
    assert_eq!(first.payload(), b"b");
    let second = subscriber.take().unwrap();
    assert_eq!(second.payload(), b"c");
    assert!(subscriber.take().is_none());

    // Exactly one overflow episode is surfaced
    assert!(subscriber.has_overflowed());
    assert!(!subscriber.has_overflowed());

    drop(first);
    drop(second);
    assert_eq!(fixture.used_chunks(), 0);
}

#[test]
fn test_overflow_reject_new() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::RejectNew,
        ..Default::default()
    });

    // All three sends succeed publisher-side; rejection is per queue
    assert_eq!(publisher.publish(b"a").unwrap(), 1);
    assert_eq!(publisher.publish(b"b").unwrap(), 1);
    assert_eq!(publisher.publish(b"c").unwrap(), 0);

    let first = subscriber.take().unwrap();
    assert_eq!(first.payload(), b"a");
    let second = subscriber.take().unwrap();
    assert_eq!(second.payload(), b"b");
    assert!(subscriber.take().is_none());
    assert!(!subscriber.has_overflowed());

    // The rejected chunk's count was rolled back at send time
    drop(first);
    drop(second);
    assert_eq!(fixture.used_chunks(), 0);
}

#[test]
fn test_late_join_history_replay() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos {
        history_capacity: 3,
        ..Default::default()
    });

    for payload in [&b"1"[..], b"2", b"3", b"4"] {
        publisher.publish(payload).unwrap();
    }

    let subscriber = fixture.subscriber(PortQos {
        requested_history: 3,
        ..Default::default()
    });
    assert_eq!(subscriber.state(), SubscriberState::Subscribed);

    // min(N, H) most recent sends, in send order, before anything live
    for expected in [&b"2"[..], b"3", b"4"] {
        let sample = subscriber.take().unwrap();
        assert_eq!(sample.payload(), expected);
    }
    assert!(subscriber.take().is_none());

    publisher.publish(b"5").unwrap();
    assert_eq!(subscriber.take().unwrap().payload(), b"5");
}

#[test]
fn test_history_shorter_than_requested() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos {
        history_capacity: 8,
        ..Default::default()
    });
    publisher.publish(b"only").unwrap();

    let subscriber = fixture.subscriber(PortQos {
        requested_history: 5,
        ..Default::default()
    });
    assert_eq!(subscriber.take().unwrap().payload(), b"only");
    assert!(subscriber.take().is_none());
}

#[test]
fn test_qos_incompatible_history_keeps_waiting() {
    let mut fixture = fixture(&[(256, 8)]);
    let _publisher = fixture.publisher(PortQos {
        history_capacity: 1,
        ..Default::default()
    });

    // Requested history exceeds what the publisher keeps
    let subscriber = fixture.subscriber(PortQos {
        requested_history: 4,
        ..Default::default()
    });
    assert_eq!(subscriber.state(), SubscriberState::WaitForOffer);
    assert!(subscriber.take().is_none());
}

#[test]
fn test_per_publisher_order() {
    let mut fixture = fixture(&[(256, 64)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos {
        queue_capacity: 64,
        ..Default::default()
    });

    for i in 0u64..32 {
        publisher.publish(&i.to_le_bytes()).unwrap();
    }
    for i in 0u64..32 {
        let sample = subscriber.take().unwrap();
        assert_eq!(sample.payload(), i.to_le_bytes());
        assert_eq!(sample.header().sequence_number, i);
    }
}

#[test]
fn test_fan_out_to_multiple_subscribers() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos::default());
    let first = fixture.subscriber(PortQos::default());
    let second = fixture.subscriber(PortQos::default());
    assert_eq!(publisher.subscriber_count(), 2);

    assert_eq!(publisher.publish(b"shared").unwrap(), 2);

    let sample_a = first.take().unwrap();
    let sample_b = second.take().unwrap();
    // Same bytes, same chunk
    assert_eq!(sample_a.payload(), b"shared");
    assert_eq!(
        sample_a.header() as *const _ as usize,
        sample_b.header() as *const _ as usize
    );
    assert_eq!(fixture.used_chunks(), 1);

    drop(sample_a);
    drop(sample_b);
    assert_eq!(fixture.used_chunks(), 0);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos::default());

    publisher.publish(b"before").unwrap();
    subscriber.unsubscribe();
    assert_eq!(subscriber.state(), SubscriberState::UnsubscribeRequested);
    fixture.graph.process_state_changes();
    assert_eq!(subscriber.state(), SubscriberState::NotSubscribed);

    // The pending chunk was drained on unsubscribe, nothing leaks
    assert!(subscriber.take().is_none());
    assert_eq!(fixture.used_chunks(), 0);

    publisher.publish(b"after").unwrap();
    assert!(subscriber.take().is_none());
}

#[test]
fn test_stop_offer_disconnects() {
    let mut fixture = fixture(&[(256, 8)]);
    let publisher = fixture.publisher(PortQos::default());
    let subscriber = fixture.subscriber(PortQos::default());
    assert_eq!(subscriber.state(), SubscriberState::Subscribed);

    publisher.stop_offer();
    fixture.graph.process_state_changes();
    assert_eq!(publisher.state(), PublisherState::NotOffered);
    assert_eq!(subscriber.state(), SubscriberState::WaitForOffer);

    // Re-offering reconnects the waiting subscriber
    publisher.offer();
    fixture.graph.process_state_changes();
    assert_eq!(subscriber.state(), SubscriberState::Subscribed);
    publisher.publish(b"back").unwrap();
    assert_eq!(subscriber.take().unwrap().payload(), b"back");
}
