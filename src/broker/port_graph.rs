//! Broker-resident port registry, matching and discovery
//!
//! All mutation runs on the broker's dispatch thread; ports and processes
//! live in shared memory but the graph bookkeeping is broker-local. The
//! periodic discovery tick advances pending port state machines and prunes
//! processes whose keep-alive epoch went stale, returning every chunk they
//! still held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::BrokerConfig;
use crate::error::{Result, VermeerError};
use crate::port::descriptor::{
    PortDescriptor, PortQos, PortRole, PublisherState, ServiceDescription, SubscriberState,
};
use crate::port::{PublisherData, SubscriberData};
use crate::relative_ptr::{RelPtr, SegmentId, SegmentRegistry};
use crate::sync::ConditionVariableData;

use super::segment_manager::{SegmentInfo, SegmentManager};

/// How long the broker lets in-flight sends drain before it reclaims
/// structures a sender might still touch. The wait only runs its full
/// course when the counted sender died mid-send; the broker then proceeds,
/// it never hangs on a dead peer.
const SEND_QUIESCE_TIMEOUT: Duration = Duration::from_millis(100);

/// What a registered process gets back from the handshake
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub condition: RelPtr<ConditionVariableData>,
    pub segments: Vec<SegmentInfo>,
}

struct ProcessEntry {
    pid: u32,
    access_group: String,
    condition: RelPtr<ConditionVariableData>,
    last_keep_alive: Instant,
}

struct PublisherEntry {
    record: RelPtr<PublisherData>,
    owner: String,
}

struct SubscriberEntry {
    record: RelPtr<SubscriberData>,
    owner: String,
}

/// The broker's registry of processes and ports
pub struct PortGraph {
    segments: SegmentManager,
    keep_alive_threshold: Duration,
    max_processes: usize,
    processes: HashMap<String, ProcessEntry>,
    publishers: Vec<PublisherEntry>,
    subscribers: Vec<SubscriberEntry>,
    discovery_runs: u64,
}

impl PortGraph {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        Ok(Self {
            segments: SegmentManager::new(config)?,
            keep_alive_threshold: Duration::from_millis(config.keep_alive_threshold_ms),
            max_processes: config.max_processes,
            processes: HashMap::new(),
            publishers: Vec::new(),
            subscribers: Vec::new(),
            discovery_runs: 0,
        })
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        self.segments.registry()
    }

    // ---- process lifecycle -------------------------------------------------

    /// Register a client process; a re-registration of a crashed instance
    /// tears the old one down first
    pub fn register_process(
        &mut self,
        app_name: &str,
        pid: u32,
        access_group: &str,
    ) -> Result<ProcessInfo> {
        if self.processes.contains_key(app_name) {
            log::warn!(
                "process '{}' re-registered, cleaning up its previous instance",
                app_name
            );
            self.unregister_process(app_name)?;
        }
        if self.processes.len() >= self.max_processes {
            return Err(VermeerError::pool_exhausted("process registry"));
        }

        let condition = self.segments.port_pool().alloc_condition()?;
        self.processes.insert(
            app_name.to_string(),
            ProcessEntry {
                pid,
                access_group: access_group.to_string(),
                condition,
                last_keep_alive: Instant::now(),
            },
        );
        log::debug!("registered process '{}' (pid {})", app_name, pid);

        Ok(ProcessInfo {
            condition,
            segments: self.segments.inventory().to_vec(),
        })
    }

    /// Refresh a process's liveness epoch
    pub fn keep_alive(&mut self, app_name: &str) -> Result<()> {
        let entry = self
            .processes
            .get_mut(app_name)
            .ok_or(VermeerError::UnknownHandle)?;
        entry.last_keep_alive = Instant::now();
        Ok(())
    }

    /// Remove a process and everything it owns
    pub fn unregister_process(&mut self, app_name: &str) -> Result<()> {
        let entry = self
            .processes
            .remove(app_name)
            .ok_or(VermeerError::UnknownHandle)?;

        let owned_publishers: Vec<_> = self
            .publishers
            .iter()
            .filter(|p| p.owner == app_name)
            .map(|p| p.record)
            .collect();
        for record in owned_publishers {
            self.remove_publisher_record(record);
        }
        let owned_subscribers: Vec<_> = self
            .subscribers
            .iter()
            .filter(|s| s.owner == app_name)
            .map(|s| s.record)
            .collect();
        for record in owned_subscribers {
            self.remove_subscriber_record(record);
        }

        self.segments.port_pool().free_condition(entry.condition)?;
        log::debug!("unregistered process '{}' (pid {})", app_name, entry.pid);
        Ok(())
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Segment a registered process loans chunks from
    pub fn data_segment_for(&self, app_name: &str) -> Result<SegmentId> {
        let entry = self
            .processes
            .get(app_name)
            .ok_or(VermeerError::UnknownHandle)?;
        let pool = self
            .segments
            .pool_for_group(&entry.access_group)
            .unwrap_or_else(|| self.segments.default_pool());
        Ok(pool.segment_id())
    }

    // ---- port creation and removal ----------------------------------------

    /// Create a publisher port for a registered process
    pub fn create_publisher(
        &mut self,
        app_name: &str,
        service_description: ServiceDescription,
        qos: PortQos,
    ) -> Result<RelPtr<PublisherData>> {
        if !self.processes.contains_key(app_name) {
            return Err(VermeerError::UnknownHandle);
        }
        let descriptor =
            PortDescriptor::new(service_description, PortRole::Publisher, qos, app_name);
        let record = self.segments.port_pool().alloc_publisher(descriptor)?;
        self.publishers.push(PublisherEntry {
            record,
            owner: app_name.to_string(),
        });
        log::debug!(
            "created publisher {} for '{}'",
            service_description,
            app_name
        );

        // An immediately-offered publisher adopts everyone already waiting
        if self.publisher(record).is_offered() {
            self.connect_waiting_subscribers(record);
        }
        Ok(record)
    }

    /// Create a subscriber port for a registered process
    pub fn create_subscriber(
        &mut self,
        app_name: &str,
        service_description: ServiceDescription,
        qos: PortQos,
    ) -> Result<RelPtr<SubscriberData>> {
        if !self.processes.contains_key(app_name) {
            return Err(VermeerError::UnknownHandle);
        }
        let descriptor =
            PortDescriptor::new(service_description, PortRole::Subscriber, qos, app_name);
        let record = self.segments.port_pool().alloc_subscriber(descriptor)?;
        self.subscribers.push(SubscriberEntry {
            record,
            owner: app_name.to_string(),
        });
        log::debug!(
            "created subscriber {} for '{}'",
            service_description,
            app_name
        );

        self.try_connect_subscriber(record);
        Ok(record)
    }

    /// Remove a publisher port previously handed out
    pub fn remove_publisher(&mut self, record: RelPtr<PublisherData>) -> Result<()> {
        if !self.publishers.iter().any(|p| p.record == record) {
            return Err(VermeerError::UnknownHandle);
        }
        self.remove_publisher_record(record);
        Ok(())
    }

    /// Remove a subscriber port previously handed out
    pub fn remove_subscriber(&mut self, record: RelPtr<SubscriberData>) -> Result<()> {
        if !self.subscribers.iter().any(|s| s.record == record) {
            return Err(VermeerError::UnknownHandle);
        }
        self.remove_subscriber_record(record);
        Ok(())
    }

    fn publisher(&self, record: RelPtr<PublisherData>) -> &PublisherData {
        unsafe { &*record.resolve(self.registry()) }
    }

    fn subscriber(&self, record: RelPtr<SubscriberData>) -> &SubscriberData {
        unsafe { &*record.resolve(self.registry()) }
    }

    fn remove_publisher_record(&mut self, record: RelPtr<PublisherData>) {
        let registry = Arc::clone(self.registry());
        {
            let publisher = self.publisher(record);
            // Shut the send path, let in-flight sends drain (bounded; the
            // owner may have died mid-send), then reclaim.
            publisher.revoke();
            if !publisher.await_send_quiescence(SEND_QUIESCE_TIMEOUT) {
                log::warn!(
                    "publisher {} still marked in-flight at removal; owner presumed dead",
                    publisher.descriptor.service_description
                );
            }
            publisher.disconnect_all();
            publisher.release_history(&registry);
        }
        self.publishers.retain(|p| p.record != record);

        // Strand nobody: drop subscribers back to waiting when their last
        // matching offer vanished
        let service = self.publisher_service(record);
        for index in 0..self.subscribers.len() {
            let subscriber_record = self.subscribers[index].record;
            let subscriber = self.subscriber(subscriber_record);
            if subscriber.descriptor.service_description == service
                && subscriber.state() == SubscriberState::Subscribed
                && !self.has_matching_offer(&subscriber.descriptor)
            {
                subscriber.set_state(SubscriberState::WaitForOffer);
            }
        }

        if let Err(error) = self.segments.port_pool().free_publisher(record) {
            log::warn!("publisher record release failed: {}", error);
        }
    }

    fn publisher_service(&self, record: RelPtr<PublisherData>) -> ServiceDescription {
        self.publisher(record).descriptor.service_description
    }

    fn remove_subscriber_record(&mut self, record: RelPtr<SubscriberData>) {
        let registry = Arc::clone(self.registry());
        let queue = {
            let subscriber = self.subscriber(record);
            subscriber.queue_ref(record)
        };
        // Disconnect from every publisher first so nothing new starts, then
        // let in-flight sends drain before the queue's memory is reclaimed.
        // The wait is bounded; a publisher whose owner died mid-send is
        // skipped after the timeout.
        for publisher_entry in &self.publishers {
            self.publisher(publisher_entry.record)
                .disconnect_subscriber(queue);
        }
        for publisher_entry in &self.publishers {
            let publisher = self.publisher(publisher_entry.record);
            if !publisher.await_send_quiescence(SEND_QUIESCE_TIMEOUT) {
                log::warn!(
                    "publisher {} still marked in-flight while removing a subscriber",
                    publisher.descriptor.service_description
                );
            }
        }
        let drained = self.subscriber(record).drain(&registry);
        if drained > 0 {
            // Deliveries the consumer never took; absorbed, not an error
            self.subscriber(record).count_liveness_drops(drained as u64);
            log::debug!("released {} queued chunks on subscriber removal", drained);
        }
        self.subscribers.retain(|s| s.record != record);
        if let Err(error) = self.segments.port_pool().free_subscriber(record) {
            log::warn!("subscriber record release failed: {}", error);
        }
    }

    // ---- matching ----------------------------------------------------------

    fn qos_compatible(subscriber: &PortDescriptor, publisher: &PortDescriptor) -> bool {
        subscriber.qos.requested_history <= publisher.qos.history_capacity
    }

    /// Whether any offered publisher matches the subscriber's descriptor
    fn has_matching_offer(&self, subscriber: &PortDescriptor) -> bool {
        self.publishers.iter().any(|entry| {
            let publisher = self.publisher(entry.record);
            publisher.is_offered()
                && publisher.descriptor.service_description == subscriber.service_description
                && Self::qos_compatible(subscriber, &publisher.descriptor)
        })
    }

    /// Connect a subscriber to every matching offered publisher
    fn try_connect_subscriber(&mut self, record: RelPtr<SubscriberData>) {
        let registry = Arc::clone(self.registry());
        let (descriptor, queue) = {
            let subscriber = self.subscriber(record);
            (subscriber.descriptor, subscriber.queue_ref(record))
        };

        let mut connected = false;
        for entry in &self.publishers {
            let publisher = self.publisher(entry.record);
            if !publisher.is_offered()
                || publisher.descriptor.service_description != descriptor.service_description
            {
                continue;
            }
            if !Self::qos_compatible(&descriptor, &publisher.descriptor) {
                log::debug!(
                    "subscriber {} rejected: requested history {} exceeds offered {}",
                    descriptor.service_description,
                    descriptor.qos.requested_history,
                    publisher.descriptor.qos.history_capacity
                );
                continue;
            }
            match publisher.connect_subscriber(
                &registry,
                queue,
                descriptor.qos.requested_history,
                SEND_QUIESCE_TIMEOUT,
            ) {
                Ok(()) => connected = true,
                Err(error) => {
                    log::warn!(
                        "connect of {} failed: {}",
                        descriptor.service_description,
                        error
                    );
                }
            }
        }

        let subscriber = self.subscriber(record);
        subscriber.set_state(if connected {
            SubscriberState::Subscribed
        } else {
            SubscriberState::WaitForOffer
        });
    }

    /// Connect every waiting subscriber that matches this publisher
    fn connect_waiting_subscribers(&mut self, record: RelPtr<PublisherData>) {
        let registry = Arc::clone(self.registry());
        let publisher_descriptor = self.publisher(record).descriptor;

        for index in 0..self.subscribers.len() {
            let subscriber_record = self.subscribers[index].record;
            let subscriber = self.subscriber(subscriber_record);
            let state = subscriber.state();
            if state != SubscriberState::WaitForOffer && state != SubscriberState::SubscribeRequested
            {
                continue;
            }
            let descriptor = subscriber.descriptor;
            if descriptor.service_description != publisher_descriptor.service_description {
                continue;
            }
            if !Self::qos_compatible(&descriptor, &publisher_descriptor) {
                continue;
            }
            let queue = subscriber.queue_ref(subscriber_record);
            match self.publisher(record).connect_subscriber(
                &registry,
                queue,
                descriptor.qos.requested_history,
                SEND_QUIESCE_TIMEOUT,
            ) {
                Ok(()) => subscriber.set_state(SubscriberState::Subscribed),
                Err(error) => log::warn!(
                    "connect of waiting subscriber {} failed: {}",
                    descriptor.service_description,
                    error
                ),
            }
        }
    }

    // ---- discovery ---------------------------------------------------------

    /// Advance pending state machines and collect dead processes.
    ///
    /// Cleanup of a crashed process completes within
    /// `keep_alive_threshold + discovery_interval` of its last epoch refresh.
    pub fn discovery_tick(&mut self) {
        self.discovery_runs += 1;
        self.process_state_changes();

        let stale: Vec<String> = self
            .processes
            .iter()
            .filter(|(_, entry)| entry.last_keep_alive.elapsed() > self.keep_alive_threshold)
            .map(|(name, _)| name.clone())
            .collect();
        for app_name in stale {
            log::warn!(
                "process '{}' missed its keep-alive window, reclaiming its ports",
                app_name
            );
            let _ = self.unregister_process(&app_name);
        }
    }

    /// Acknowledge pending offer/subscribe requests
    pub fn process_state_changes(&mut self) {
        let publisher_records: Vec<_> = self.publishers.iter().map(|p| p.record).collect();
        for record in publisher_records {
            match self.publisher(record).state() {
                PublisherState::OfferRequested => {
                    self.publisher(record).acknowledge_offer();
                    self.connect_waiting_subscribers(record);
                }
                PublisherState::StopOfferRequested => {
                    self.withdraw_publisher(record);
                }
                _ => {}
            }
        }

        let subscriber_records: Vec<_> = self.subscribers.iter().map(|s| s.record).collect();
        for record in subscriber_records {
            match self.subscriber(record).state() {
                SubscriberState::SubscribeRequested => {
                    self.try_connect_subscriber(record);
                }
                SubscriberState::UnsubscribeRequested => {
                    self.complete_unsubscribe(record);
                }
                _ => {}
            }
        }
    }

    /// Stop-offer: disconnect everyone, flip stranded subscribers to waiting
    fn withdraw_publisher(&mut self, record: RelPtr<PublisherData>) {
        self.publisher(record).disconnect_all();
        self.publisher(record).acknowledge_stop_offer();

        let service = self.publisher_service(record);
        for index in 0..self.subscribers.len() {
            let subscriber_record = self.subscribers[index].record;
            let subscriber = self.subscriber(subscriber_record);
            if subscriber.descriptor.service_description == service
                && subscriber.state() == SubscriberState::Subscribed
                && !self.has_matching_offer(&subscriber.descriptor)
            {
                subscriber.set_state(SubscriberState::WaitForOffer);
            }
        }
    }

    fn complete_unsubscribe(&mut self, record: RelPtr<SubscriberData>) {
        let registry = Arc::clone(self.registry());
        let queue = self.subscriber(record).queue_ref(record);
        for entry in &self.publishers {
            self.publisher(entry.record).disconnect_subscriber(queue);
        }
        self.subscriber(record).drain(&registry);
        self.subscriber(record)
            .set_state(SubscriberState::NotSubscribed);
    }

    // ---- introspection -----------------------------------------------------

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn discovery_runs(&self) -> u64 {
        self.discovery_runs
    }

    /// Whether any offered publisher serves this service description
    pub fn has_offer(&self, service_description: &ServiceDescription) -> bool {
        self.publishers.iter().any(|entry| {
            let publisher = self.publisher(entry.record);
            publisher.is_offered()
                && publisher.descriptor.service_description == *service_description
        })
    }
}
