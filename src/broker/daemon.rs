//! The broker: dispatch loop over the control channel

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::port::descriptor::{PortQos, ServiceDescription};
use crate::port::{PublisherData, SubscriberData};
use crate::relative_ptr::RelPtr;
use crate::sync::IntervalTimer;

use super::channel::ControlChannel;
use super::control::{
    self, AppMessage, CreatePort, CreatePortAck, DiscoveryTick, ErrorCode, MessageKind, RegApp,
    RegAppAck, RemovePort, RemovePortAck, SegmentRecord, MAX_CONTROL_MESSAGE_SIZE,
};
use super::port_graph::PortGraph;
use super::segment_manager::MANAGEMENT_SEGMENT_ID;

/// The central broker process state.
///
/// Owns the segments, the port graph and the request socket. Everything that
/// mutates the registry runs on the thread calling [`Broker::run`] (or
/// [`Broker::run_once`]); the discovery timer only posts a tick message to
/// the broker's own socket.
pub struct Broker {
    config: BrokerConfig,
    graph: PortGraph,
    channel: ControlChannel,
    _discovery_timer: Option<IntervalTimer>,
}

impl Broker {
    /// Create segments, bind the well-known socket and arm the discovery
    /// timer
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let graph = PortGraph::new(&config)?;
        let channel = ControlChannel::bind(&config.broker_socket())?;
        log::info!(
            "broker listening on {} ({} segments)",
            channel.path().display(),
            graph.segments().inventory().len()
        );

        let tick_target = config.broker_socket();
        let timer = IntervalTimer::start(
            Duration::from_millis(config.discovery_interval_ms),
            move || {
                let tick = DiscoveryTick::new();
                let mut buf = [0u8; std::mem::size_of::<DiscoveryTick>()];
                if control::encode(&tick, &mut buf).is_ok() {
                    let _ = ControlChannel::post(&tick_target, &buf);
                }
            },
        )?;

        Ok(Self {
            config,
            graph,
            channel,
            _discovery_timer: Some(timer),
        })
    }

    /// Create a broker without the background timer; discovery is driven by
    /// explicit [`Broker::run_once`]/tick calls. Used by tests.
    pub fn new_without_timer(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let graph = PortGraph::new(&config)?;
        let channel = ControlChannel::bind(&config.broker_socket())?;
        Ok(Self {
            config,
            graph,
            channel,
            _discovery_timer: None,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn graph(&self) -> &PortGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut PortGraph {
        &mut self.graph
    }

    /// Serve requests until `shutdown` is raised
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        let poll_interval = Duration::from_millis(self.config.discovery_interval_ms.max(10));
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(error) = self.run_once(poll_interval) {
                log::warn!("dispatch failure: {}", error);
            }
        }
        log::info!("broker shutting down");
    }

    /// Poll for one request and dispatch it; returns whether one was served
    pub fn run_once(&mut self, timeout: Duration) -> Result<bool> {
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        match self.channel.recv_timeout(&mut buf, timeout)? {
            None => Ok(false),
            Some(len) => {
                self.dispatch(&buf[..len]);
                Ok(true)
            }
        }
    }

    fn client_socket(&self, app_name: &str) -> PathBuf {
        self.config.client_socket(app_name)
    }

    fn reply<T: Copy>(&self, app_name: &str, message: &T) {
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        match control::encode(message, &mut buf) {
            Ok(len) => {
                let target = self.client_socket(app_name);
                if let Err(error) = self.channel.send_to(&target, &buf[..len]) {
                    log::warn!("reply to '{}' failed: {}", app_name, error);
                }
            }
            Err(error) => log::warn!("encode of reply failed: {}", error),
        }
    }

    fn dispatch(&mut self, datagram: &[u8]) {
        match control::peek_kind(datagram) {
            Some(MessageKind::RegApp) => self.handle_reg_app(datagram),
            Some(MessageKind::CreatePub) => self.handle_create_port(datagram, MessageKind::CreatePub),
            Some(MessageKind::CreateSub) => self.handle_create_port(datagram, MessageKind::CreateSub),
            Some(MessageKind::RemovePort) => self.handle_remove_port(datagram),
            Some(MessageKind::KeepAlive) => self.handle_keep_alive(datagram),
            Some(MessageKind::UnregApp) => self.handle_unreg_app(datagram),
            Some(MessageKind::DiscoveryTick) => self.graph.discovery_tick(),
            Some(other) => log::warn!("unexpected message kind {:?} on request socket", other),
            None => log::warn!("dropping malformed control datagram ({} bytes)", datagram.len()),
        }
    }

    fn handle_reg_app(&mut self, datagram: &[u8]) {
        let request: RegApp = match control::decode(datagram, MessageKind::RegApp) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("malformed REG_APP: {}", error);
                return;
            }
        };
        let app_name = request.app_name.as_str().to_string();

        let ack = match self.graph.register_process(
            &app_name,
            request.pid,
            request.access_group.as_str(),
        ) {
            Ok(info) => {
                let mut segments = [SegmentRecord::EMPTY; crate::config::MAX_HANDSHAKE_SEGMENTS];
                for (slot, segment) in segments.iter_mut().zip(info.segments.iter()) {
                    *slot = SegmentRecord {
                        id: segment.id,
                        size: segment.size as u64,
                        name: crate::port::IdString::new(&segment.name),
                        path: control::path_string(&segment.path),
                    };
                }
                RegAppAck::success(
                    info.condition.segment_id(),
                    info.condition.offset(),
                    info.segments.len() as u32,
                    segments,
                )
            }
            Err(error) => {
                log::warn!("registration of '{}' failed: {}", app_name, error);
                RegAppAck::failure(ErrorCode::from_error(&error))
            }
        };
        self.reply(&app_name, &ack);
    }

    fn handle_create_port(&mut self, datagram: &[u8], kind: MessageKind) {
        let ack_kind = if kind == MessageKind::CreatePub {
            MessageKind::CreatePubAck
        } else {
            MessageKind::CreateSubAck
        };
        let request: CreatePort = match control::decode(datagram, kind) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("malformed create request: {}", error);
                return;
            }
        };
        let app_name = request.app_name.as_str().to_string();
        let service_description = ServiceDescription::new(
            request.service.as_str(),
            request.instance.as_str(),
            request.event.as_str(),
        );
        let qos: PortQos = request.qos.to_qos();

        let ack = if kind == MessageKind::CreatePub {
            match self
                .graph
                .create_publisher(&app_name, service_description, qos)
                .and_then(|record| {
                    let data_segment = self.graph.data_segment_for(&app_name)?;
                    Ok((record, data_segment))
                }) {
                Ok((record, data_segment)) => {
                    let unique_id = unsafe { &*record.resolve(self.graph.registry()) }
                        .descriptor
                        .unique_id;
                    CreatePortAck::success(
                        ack_kind,
                        record.segment_id(),
                        record.offset(),
                        data_segment,
                        unique_id,
                    )
                }
                Err(error) => {
                    log::warn!("publisher creation for '{}' failed: {}", app_name, error);
                    CreatePortAck::failure(ack_kind, ErrorCode::from_error(&error))
                }
            }
        } else {
            match self
                .graph
                .create_subscriber(&app_name, service_description, qos)
            {
                Ok(record) => {
                    let unique_id = unsafe { &*record.resolve(self.graph.registry()) }
                        .descriptor
                        .unique_id;
                    CreatePortAck::success(ack_kind, record.segment_id(), record.offset(), 0, unique_id)
                }
                Err(error) => {
                    log::warn!("subscriber creation for '{}' failed: {}", app_name, error);
                    CreatePortAck::failure(ack_kind, ErrorCode::from_error(&error))
                }
            }
        };
        self.reply(&app_name, &ack);
    }

    fn handle_remove_port(&mut self, datagram: &[u8]) {
        let request: RemovePort = match control::decode(datagram, MessageKind::RemovePort) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("malformed REMOVE_PORT: {}", error);
                return;
            }
        };
        let app_name = request.app_name.as_str().to_string();

        if request.port_segment != MANAGEMENT_SEGMENT_ID {
            self.reply(&app_name, &RemovePortAck::new(ErrorCode::UnknownHandle));
            return;
        }
        let result = if request.role == 0 {
            self.graph
                .remove_publisher(RelPtr::<PublisherData>::new(
                    request.port_segment,
                    request.port_offset,
                ))
        } else {
            self.graph
                .remove_subscriber(RelPtr::<SubscriberData>::new(
                    request.port_segment,
                    request.port_offset,
                ))
        };
        let code = match result {
            Ok(()) => ErrorCode::None,
            Err(error) => {
                log::warn!("port removal for '{}' failed: {}", app_name, error);
                ErrorCode::from_error(&error)
            }
        };
        self.reply(&app_name, &RemovePortAck::new(code));
    }

    fn handle_keep_alive(&mut self, datagram: &[u8]) {
        if let Ok(message) = control::decode::<AppMessage>(datagram, MessageKind::KeepAlive) {
            if let Err(error) = self.graph.keep_alive(message.app_name.as_str()) {
                log::debug!(
                    "keep-alive from unknown process '{}': {}",
                    message.app_name.as_str(),
                    error
                );
            }
        }
    }

    fn handle_unreg_app(&mut self, datagram: &[u8]) {
        if let Ok(message) = control::decode::<AppMessage>(datagram, MessageKind::UnregApp) {
            let app_name = message.app_name.as_str();
            if let Err(error) = self.graph.unregister_process(app_name) {
                log::debug!("unregister of unknown process '{}': {}", app_name, error);
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("processes", &self.graph.process_count())
            .field("publishers", &self.graph.publisher_count())
            .field("subscribers", &self.graph.subscriber_count())
            .finish()
    }
}
