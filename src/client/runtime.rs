//! Client-side runtime: handshake, port creation and keep-alive

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::control::{
    self, AppMessage, CreatePort, CreatePortAck, ErrorCode, MessageKind, RegApp, RegAppAck,
    RemovePort, RemovePortAck, MAX_CONTROL_MESSAGE_SIZE,
};
use crate::broker::ControlChannel;
use crate::error::{Result, VermeerError};
use crate::memory::SharedMemoryRegion;
use crate::mempool::TieredPool;
use crate::port::descriptor::PortQos;
use crate::port::{PublisherPort, SubscriberPort};
use crate::relative_ptr::{RelPtr, SegmentRegistry};
use crate::sync::{ConditionListener, ConditionVariableData, IntervalTimer};

/// How long a client waits for a broker reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-process connection to the broker.
///
/// Registration performs the handshake: announce the application, receive
/// the segment inventory, map every segment read/write and register the
/// broker-assigned ids with the process-local registry. Afterwards ports are
/// created and removed through fixed-size request/reply messages.
pub struct Runtime {
    app_name: String,
    broker_socket: PathBuf,
    channel: ControlChannel,
    registry: Arc<SegmentRegistry>,
    /// Mappings kept alive for the runtime's lifetime
    _regions: Vec<SharedMemoryRegion>,
    condition: RelPtr<ConditionVariableData>,
    keep_alive_timer: Option<IntervalTimer>,
    unregister_on_drop: bool,
}

impl Runtime {
    /// Register with the broker listening under `runtime_dir`
    pub fn register(app_name: &str, runtime_dir: &Path, access_group: &str) -> Result<Self> {
        let broker_socket = runtime_dir.join("broker.sock");
        let client_socket = runtime_dir.join(format!("client_{}.sock", app_name));
        let channel = ControlChannel::bind(&client_socket)?;

        let request = RegApp::new(app_name, std::process::id(), access_group);
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        let len = control::encode(&request, &mut buf)?;
        channel.send_to(&broker_socket, &buf[..len])?;

        let len = channel
            .recv_timeout(&mut buf, REPLY_TIMEOUT)?
            .ok_or(VermeerError::Timeout {
                operation: "registration handshake",
            })?;
        let ack: RegAppAck = control::decode(&buf[..len], MessageKind::RegAppAck)?;
        let code = ErrorCode::from_u32(ack.error);
        if code != ErrorCode::None {
            return Err(VermeerError::Rejected { code });
        }

        let registry = Arc::new(SegmentRegistry::new());
        let mut regions = Vec::new();
        for record in ack.segments.iter().take(ack.segment_count as usize) {
            let region = SharedMemoryRegion::open(
                record.name.as_str(),
                PathBuf::from(record.path.as_str()),
                record.size as usize,
            )?;
            registry.register(record.id, region.base_ptr(), region.size())?;
            regions.push(region);
        }
        log::debug!(
            "'{}' registered, mapped {} segments",
            app_name,
            regions.len()
        );

        Ok(Self {
            app_name: app_name.to_string(),
            broker_socket,
            channel,
            registry,
            _regions: regions,
            condition: RelPtr::new(ack.condition_segment, ack.condition_offset),
            keep_alive_timer: None,
            unregister_on_drop: true,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn registry(&self) -> &Arc<SegmentRegistry> {
        &self.registry
    }

    /// The condition variable assigned to this process
    pub fn condition(&self) -> RelPtr<ConditionVariableData> {
        self.condition
    }

    /// A listener over this process's condition variable
    pub fn listener(&self) -> ConditionListener {
        ConditionListener::new(self.condition, Arc::clone(&self.registry))
    }

    fn request_reply<Req: Copy, Ack: Copy>(
        &self,
        request: &Req,
        ack_kind: MessageKind,
        operation: &'static str,
    ) -> Result<Ack> {
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        let len = control::encode(request, &mut buf)?;
        self.channel.send_to(&self.broker_socket, &buf[..len])?;
        let len = self
            .channel
            .recv_timeout(&mut buf, REPLY_TIMEOUT)?
            .ok_or(VermeerError::Timeout { operation })?;
        control::decode(&buf[..len], ack_kind)
    }

    /// Create an untyped publisher port
    pub fn create_publisher(
        &self,
        service: &str,
        instance: &str,
        event: &str,
        qos: PortQos,
    ) -> Result<PublisherPort> {
        let request = CreatePort::new(
            MessageKind::CreatePub,
            &self.app_name,
            service,
            instance,
            event,
            &qos,
        );
        let ack: CreatePortAck =
            self.request_reply(&request, MessageKind::CreatePubAck, "publisher creation")?;
        let code = ErrorCode::from_u32(ack.error);
        if code != ErrorCode::None {
            return Err(VermeerError::Rejected { code });
        }

        let pool = TieredPool::open(ack.data_segment, Arc::clone(&self.registry))?;
        Ok(PublisherPort::new(
            RelPtr::new(ack.port_segment, ack.port_offset),
            pool,
        ))
    }

    /// Create an untyped subscriber port
    pub fn create_subscriber(
        &self,
        service: &str,
        instance: &str,
        event: &str,
        qos: PortQos,
    ) -> Result<SubscriberPort> {
        let request = CreatePort::new(
            MessageKind::CreateSub,
            &self.app_name,
            service,
            instance,
            event,
            &qos,
        );
        let ack: CreatePortAck =
            self.request_reply(&request, MessageKind::CreateSubAck, "subscriber creation")?;
        let code = ErrorCode::from_u32(ack.error);
        if code != ErrorCode::None {
            return Err(VermeerError::Rejected { code });
        }

        Ok(SubscriberPort::new(
            RelPtr::new(ack.port_segment, ack.port_offset),
            Arc::clone(&self.registry),
        ))
    }

    /// Release a publisher port at the broker
    pub fn remove_publisher(&self, port: PublisherPort) -> Result<()> {
        let data = port.data_ref();
        self.remove_port(0, data.segment_id(), data.offset())
    }

    /// Release a subscriber port at the broker
    pub fn remove_subscriber(&self, port: SubscriberPort) -> Result<()> {
        let data = port.data_ref();
        self.remove_port(1, data.segment_id(), data.offset())
    }

    fn remove_port(&self, role: u32, segment: u64, offset: u64) -> Result<()> {
        let request = RemovePort::new(&self.app_name, role, segment, offset);
        let ack: RemovePortAck =
            self.request_reply(&request, MessageKind::RemovePortAck, "port removal")?;
        let code = ErrorCode::from_u32(ack.error);
        if code != ErrorCode::None {
            return Err(VermeerError::Rejected { code });
        }
        Ok(())
    }

    /// Refresh this process's liveness epoch once
    pub fn keep_alive(&self) -> Result<()> {
        let message = AppMessage::new(MessageKind::KeepAlive, &self.app_name);
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        let len = control::encode(&message, &mut buf)?;
        self.channel.send_to(&self.broker_socket, &buf[..len])
    }

    /// Refresh the liveness epoch from a background timer
    pub fn start_keep_alive(&mut self, interval: Duration) -> Result<()> {
        if self.keep_alive_timer.is_some() {
            return Ok(());
        }
        let message = AppMessage::new(MessageKind::KeepAlive, &self.app_name);
        let mut encoded = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        let len = control::encode(&message, &mut encoded)?;
        let payload: Vec<u8> = encoded[..len].to_vec();
        let target = self.broker_socket.clone();

        self.keep_alive_timer = Some(IntervalTimer::start(interval, move || {
            let _ = ControlChannel::post(&target, &payload);
        })?);
        Ok(())
    }

    /// Drop the connection without telling the broker; models a crash, the
    /// discovery tick has to reclaim everything
    pub fn simulate_crash(mut self) {
        self.unregister_on_drop = false;
        self.keep_alive_timer = None;
    }

    /// Gracefully unregister
    pub fn unregister(mut self) -> Result<()> {
        self.keep_alive_timer = None;
        self.unregister_on_drop = false;
        let message = AppMessage::new(MessageKind::UnregApp, &self.app_name);
        let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
        let len = control::encode(&message, &mut buf)?;
        self.channel.send_to(&self.broker_socket, &buf[..len])
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.unregister_on_drop {
            let message = AppMessage::new(MessageKind::UnregApp, &self.app_name);
            let mut buf = [0u8; MAX_CONTROL_MESSAGE_SIZE];
            if let Ok(len) = control::encode(&message, &mut buf) {
                let _ = self.channel.send_to(&self.broker_socket, &buf[..len]);
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("app_name", &self.app_name)
            .field("broker", &self.broker_socket)
            .finish()
    }
}
