//! Fixed-layout control-channel messages
//!
//! Every request and reply is one fixed-size record: a validated header with
//! the message kind, then plain fields. Strings are capped with a truncation
//! flag; nothing on the encode or decode path touches the heap.

use crate::config::MAX_HANDSHAKE_SEGMENTS;
use crate::error::{Result, VermeerError};
use crate::port::descriptor::{FixedString, IdString, PortQos};
use crate::queue::OverflowPolicy;
use crate::relative_ptr::SegmentId;

/// Magic number leading every control message
pub const CONTROL_MAGIC: u32 = 0x564D4350; // "VMCP"

/// Capacity of the path strings in segment records
pub const MAX_PATH_LENGTH: usize = 128;

/// Message kinds; the first byte after the magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RegApp = 1,
    RegAppAck = 2,
    CreatePub = 3,
    CreatePubAck = 4,
    CreateSub = 5,
    CreateSubAck = 6,
    RemovePort = 7,
    RemovePortAck = 8,
    KeepAlive = 9,
    UnregApp = 10,
    DiscoveryTick = 11,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::RegApp),
            2 => Some(Self::RegAppAck),
            3 => Some(Self::CreatePub),
            4 => Some(Self::CreatePubAck),
            5 => Some(Self::CreateSub),
            6 => Some(Self::CreateSubAck),
            7 => Some(Self::RemovePort),
            8 => Some(Self::RemovePortAck),
            9 => Some(Self::KeepAlive),
            10 => Some(Self::UnregApp),
            11 => Some(Self::DiscoveryTick),
            _ => None,
        }
    }
}

/// Error codes carried in reply messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    MalformedRequest = 1,
    UnknownProcess = 2,
    UnknownHandle = 3,
    PoolExhausted = 4,
    TooManyProcesses = 5,
    InternalFailure = 6,
}

impl ErrorCode {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::MalformedRequest,
            2 => Self::UnknownProcess,
            3 => Self::UnknownHandle,
            4 => Self::PoolExhausted,
            5 => Self::TooManyProcesses,
            6 => Self::InternalFailure,
            _ => Self::None,
        }
    }

    pub fn from_error(error: &VermeerError) -> Self {
        match error {
            VermeerError::UnknownHandle => Self::UnknownHandle,
            VermeerError::PoolExhausted { pool } if pool.contains("process") => {
                Self::TooManyProcesses
            }
            VermeerError::PoolExhausted { .. } => Self::PoolExhausted,
            VermeerError::TooManyConsumers => Self::PoolExhausted,
            VermeerError::MalformedMessage { .. } => Self::MalformedRequest,
            _ => Self::InternalFailure,
        }
    }
}

/// Validated header leading every message; the kind is the first byte
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ControlHeader {
    pub kind: u8,
    _pad: [u8; 3],
    pub magic: u32,
}

impl ControlHeader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind: kind as u8,
            _pad: [0; 3],
            magic: CONTROL_MAGIC,
        }
    }

    pub fn validate(&self, expected: MessageKind) -> Result<()> {
        if self.magic != CONTROL_MAGIC {
            return Err(VermeerError::malformed("Bad control message magic"));
        }
        if self.kind != expected as u8 {
            return Err(VermeerError::malformed("Unexpected control message kind"));
        }
        Ok(())
    }
}

/// QoS as plain wire fields; enums stay out of the wire format
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct QosRecord {
    pub history_capacity: u64,
    pub requested_history: u64,
    pub queue_capacity: u64,
    pub overflow_policy: u32,
    pub offer_on_create: u32,
}

impl QosRecord {
    pub fn from_qos(qos: &PortQos) -> Self {
        Self {
            history_capacity: qos.history_capacity,
            requested_history: qos.requested_history,
            queue_capacity: qos.queue_capacity,
            overflow_policy: qos.overflow_policy as u32,
            offer_on_create: qos.offer_on_create,
        }
    }

    pub fn to_qos(self) -> PortQos {
        PortQos {
            history_capacity: self.history_capacity,
            requested_history: self.requested_history,
            queue_capacity: self.queue_capacity,
            overflow_policy: if self.overflow_policy == OverflowPolicy::RejectNew as u32 {
                OverflowPolicy::RejectNew
            } else {
                OverflowPolicy::DiscardOldest
            },
            offer_on_create: self.offer_on_create,
        }
    }
}

/// One advertised segment in the registration reply
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SegmentRecord {
    pub id: u64,
    pub size: u64,
    pub name: IdString,
    pub path: FixedString<MAX_PATH_LENGTH>,
}

impl SegmentRecord {
    pub const EMPTY: Self = Self {
        id: 0,
        size: 0,
        name: IdString::EMPTY,
        path: FixedString::EMPTY,
    };
}

/// `REG_APP`: announce an application to the broker
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegApp {
    pub header: ControlHeader,
    pub app_name: IdString,
    pub pid: u32,
    _pad: u32,
    pub access_group: IdString,
}

impl RegApp {
    pub fn new(app_name: &str, pid: u32, access_group: &str) -> Self {
        Self {
            header: ControlHeader::new(MessageKind::RegApp),
            app_name: IdString::new(app_name),
            pid,
            _pad: 0,
            access_group: IdString::new(access_group),
        }
    }
}

/// `REG_APP_ACK`: segment inventory plus the process's condition variable
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegAppAck {
    pub header: ControlHeader,
    pub error: u32,
    pub segment_count: u32,
    _pad: u32,
    pub condition_segment: u64,
    pub condition_offset: u64,
    pub segments: [SegmentRecord; MAX_HANDSHAKE_SEGMENTS],
}

impl RegAppAck {
    pub fn success(
        condition_segment: u64,
        condition_offset: u64,
        segment_count: u32,
        segments: [SegmentRecord; MAX_HANDSHAKE_SEGMENTS],
    ) -> Self {
        Self {
            header: ControlHeader::new(MessageKind::RegAppAck),
            error: ErrorCode::None as u32,
            segment_count,
            _pad: 0,
            condition_segment,
            condition_offset,
            segments,
        }
    }

    pub fn failure(error: ErrorCode) -> Self {
        Self {
            header: ControlHeader::new(MessageKind::RegAppAck),
            error: error as u32,
            segment_count: 0,
            _pad: 0,
            condition_segment: 0,
            condition_offset: 0,
            segments: [SegmentRecord::EMPTY; MAX_HANDSHAKE_SEGMENTS],
        }
    }
}

/// `CREATE_PUB` / `CREATE_SUB`: request a port
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreatePort {
    pub header: ControlHeader,
    pub app_name: IdString,
    pub service: IdString,
    pub instance: IdString,
    pub event: IdString,
    pub qos: QosRecord,
}

impl CreatePort {
    pub fn new(
        kind: MessageKind,
        app_name: &str,
        service: &str,
        instance: &str,
        event: &str,
        qos: &PortQos,
    ) -> Self {
        Self {
            header: ControlHeader::new(kind),
            app_name: IdString::new(app_name),
            service: IdString::new(service),
            instance: IdString::new(instance),
            event: IdString::new(event),
            qos: QosRecord::from_qos(qos),
        }
    }
}

/// `CREATE_PUB_ACK` / `CREATE_SUB_ACK`: the port handle or an error code
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CreatePortAck {
    pub header: ControlHeader,
    pub error: u32,
    _pad: u32,
    /// Location of the port record in the management segment
    pub port_segment: u64,
    pub port_offset: u64,
    /// Data segment the owner loans chunks from (publishers only)
    pub data_segment: u64,
    pub unique_id: u128,
}

impl CreatePortAck {
    pub fn failure(kind: MessageKind, error: ErrorCode) -> Self {
        Self {
            header: ControlHeader::new(kind),
            error: error as u32,
            _pad: 0,
            port_segment: 0,
            port_offset: 0,
            data_segment: 0,
            unique_id: 0,
        }
    }

    pub fn success(
        kind: MessageKind,
        port_segment: SegmentId,
        port_offset: u64,
        data_segment: SegmentId,
        unique_id: u128,
    ) -> Self {
        Self {
            header: ControlHeader::new(kind),
            error: ErrorCode::None as u32,
            _pad: 0,
            port_segment,
            port_offset,
            data_segment,
            unique_id,
        }
    }
}

/// `REMOVE_PORT`: release a port handle
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RemovePort {
    pub header: ControlHeader,
    pub app_name: IdString,
    /// 0 = publisher, 1 = subscriber
    pub role: u32,
    _pad: u32,
    pub port_segment: u64,
    pub port_offset: u64,
}

impl RemovePort {
    pub fn new(app_name: &str, role: u32, port_segment: SegmentId, port_offset: u64) -> Self {
        Self {
            header: ControlHeader::new(MessageKind::RemovePort),
            app_name: IdString::new(app_name),
            role,
            _pad: 0,
            port_segment,
            port_offset,
        }
    }
}

/// `REMOVE_PORT_ACK`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RemovePortAck {
    pub header: ControlHeader,
    pub error: u32,
}

impl RemovePortAck {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            header: ControlHeader::new(MessageKind::RemovePortAck),
            error: error as u32,
        }
    }
}

/// `KEEP_ALIVE` and `UNREG_APP` share the shape: just the app name
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AppMessage {
    pub header: ControlHeader,
    pub app_name: IdString,
}

impl AppMessage {
    pub fn new(kind: MessageKind, app_name: &str) -> Self {
        Self {
            header: ControlHeader::new(kind),
            app_name: IdString::new(app_name),
        }
    }
}

/// `DISCOVERY_TICK`: broker-internal, posted by the interval timer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryTick {
    pub header: ControlHeader,
}

impl DiscoveryTick {
    pub fn new() -> Self {
        Self {
            header: ControlHeader::new(MessageKind::DiscoveryTick),
        }
    }
}

impl Default for DiscoveryTick {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialise a message into `buf`; returns the encoded length
pub fn encode<T: Copy>(message: &T, buf: &mut [u8]) -> Result<usize> {
    let size = std::mem::size_of::<T>();
    if buf.len() < size {
        return Err(VermeerError::malformed("Encode buffer too small"));
    }
    unsafe {
        std::ptr::copy_nonoverlapping(message as *const T as *const u8, buf.as_mut_ptr(), size);
    }
    Ok(size)
}

/// Deserialise a message of the expected kind
pub fn decode<T: Copy>(buf: &[u8], expected: MessageKind) -> Result<T> {
    let size = std::mem::size_of::<T>();
    if buf.len() < size {
        return Err(VermeerError::malformed(format!(
            "Control message too short: {} of {} bytes",
            buf.len(),
            size
        )));
    }
    let message = unsafe { (buf.as_ptr() as *const T).read_unaligned() };
    // Every wire struct leads with a ControlHeader
    let header = unsafe { (buf.as_ptr() as *const ControlHeader).read_unaligned() };
    header.validate(expected)?;
    Ok(message)
}

/// The kind of a raw datagram, if it carries a valid header
pub fn peek_kind(buf: &[u8]) -> Option<MessageKind> {
    if buf.len() < std::mem::size_of::<ControlHeader>() {
        return None;
    }
    let header = unsafe { (buf.as_ptr() as *const ControlHeader).read_unaligned() };
    if header.magic != CONTROL_MAGIC {
        return None;
    }
    MessageKind::from_u8(header.kind)
}

/// Largest message the channel has to carry
pub const MAX_CONTROL_MESSAGE_SIZE: usize = std::mem::size_of::<RegAppAck>();

/// Capped copy of a filesystem path for the wire
pub fn path_string(path: &std::path::Path) -> FixedString<MAX_PATH_LENGTH> {
    FixedString::new(&path.to_string_lossy())
}
