//! Error types and handling for Vermeer

/// Result type alias for Vermeer operations
pub type Result<T> = std::result::Result<T, VermeerError>;

/// Error taxonomy for the Vermeer transport
///
/// Capacity and protocol conditions are returned to the caller; liveness
/// conditions are absorbed and counted in port statistics; invariant
/// violations do not appear here at all, they route through [`fatal`].
#[derive(Debug, thiserror::Error)]
pub enum VermeerError {
    /// I/O related errors (file operations, mmap, sockets)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Memory allocation or mapping failures
    #[error("Memory error: {message}")]
    Memory { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Segment not found or not registered
    #[error("Segment not found: {name}")]
    SegmentNotFound { name: String },

    /// Segment already exists
    #[error("Segment already exists: {name}")]
    SegmentExists { name: String },

    /// No pool block large enough is free; the chosen size class is exhausted
    #[error("Out of chunks: no free block for payload of {payload_size} bytes")]
    OutOfChunks { payload_size: usize },

    /// No pool serves the requested payload size at all
    #[error("Chunk too large: payload of {payload_size} bytes exceeds the largest pool block")]
    ChunkTooLarge { payload_size: usize },

    /// A bounded queue rejected a push (REJECT_NEW policy)
    #[error("Queue full: {queue}")]
    QueueFull { queue: String },

    /// A publisher's subscriber slot table is exhausted
    #[error("Too many consumers: publisher connection list is full")]
    TooManyConsumers,

    /// A fixed-capacity broker pool (ports, condition variables, processes) is exhausted
    #[error("Pool exhausted: {pool}")]
    PoolExhausted { pool: String },

    /// Operation not permitted in the port's current state
    #[error("Invalid port state: {operation} requires {required}")]
    InvalidState {
        operation: &'static str,
        required: &'static str,
    },

    /// A control-channel message failed validation
    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    /// A handle presented over the control channel is unknown to the broker
    #[error("Unknown handle")]
    UnknownHandle,

    /// The broker rejected a request with an error code
    #[error("Request rejected by broker: {code:?}")]
    Rejected { code: crate::broker::control::ErrorCode },

    /// Platform-specific errors (syscalls, sockets)
    #[error("Platform error: {message}")]
    Platform { message: String },

    /// Timed out waiting for a reply or a notification
    #[error("Timed out: {operation}")]
    Timeout { operation: &'static str },
}

impl VermeerError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a segment not found error
    pub fn segment_not_found(name: impl Into<String>) -> Self {
        Self::SegmentNotFound { name: name.into() }
    }

    /// Create a segment exists error
    pub fn segment_exists(name: impl Into<String>) -> Self {
        Self::SegmentExists { name: name.into() }
    }

    /// Create a queue full error
    pub fn queue_full(queue: impl Into<String>) -> Self {
        Self::QueueFull {
            queue: queue.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(pool: impl Into<String>) -> Self {
        Self::PoolExhausted { pool: pool.into() }
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for VermeerError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

/// The single hook for invariant violations.
///
/// A relative pointer resolving through an unregistered segment, a free of a
/// block that does not belong to the claimed pool, or a reference-count
/// underflow all signify memory corruption; recovery is not meaningful.
pub fn fatal(context: &str) -> ! {
    log::error!("fatal invariant violation: {}", context);
    std::process::abort();
}
