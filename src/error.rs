//! Error taxonomy
//!
//! Startup failures are fatal for the process instance. Everything that
//! happens after a session is running is reported to that session's peer
//! only, as a [`ResultCode`] in the response frame.

use std::io;
use std::path::PathBuf;

/// Failures that abort `Server::start`; no partial server is left running.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to bind listening socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Socket activation failed: {0}")]
    SocketActivation(String),
    #[error("Shared memory allocation failed: {0}")]
    SharedMemory(#[source] io::Error),
    #[error("Compositor initialisation failed: {0}")]
    Compositor(#[from] CompositorError),
    #[error("Event loop failed: {0}")]
    EventLoop(String),
    #[error("Failed to spawn thread: {0}")]
    Thread(#[source] io::Error),
}

/// Errors reported by the compositor collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositorError {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Unsupported swapchain format {0:#x}")]
    UnsupportedFormat(u64),
    #[error("No image available")]
    NoImageAvailable,
    #[error("Image {0} is not in the expected state")]
    ImageState(u32),
    #[error("Timed out")]
    Timeout,
    #[error("Compositor failure: {0}")]
    Other(String),
}

/// Request-level errors, surfaced to the requesting peer only.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Compositor error: {0}")]
    Compositor(#[from] CompositorError),
    #[error("Timed out")]
    Timeout,
    #[error("Not found")]
    NotFound,
}

impl IpcError {
    /// Wire result code for this error
    pub fn code(&self) -> ResultCode {
        match self {
            IpcError::ResourceExhausted(_) => ResultCode::ResourceExhausted,
            IpcError::InvalidArgument(_) => ResultCode::InvalidArgument,
            IpcError::UnknownOpcode(_) => ResultCode::UnknownOpcode,
            IpcError::MalformedFrame(_) => ResultCode::MalformedFrame,
            IpcError::InvalidState(_) => ResultCode::InvalidState,
            IpcError::Compositor(CompositorError::Timeout) | IpcError::Timeout => {
                ResultCode::Timeout
            }
            IpcError::Compositor(_) => ResultCode::CompositorFailure,
            IpcError::NotFound => ResultCode::NotFound,
        }
    }
}

/// Result code carried in response and handshake frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    ResourceExhausted = -1,
    InvalidArgument = -2,
    UnknownOpcode = -3,
    MalformedFrame = -4,
    InvalidState = -5,
    CompositorFailure = -6,
    Timeout = -7,
    NotFound = -8,
}

impl ResultCode {
    /// Decode a raw wire value; unknown values are treated as compositor failures
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ResultCode::Success,
            -1 => ResultCode::ResourceExhausted,
            -2 => ResultCode::InvalidArgument,
            -3 => ResultCode::UnknownOpcode,
            -4 => ResultCode::MalformedFrame,
            -5 => ResultCode::InvalidState,
            -7 => ResultCode::Timeout,
            -8 => ResultCode::NotFound,
            _ => ResultCode::CompositorFailure,
        }
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

/// Transport-level failures on a message channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Peer closed the connection or the channel was shut down locally
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
    /// The byte stream can no longer be framed
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Map read errors that mean "the other side is gone" to `Disconnected`
    pub fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => ChannelError::Disconnected,
            _ => ChannelError::Io(err),
        }
    }
}
