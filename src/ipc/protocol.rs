//! Wire protocol definitions
//!
//! Every message is a [`FrameHeader`] followed by `len` payload bytes. Each
//! opcode has exactly one argument record and one result record; all
//! records are `#[repr(C)]` plain-old-data with explicit padding so they
//! can be read and written with `bytemuck` on either side of the socket.

use bytemuck::{Pod, Zeroable};

use crate::error::IpcError;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest request payload accepted by the server
pub const MAX_PAYLOAD: usize = 64 * 1024;
/// Layers per submitted frame
pub const MAX_LAYERS: usize = 16;
/// Images per swapchain
pub const MAX_SWAPCHAIN_IMAGES: usize = 8;
/// Fixed size of the application name field
pub const CLIENT_NAME_LEN: usize = 64;
/// Largest swapchain width or height
pub const MAX_SWAPCHAIN_DIMENSION: u32 = 16384;

/// Size of [`FrameHeader`] on the wire
pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Discriminates what a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Request = 1,
    Response = 2,
    Event = 3,
    Handshake = 4,
}

impl FrameKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            3 => Some(FrameKind::Event),
            4 => Some(FrameKind::Handshake),
            _ => None,
        }
    }
}

/// Header preceding every frame
///
/// `code` is the opcode for requests, the result code for responses and
/// handshakes, and the event kind for events. `seq` is echoed from a
/// request into its response.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameHeader {
    pub kind: u32,
    pub code: i32,
    pub len: u32,
    pub seq: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, code: i32, len: usize, seq: u32) -> Self {
        Self {
            kind: kind as u32,
            code,
            len: len as u32,
            seq,
        }
    }

    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_raw(self.kind)
    }
}

/// Operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    SetClientInfo = 1,
    SessionBegin = 2,
    SessionEnd = 3,
    PollEvents = 4,
    WaitForEvent = 5,
    PredictFrame = 10,
    WaitWoke = 11,
    BeginFrame = 12,
    DiscardFrame = 13,
    SubmitFrame = 14,
    CreateSwapchain = 20,
    DestroySwapchain = 21,
    AcquireImage = 22,
    WaitImage = 23,
    ReleaseImage = 24,
    GetClients = 30,
    GetClientInfo = 31,
    SetActiveClient = 32,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use Opcode::*;
        Some(match raw {
            1 => SetClientInfo,
            2 => SessionBegin,
            3 => SessionEnd,
            4 => PollEvents,
            5 => WaitForEvent,
            10 => PredictFrame,
            11 => WaitWoke,
            12 => BeginFrame,
            13 => DiscardFrame,
            14 => SubmitFrame,
            20 => CreateSwapchain,
            21 => DestroySwapchain,
            22 => AcquireImage,
            23 => WaitImage,
            24 => ReleaseImage,
            30 => GetClients,
            31 => GetClientInfo,
            32 => SetActiveClient,
            _ => return None,
        })
    }
}

// ============================================================================
// Flags
// ============================================================================

bitflags::bitflags! {
    /// Intended use of swapchain images
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SwapchainUsage: u32 {
        const COLOR = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SAMPLED = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Per-layer composition flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LayerFlags: u32 {
        const PREMULTIPLIED_ALPHA = 1 << 0;
        const UNPREMULTIPLIED_ALPHA = 1 << 1;
        /// Y-axis is inverted (origin at bottom-left)
        const FLIP_Y = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Client state reported by `GetClientInfo`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientFlags: u32 {
        const SESSION_ACTIVE = 1 << 0;
        const VISIBLE = 1 << 1;
        const FOCUSED = 1 << 2;
        /// The session is the active one
        const PRIMARY = 1 << 3;
    }
}

/// Layer composition kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LayerKind {
    Projection = 1,
    Quad = 2,
}

impl LayerKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(LayerKind::Projection),
            2 => Some(LayerKind::Quad),
            _ => None,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// First frame on every connection
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HandshakeRecord {
    pub result: i32,
    pub session_id: u32,
    pub protocol_version: u32,
    pub max_swapchains: u32,
    pub shm_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClientInfoArgs {
    pub pid: u32,
    pub name: [u8; CLIENT_NAME_LEN],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WaitForEventArgs {
    pub timeout_ms: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CountResult {
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FramePrediction {
    pub frame_id: i64,
    pub wake_up_ns: u64,
    pub display_ns: u64,
    pub period_ns: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameIdArgs {
    pub frame_id: i64,
}

/// Fixed part of `SubmitFrame`; `layer_count` [`Layer`] records follow
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitFrameArgs {
    pub frame_id: i64,
    pub layer_count: u32,
    pub _pad: u32,
}

/// One composition layer referencing a swapchain image
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Layer {
    pub swapchain_index: u32,
    pub image_index: u32,
    pub kind: u32,
    pub flags: u32,
    /// x, y, width, height in output-normalised coordinates
    pub rect: [f32; 4],
}

impl Layer {
    pub fn quad(swapchain_index: u32, image_index: u32) -> Self {
        Self {
            swapchain_index,
            image_index,
            kind: LayerKind::Quad as u32,
            flags: 0,
            rect: [0.0, 0.0, 1.0, 1.0],
        }
    }

    pub fn layer_flags(&self) -> LayerFlags {
        LayerFlags::from_bits_truncate(self.flags)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmitFrameResult {
    pub sequence: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateSwapchainArgs {
    pub format: u64,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub usage: u32,
}

/// Image file descriptors travel alongside this record
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CreateSwapchainResult {
    pub index: u32,
    pub image_count: u32,
    pub image_size: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SwapchainArgs {
    pub index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageArgs {
    pub index: u32,
    pub image_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WaitImageArgs {
    pub index: u32,
    pub image_index: u32,
    pub timeout_ns: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageResult {
    pub image_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SessionArgs {
    pub session_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ClientInfoResult {
    pub pid: u32,
    pub flags: u32,
    pub name: [u8; CLIENT_NAME_LEN],
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventKind {
    StateChange = 1,
    DeviceChanged = 2,
    RefreshRateChanged = 3,
    SessionLossPending = 4,
}

/// Asynchronous notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    StateChange { visible: bool, focused: bool },
    DeviceChanged { device_index: u32, connected: bool },
    /// Rates in millihertz
    RefreshRateChanged { from_mhz: u32, to_mhz: u32 },
    SessionLossPending,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StateChange { .. } => EventKind::StateChange,
            Event::DeviceChanged { .. } => EventKind::DeviceChanged,
            Event::RefreshRateChanged { .. } => EventKind::RefreshRateChanged,
            Event::SessionLossPending => EventKind::SessionLossPending,
        }
    }
}

/// An event tagged with its queue sequence number and timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub event: Event,
}

/// Payload of an event frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct EventRecord {
    pub timestamp_ns: u64,
    pub sequence: u64,
    pub a: u32,
    pub b: u32,
}

impl QueuedEvent {
    /// Split into the frame code and the kind-specific record
    pub fn to_record(&self) -> (EventKind, EventRecord) {
        let (a, b) = match self.event {
            Event::StateChange { visible, focused } => (visible as u32, focused as u32),
            Event::DeviceChanged {
                device_index,
                connected,
            } => (device_index, connected as u32),
            Event::RefreshRateChanged { from_mhz, to_mhz } => (from_mhz, to_mhz),
            Event::SessionLossPending => (0, 0),
        };
        (
            self.event.kind(),
            EventRecord {
                timestamp_ns: self.timestamp_ns,
                sequence: self.sequence,
                a,
                b,
            },
        )
    }

    pub fn from_record(kind: i32, record: &EventRecord) -> Option<Self> {
        let event = match kind {
            1 => Event::StateChange {
                visible: record.a != 0,
                focused: record.b != 0,
            },
            2 => Event::DeviceChanged {
                device_index: record.a,
                connected: record.b != 0,
            },
            3 => Event::RefreshRateChanged {
                from_mhz: record.a,
                to_mhz: record.b,
            },
            4 => Event::SessionLossPending,
            _ => return None,
        };
        Some(Self {
            sequence: record.sequence,
            timestamp_ns: record.timestamp_ns,
            event,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Decode a payload that must be exactly one `T`
pub fn decode<T: Pod>(payload: &[u8]) -> Result<T, IpcError> {
    bytemuck::try_pod_read_unaligned(payload).map_err(|_| {
        IpcError::MalformedFrame(format!(
            "expected {} payload bytes, got {}",
            std::mem::size_of::<T>(),
            payload.len()
        ))
    })
}

/// Decode a leading `T` and return the remaining bytes
pub fn decode_prefix<T: Pod>(payload: &[u8]) -> Result<(T, &[u8]), IpcError> {
    let size = std::mem::size_of::<T>();
    if payload.len() < size {
        return Err(IpcError::MalformedFrame(format!(
            "expected at least {} payload bytes, got {}",
            size,
            payload.len()
        )));
    }
    let (head, tail) = payload.split_at(size);
    Ok((decode(head)?, tail))
}

/// Decode exactly `count` consecutive `T` records
pub fn decode_array<T: Pod>(payload: &[u8], count: usize) -> Result<Vec<T>, IpcError> {
    let size = std::mem::size_of::<T>();
    if payload.len() != size * count {
        return Err(IpcError::MalformedFrame(format!(
            "expected {} records of {} bytes, got {} bytes",
            count,
            size,
            payload.len()
        )));
    }
    payload.chunks_exact(size).map(decode).collect()
}

/// Pack a name into the fixed-size, NUL-padded wire field
pub fn encode_name(name: &str) -> [u8; CLIENT_NAME_LEN] {
    let mut out = [0u8; CLIENT_NAME_LEN];
    let mut len = name.len().min(CLIENT_NAME_LEN - 1);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

pub fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
