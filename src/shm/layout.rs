//! Fixed layout of the shared-memory segment
//!
//! Both the server and every client map the same bytes, so everything here
//! is `#[repr(C)]` and sized at compile time. Fields shared between a single
//! writer and many readers are either atomics or plain data guarded by a
//! sequence counter.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::config::MAX_SESSIONS;
use crate::ipc::protocol::{Layer, MAX_LAYERS};

pub const SHM_MAGIC: u32 = 0x5453_5348;
pub const SHM_VERSION: u32 = 1;

/// Slots per render-state ring
pub const RENDER_SLOTS: usize = 3;
/// Capacity of the device table
pub const MAX_DEVICES: usize = 8;
pub const DEVICE_NAME_LEN: usize = 32;

/// Marker for "no session" in the packed active pair
pub const NO_SESSION: u32 = u32::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShmHeader {
    pub magic: u32,
    pub version: u32,
    pub size: u64,
    pub session_capacity: u32,
    pub slot_count: u32,
    pub device_capacity: u32,
    pub _pad: u32,
}

/// Display timing shared with clients
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TimingRecord {
    pub period_ns: u64,
    /// Monotonic time of a reference vsync
    pub epoch_ns: u64,
}

#[repr(C)]
pub struct TimingArea {
    pub seq: AtomicU64,
    pub record: TimingRecord,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceRecord {
    pub name: [u8; DEVICE_NAME_LEN],
    pub kind: u32,
    pub connected: u32,
    pub serial: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DeviceTableRecord {
    pub count: u32,
    pub _pad: u32,
    pub devices: [DeviceRecord; MAX_DEVICES],
}

#[repr(C)]
pub struct DeviceArea {
    pub seq: AtomicU64,
    pub table: DeviceTableRecord,
}

/// Which session is composited
///
/// `active` packs the current index in the high half and the previous one
/// in the low half, so a single load always yields a consistent pair.
/// `activation_mark` is the current session's publish counter at the time
/// it became active.
#[repr(C)]
pub struct GlobalArea {
    pub seq: AtomicU64,
    pub active: AtomicU64,
    pub activation_mark: AtomicU64,
}

/// One published frame of one session
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct RenderSlot {
    pub frame_id: i64,
    /// Publish counter value this slot was written for
    pub sequence: u64,
    pub display_ns: u64,
    pub layer_count: u32,
    pub session_id: u32,
    pub layers: [Layer; MAX_LAYERS],
}

impl RenderSlot {
    pub fn layers(&self) -> &[Layer] {
        let count = (self.layer_count as usize).min(MAX_LAYERS);
        &self.layers[..count]
    }
}

/// Per-session ring of render slots
///
/// `published` counts publishes; the visible slot is
/// `(published - 1) % RENDER_SLOTS` and zero means nothing published.
#[repr(C)]
pub struct RenderRing {
    pub published: AtomicU64,
    pub slots: [RenderSlot; RENDER_SLOTS],
}

#[repr(C)]
pub struct ShmLayout {
    pub header: ShmHeader,
    pub timing: TimingArea,
    pub devices: DeviceArea,
    pub global: GlobalArea,
    pub rings: [RenderRing; MAX_SESSIONS],
}

pub const SHM_SIZE: usize = std::mem::size_of::<ShmLayout>();

/// Consistent view of the active-session pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePair {
    pub current: Option<u32>,
    pub previous: Option<u32>,
}

impl ActivePair {
    pub const NONE: ActivePair = ActivePair {
        current: None,
        previous: None,
    };

    pub fn pack(&self) -> u64 {
        let current = self.current.unwrap_or(NO_SESSION) as u64;
        let previous = self.previous.unwrap_or(NO_SESSION) as u64;
        (current << 32) | previous
    }

    pub fn unpack(raw: u64) -> Self {
        let decode = |v: u32| (v != NO_SESSION).then_some(v);
        Self {
            current: decode((raw >> 32) as u32),
            previous: decode(raw as u32),
        }
    }
}

// ============================================================================
// Sequence counter helpers
// ============================================================================

/// Mark the guarded data as being written; `seq` becomes odd
pub(crate) fn seq_write_begin(seq: &AtomicU64) -> u64 {
    let start = seq.load(Ordering::Relaxed);
    seq.store(start.wrapping_add(1), Ordering::Relaxed);
    fence(Ordering::Release);
    start
}

/// Publish the guarded data; `seq` becomes even again
pub(crate) fn seq_write_end(seq: &AtomicU64, start: u64) {
    seq.store(start.wrapping_add(2), Ordering::Release);
}

/// Run `read` until it observes data no writer touched meanwhile
pub(crate) fn seq_read<T>(seq: &AtomicU64, mut read: impl FnMut() -> T) -> T {
    loop {
        let before = seq.load(Ordering::Acquire);
        if before & 1 == 1 {
            std::hint::spin_loop();
            continue;
        }
        let value = read();
        fence(Ordering::Acquire);
        if seq.load(Ordering::Relaxed) == before {
            return value;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_pair_packing() {
        for pair in [
            ActivePair::NONE,
            ActivePair {
                current: Some(0),
                previous: None,
            },
            ActivePair {
                current: Some(3),
                previous: Some(1),
            },
            ActivePair {
                current: None,
                previous: Some(63),
            },
        ] {
            assert_eq!(ActivePair::unpack(pair.pack()), pair);
        }
    }

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(std::mem::size_of::<ShmHeader>(), 32);
        assert_eq!(std::mem::size_of::<DeviceRecord>(), 48);
        assert_eq!(
            std::mem::size_of::<RenderSlot>(),
            32 + MAX_LAYERS * std::mem::size_of::<Layer>()
        );
        assert_eq!(SHM_SIZE % std::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn test_seq_counter() {
        let seq = AtomicU64::new(0);
        let start = seq_write_begin(&seq);
        assert_eq!(seq.load(Ordering::Relaxed) & 1, 1);
        seq_write_end(&seq, start);
        assert_eq!(seq.load(Ordering::Relaxed), 2);
        assert_eq!(seq_read(&seq, || 5), 5);
    }
}
