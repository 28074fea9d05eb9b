//! Shared-memory segment
//!
//! The server allocates one memfd at startup, sized to [`ShmLayout`], and
//! hands its descriptor to every client in the connection handshake.
//! Mutation goes through writer tokens that only the server can obtain:
//! one per session render ring (claimed by that session), plus one each for
//! the global view, the device table and the timing snapshot. Readers on
//! either side use [`ShmReader`], which only exposes copies.

pub mod layout;

use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, addr_of, addr_of_mut, NonNull};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use memmap2::{Mmap, MmapMut};
use rustix::fs::{MemfdFlags, SealFlags};

use crate::config::MAX_SESSIONS;
use crate::ipc::protocol::{Layer, MAX_LAYERS};
use layout::{
    seq_read, seq_write_begin, seq_write_end, RenderRing, ShmHeader, ShmLayout, SHM_MAGIC,
    SHM_VERSION,
};

pub use layout::{
    ActivePair, DeviceRecord, DeviceTableRecord, RenderSlot, TimingRecord, MAX_DEVICES,
    RENDER_SLOTS, SHM_SIZE,
};

/// The server's mapping of the segment
pub struct SharedMemory {
    file: File,
    _map: MmapMut,
    layout: NonNull<ShmLayout>,
    claimed_rings: AtomicU64,
}

// The mapping lives as long as `_map`; all shared fields are atomics or
// guarded by sequence counters, and writers are unique tokens.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

/// Writer tokens for the server-global areas
pub struct ShmWriters {
    pub global: GlobalWriter,
    pub devices: DeviceWriter,
    pub timing: TimingWriter,
}

impl SharedMemory {
    /// Allocate and initialise the segment
    pub fn create(session_capacity: usize) -> io::Result<(Arc<Self>, ShmWriters)> {
        let fd = rustix::fs::memfd_create(
            "tessera-shm",
            MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
        )?;
        let file = File::from(fd);
        file.set_len(SHM_SIZE as u64)?;
        // Clients must not be able to resize the segment under the server.
        rustix::fs::fcntl_add_seals(
            &file,
            SealFlags::SHRINK | SealFlags::GROW | SealFlags::SEAL,
        )?;

        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let layout = NonNull::new(map.as_mut_ptr() as *mut ShmLayout)
            .ok_or_else(|| io::Error::other("null shared memory mapping"))?;

        let header = ShmHeader {
            magic: SHM_MAGIC,
            version: SHM_VERSION,
            size: SHM_SIZE as u64,
            session_capacity: session_capacity as u32,
            slot_count: RENDER_SLOTS as u32,
            device_capacity: MAX_DEVICES as u32,
            _pad: 0,
        };
        unsafe {
            let base = layout.as_ptr();
            ptr::write_volatile(addr_of_mut!((*base).header), header);
            (*base)
                .global
                .active
                .store(ActivePair::NONE.pack(), Ordering::Release);
        }

        debug!(
            "Allocated shared memory segment: {} bytes, {} sessions",
            SHM_SIZE, session_capacity
        );

        let shm = Arc::new(Self {
            file,
            _map: map,
            layout,
            claimed_rings: AtomicU64::new(0),
        });
        let writers = ShmWriters {
            global: GlobalWriter { shm: shm.clone() },
            devices: DeviceWriter { shm: shm.clone() },
            timing: TimingWriter { shm: shm.clone() },
        };
        Ok((shm, writers))
    }

    /// Descriptor clients map
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn size(&self) -> usize {
        SHM_SIZE
    }

    pub fn reader(&self) -> ShmReader<'_> {
        ShmReader {
            layout: self.layout.as_ptr(),
            _marker: PhantomData,
        }
    }

    /// Take the unique writer for ring `index`; `None` if out of range or
    /// already held
    pub fn claim_ring(self: &Arc<Self>, index: usize) -> Option<RingWriter> {
        if index >= MAX_SESSIONS {
            return None;
        }
        let bit = 1u64 << index;
        let prev = self.claimed_rings.fetch_or(bit, Ordering::AcqRel);
        if prev & bit != 0 {
            return None;
        }
        let writer = RingWriter {
            shm: self.clone(),
            index,
        };
        writer.reset();
        Some(writer)
    }

    fn ring_ptr(&self, index: usize) -> *mut RenderRing {
        unsafe { addr_of_mut!((*self.layout.as_ptr()).rings[index]) }
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Unique writer of one session's render ring
pub struct RingWriter {
    shm: Arc<SharedMemory>,
    index: usize,
}

impl RingWriter {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of frames published into this ring
    pub fn published(&self) -> u64 {
        let ring = self.shm.ring_ptr(self.index);
        unsafe { (*ring).published.load(Ordering::Acquire) }
    }

    /// Forget every frame in the ring; a new occupant starts empty
    fn reset(&self) {
        let ring = self.shm.ring_ptr(self.index);
        unsafe {
            (*ring).published.store(0, Ordering::Release);
            for slot in 0..RENDER_SLOTS {
                ptr::write_volatile(
                    addr_of_mut!((*ring).slots[slot]),
                    bytemuck::Zeroable::zeroed(),
                );
            }
        }
    }

    /// Write a frame into the next slot, then make it visible
    ///
    /// Returns the new publish counter. Layers beyond [`MAX_LAYERS`] are
    /// rejected by the caller before this point and truncated here.
    pub fn publish(
        &mut self,
        frame_id: i64,
        display_ns: u64,
        session_id: u32,
        layers: &[Layer],
    ) -> u64 {
        let ring = self.shm.ring_ptr(self.index);
        let published = unsafe { (*ring).published.load(Ordering::Relaxed) };
        let sequence = published + 1;

        let mut slot: RenderSlot = bytemuck::Zeroable::zeroed();
        let count = layers.len().min(MAX_LAYERS);
        slot.frame_id = frame_id;
        slot.sequence = sequence;
        slot.display_ns = display_ns;
        slot.session_id = session_id;
        slot.layer_count = count as u32;
        slot.layers[..count].copy_from_slice(&layers[..count]);

        let target = (published as usize) % RENDER_SLOTS;
        unsafe {
            ptr::write_volatile(addr_of_mut!((*ring).slots[target]), slot);
            fence(Ordering::Release);
            (*ring).published.store(sequence, Ordering::Release);
        }
        sequence
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        let bit = 1u64 << self.index;
        self.shm.claimed_rings.fetch_and(!bit, Ordering::AcqRel);
    }
}

/// Writer of the active-session view
pub struct GlobalWriter {
    shm: Arc<SharedMemory>,
}

impl GlobalWriter {
    pub fn write(&mut self, pair: ActivePair, activation_mark: u64) {
        let global = unsafe { &(*self.shm.layout.as_ptr()).global };
        let start = seq_write_begin(&global.seq);
        global.active.store(pair.pack(), Ordering::Relaxed);
        global
            .activation_mark
            .store(activation_mark, Ordering::Relaxed);
        seq_write_end(&global.seq, start);
    }

    pub fn reader(&self) -> ShmReader<'_> {
        self.shm.reader()
    }
}

/// Writer of the device table
pub struct DeviceWriter {
    shm: Arc<SharedMemory>,
}

impl DeviceWriter {
    pub fn write(&mut self, table: &DeviceTableRecord) {
        let base = self.shm.layout.as_ptr();
        unsafe {
            let seq = &(*base).devices.seq;
            let start = seq_write_begin(seq);
            ptr::write_volatile(addr_of_mut!((*base).devices.table), *table);
            seq_write_end(seq, start);
        }
    }
}

/// Writer of the display timing snapshot
pub struct TimingWriter {
    shm: Arc<SharedMemory>,
}

impl TimingWriter {
    pub fn write(&mut self, record: TimingRecord) {
        let base = self.shm.layout.as_ptr();
        unsafe {
            let seq = &(*base).timing.seq;
            let start = seq_write_begin(seq);
            ptr::write_volatile(addr_of_mut!((*base).timing.record), record);
            seq_write_end(seq, start);
        }
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Read-only access to a mapped segment
#[derive(Clone, Copy)]
pub struct ShmReader<'a> {
    layout: *const ShmLayout,
    _marker: PhantomData<&'a ShmLayout>,
}

impl<'a> ShmReader<'a> {
    pub fn header(&self) -> ShmHeader {
        unsafe { ptr::read_volatile(addr_of!((*self.layout).header)) }
    }

    pub fn timing(&self) -> TimingRecord {
        let seq = unsafe { &(*self.layout).timing.seq };
        seq_read(seq, || unsafe {
            ptr::read_volatile(addr_of!((*self.layout).timing.record))
        })
    }

    pub fn devices(&self) -> DeviceTableRecord {
        let seq = unsafe { &(*self.layout).devices.seq };
        seq_read(seq, || unsafe {
            ptr::read_volatile(addr_of!((*self.layout).devices.table))
        })
    }

    /// Sample the active pair; always one consistent value
    pub fn active(&self) -> ActivePair {
        let global = unsafe { &(*self.layout).global };
        ActivePair::unpack(global.active.load(Ordering::Acquire))
    }

    /// Active pair together with the activation mark
    pub fn global(&self) -> (ActivePair, u64) {
        let global = unsafe { &(*self.layout).global };
        seq_read(&global.seq, || {
            (
                ActivePair::unpack(global.active.load(Ordering::Relaxed)),
                global.activation_mark.load(Ordering::Relaxed),
            )
        })
    }

    pub fn published(&self, ring: usize) -> u64 {
        if ring >= MAX_SESSIONS {
            return 0;
        }
        unsafe { (*self.layout).rings[ring].published.load(Ordering::Acquire) }
    }

    /// Copy of the most recently published slot of `ring`
    ///
    /// Retries if the writer lapped the slot while it was being copied, so
    /// the result is never a mix of two frames.
    pub fn latest_slot(&self, ring: usize) -> Option<RenderSlot> {
        if ring >= MAX_SESSIONS {
            return None;
        }
        let ring_ptr = unsafe { addr_of!((*self.layout).rings[ring]) };
        loop {
            let published = unsafe { (*ring_ptr).published.load(Ordering::Acquire) };
            if published == 0 {
                return None;
            }
            let index = ((published - 1) as usize) % RENDER_SLOTS;
            let slot = unsafe { ptr::read_volatile(addr_of!((*ring_ptr).slots[index])) };
            fence(Ordering::Acquire);
            let after = unsafe { (*ring_ptr).published.load(Ordering::Relaxed) };
            // The slot is rewritten only once the counter reaches
            // published + RENDER_SLOTS - 1.
            if after < published + RENDER_SLOTS as u64 - 1 && slot.sequence == published {
                return Some(slot);
            }
            std::hint::spin_loop();
        }
    }

    /// Session whose frames are composited right now
    ///
    /// A newly active session takes over only after it has published a
    /// frame since activation; until then the previous one stays on screen.
    pub fn composited_session(&self) -> Option<u32> {
        let (pair, mark) = self.global();
        match pair.current {
            Some(current) if self.published(current as usize) > mark => Some(current),
            Some(current) => pair.previous.or(Some(current)),
            None => None,
        }
    }
}

/// A client's read-only mapping of the segment
pub struct ShmView {
    map: Mmap,
}

impl ShmView {
    /// Map the descriptor received in the handshake and validate it
    pub fn map(fd: OwnedFd, size: usize) -> io::Result<Self> {
        if size < SHM_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared memory too small: {} < {}", size, SHM_SIZE),
            ));
        }
        let file = File::from(fd);
        let map = unsafe { memmap2::MmapOptions::new().len(SHM_SIZE).map(&file)? };
        let view = Self { map };
        let header = view.reader().header();
        if header.magic != SHM_MAGIC || header.version != SHM_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected shared memory header: magic {:#x} version {}",
                    header.magic, header.version
                ),
            ));
        }
        Ok(view)
    }

    pub fn reader(&self) -> ShmReader<'_> {
        ShmReader {
            layout: self.map.as_ptr() as *const ShmLayout,
            _marker: PhantomData,
        }
    }
}
