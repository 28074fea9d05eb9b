//! Session arena
//!
//! A fixed set of session records addressed by index. Occupancy is one
//! atomic bitmap, so claiming a slot never allocates and never takes a lock.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::MAX_SESSIONS;
use crate::ipc::channel::ChannelCloser;
use crate::session::SessionShared;

/// Lifecycle of the thread behind a session slot
///
/// Transitions only move forward; `Stopping` is terminal until the slot is
/// recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadState {
    Ready = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Ready,
            1 => ThreadState::Starting,
            2 => ThreadState::Running,
            _ => ThreadState::Stopping,
        }
    }
}

#[derive(Default)]
struct SlotParts {
    shared: Option<Arc<SessionShared>>,
    closer: Option<ChannelCloser>,
    thread: Option<JoinHandle<()>>,
}

struct SessionSlot {
    state: AtomicU8,
    parts: Mutex<SlotParts>,
}

pub struct SessionArena {
    slots: Vec<SessionSlot>,
    occupancy: AtomicU64,
}

impl SessionArena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_SESSIONS);
        Self {
            slots: (0..capacity)
                .map(|_| SessionSlot {
                    state: AtomicU8::new(ThreadState::Ready as u8),
                    parts: Mutex::new(SlotParts::default()),
                })
                .collect(),
            occupancy: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Take the lowest free slot
    pub fn claim(&self) -> Option<u32> {
        let mut current = self.occupancy.load(Ordering::Acquire);
        loop {
            let index = (!current).trailing_zeros() as usize;
            if index >= self.slots.len() {
                return None;
            }
            let bit = 1u64 << index;
            match self.occupancy.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.slots[index]
                        .state
                        .store(ThreadState::Ready as u8, Ordering::Release);
                    return Some(index as u32);
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_occupied(&self, id: u32) -> bool {
        id < 64 && self.occupancy.load(Ordering::Acquire) & (1u64 << id) != 0
    }

    pub fn count(&self) -> usize {
        self.occupancy.load(Ordering::Acquire).count_ones() as usize
    }

    pub fn occupied_ids(&self) -> Vec<u32> {
        let bits = self.occupancy.load(Ordering::Acquire);
        (0..self.slots.len() as u32)
            .filter(|id| bits & (1u64 << id) != 0)
            .collect()
    }

    pub fn state(&self, id: u32) -> Option<ThreadState> {
        self.slots
            .get(id as usize)
            .map(|slot| ThreadState::from_raw(slot.state.load(Ordering::Acquire)))
    }

    /// Move slot `id` forward to `to`; returns false if it is already there
    /// or further along
    pub fn advance(&self, id: u32, to: ThreadState) -> bool {
        let Some(slot) = self.slots.get(id as usize) else {
            return false;
        };
        slot.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (to as u8 > raw).then_some(to as u8)
            })
            .is_ok()
    }

    pub fn install(&self, id: u32, shared: Arc<SessionShared>, closer: ChannelCloser) {
        if let Some(mut parts) = self.parts(id) {
            parts.shared = Some(shared);
            parts.closer = Some(closer);
        }
    }

    pub fn set_thread(&self, id: u32, thread: JoinHandle<()>) {
        if let Some(mut parts) = self.parts(id) {
            parts.thread = Some(thread);
        }
    }

    pub fn take_thread(&self, id: u32) -> Option<JoinHandle<()>> {
        self.parts(id)?.thread.take()
    }

    /// Shared state of an occupied slot
    pub fn shared(&self, id: u32) -> Option<Arc<SessionShared>> {
        if !self.is_occupied(id) {
            return None;
        }
        self.parts(id)?.shared.clone()
    }

    /// Ask the session in slot `id` to stop and unblock its read
    pub fn signal_stop(&self, id: u32) {
        if let Some(parts) = self.parts(id) {
            if let Some(shared) = &parts.shared {
                shared.request_stop();
            }
            if let Some(closer) = &parts.closer {
                closer.close();
            }
        }
    }

    /// Release slot `id` once its thread has exited
    pub fn recycle(&self, id: u32) {
        if let Some(mut parts) = self.parts(id) {
            *parts = SlotParts::default();
        }
        if let Some(slot) = self.slots.get(id as usize) {
            slot.state
                .store(ThreadState::Ready as u8, Ordering::Release);
            self.occupancy.fetch_and(!(1u64 << id), Ordering::AcqRel);
        }
    }

    fn parts(&self, id: u32) -> Option<MutexGuard<'_, SlotParts>> {
        self.slots
            .get(id as usize)
            .map(|slot| slot.parts.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
