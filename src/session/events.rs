//! Per-session event queue
//!
//! A fixed-capacity ring. Producers never block: when the ring is full the
//! oldest unread event is evicted, so events are best-effort notifications
//! and a slow consumer sees the most recent suffix of what was produced.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ipc::protocol::{Event, QueuedEvent};
use crate::timing::monotonic_ns;

/// What happened to a pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest unread event
    EvictedOldest,
    /// The queue was closed; the event was dropped
    Closed,
}

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Closed,
}

#[derive(Debug)]
struct EventRing {
    events: VecDeque<QueuedEvent>,
    capacity: usize,
    next_sequence: u64,
    evicted: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct EventQueue {
    ring: Mutex<EventRing>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(EventRing {
                events: VecDeque::with_capacity(capacity),
                capacity,
                next_sequence: 1,
                evicted: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventRing> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `event` stamped with the current monotonic time
    pub fn push(&self, event: Event) -> PushOutcome {
        self.push_at(event, monotonic_ns())
    }

    pub fn push_at(&self, event: Event, timestamp_ns: u64) -> PushOutcome {
        let mut ring = self.lock();
        if ring.closed {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if ring.events.len() == ring.capacity {
            ring.events.pop_front();
            ring.evicted += 1;
            outcome = PushOutcome::EvictedOldest;
        }

        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        ring.events.push_back(QueuedEvent {
            sequence,
            timestamp_ns,
            event,
        });
        drop(ring);

        self.ready.notify_all();
        outcome
    }

    /// Take every pending event, oldest first
    pub fn drain(&self) -> Vec<QueuedEvent> {
        self.lock().events.drain(..).collect()
    }

    /// Block until an event is pending, the queue closes or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut ring = self.lock();
        loop {
            if !ring.events.is_empty() {
                return WaitOutcome::Ready;
            }
            if ring.closed {
                return WaitOutcome::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            ring = self
                .ready
                .wait_timeout(ring, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Reject further events and wake any waiter
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost to overflow so far
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}
