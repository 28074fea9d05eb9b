//! Client sessions
//!
//! Every accepted connection gets a [`Session`] driven by its own thread.
//! The thread owns the channel, the swapchain table, the render ring writer
//! and the timing helper; nothing else touches them. The parts other
//! threads need (event queue, client info, state flags, debug view) live in
//! [`SessionShared`].
//!
//! The dispatch loop is strictly request/response. Pending events are
//! flushed just before each response, so they never split a response from
//! its request.

mod dispatch;
pub mod events;
pub mod swapchain;

use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};

use crate::compositor::{CompositorClient, NativeImage, Swapchain, SwapchainInfo};
use crate::error::{ChannelError, IpcError, ResultCode};
use crate::ipc::channel::{Frame, MessageChannel};
use crate::ipc::protocol::{ClientFlags, CountResult, Event, FrameKind, Opcode, MAX_PAYLOAD};
use crate::server::{ServerCore, ThreadState};
use crate::shm::RingWriter;
use crate::timing::RenderTiming;

use dispatch::Reply;
pub use events::{EventQueue, PushOutcome, WaitOutcome};
pub use swapchain::{SwapchainData, SwapchainTable};

/// Application identity reported by `SetClientInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub pid: u32,
    pub name: String,
}

/// Swapchain images a session presented most recently
///
/// Holding this keeps the images alive, but the client keeps rendering
/// into them; contents are only meaningful until the next publish.
#[derive(Clone)]
pub struct DebugImages {
    pub swapchain_index: u32,
    pub info: SwapchainInfo,
    pub swapchain: Arc<dyn Swapchain>,
    pub image_index: u32,
    /// Render ring sequence of the frame that presented the image
    pub sequence: u64,
}

impl DebugImages {
    pub fn images(&self) -> &[NativeImage] {
        self.swapchain.images()
    }
}

impl fmt::Debug for DebugImages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugImages")
            .field("swapchain_index", &self.swapchain_index)
            .field("info", &self.info)
            .field("image_index", &self.image_index)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// The part of a session other threads can see
#[derive(Debug)]
pub struct SessionShared {
    id: u32,
    events: EventQueue,
    info: Mutex<ClientInfo>,
    flags: AtomicU32,
    stop: AtomicBool,
    debug: Mutex<Option<DebugImages>>,
}

impl SessionShared {
    pub fn new(id: u32, event_capacity: usize) -> Self {
        Self {
            id,
            events: EventQueue::new(event_capacity),
            info: Mutex::new(ClientInfo::default()),
            flags: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            debug: Mutex::new(None),
        }
    }

    /// Slot index, also the session id sent in the handshake
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pending events, drained by PollEvents and flushed ahead of every
    /// response
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Queue an event for the peer; never blocks
    pub fn post(&self, event: Event) -> PushOutcome {
        let outcome = self.events.push(event);
        if outcome == PushOutcome::EvictedOldest {
            trace!("session {}: event queue full, evicted oldest", self.id);
        }
        outcome
    }

    /// Snapshot of the flags reported by GetClientInfo
    pub fn flags(&self) -> ClientFlags {
        ClientFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn update_flags(&self, insert: ClientFlags, remove: ClientFlags) {
        // Single fetch_update so concurrent updates never lose bits.
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !remove.bits()) | insert.bits())
            });
    }

    /// Between `SessionBegin` and `SessionEnd`
    pub fn is_running(&self) -> bool {
        self.flags().contains(ClientFlags::SESSION_ACTIVE)
    }

    pub fn client_info(&self) -> ClientInfo {
        lock(&self.info).clone()
    }

    fn set_client_info(&self, info: ClientInfo) {
        *lock(&self.info) = info;
    }

    /// Ask the session thread to stop after its current request
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.events.close();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn debug_images(&self) -> Option<DebugImages> {
        lock(&self.debug).clone()
    }

    fn set_debug_images(&self, images: Option<DebugImages>) {
        *lock(&self.debug) = images;
    }

    /// Drop the debug view if it refers to swapchain `index`
    fn forget_debug_swapchain(&self, index: u32) {
        let mut debug = lock(&self.debug);
        if debug.as_ref().is_some_and(|d| d.swapchain_index == index) {
            *debug = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Server side of one connection
pub struct Session {
    id: u32,
    core: Arc<ServerCore>,
    shared: Arc<SessionShared>,
    client: Box<dyn CompositorClient>,
    channel: MessageChannel,
    swapchains: SwapchainTable,
    ring: RingWriter,
    timing: RenderTiming,
    /// `SessionBegin` seen without a matching `SessionEnd`
    running: bool,
}

impl Session {
    pub(crate) fn new(
        core: Arc<ServerCore>,
        shared: Arc<SessionShared>,
        client: Box<dyn CompositorClient>,
        channel: MessageChannel,
        ring: RingWriter,
    ) -> Self {
        let (period_ns, epoch_ns) = core.display_timing();
        Self {
            id: shared.id(),
            swapchains: SwapchainTable::new(core.config.max_swapchains),
            timing: RenderTiming::new(period_ns, epoch_ns),
            core,
            shared,
            client,
            channel,
            ring,
            running: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Serve requests until the peer leaves or a stop is requested
    pub fn run(mut self) {
        self.core.arena.advance(self.id, ThreadState::Running);
        debug!("session {}: dispatch loop running", self.id);

        while !self.shared.stop_requested() {
            let frame = match self.channel.read_frame() {
                Ok(frame) => frame,
                Err(_) if self.shared.stop_requested() => break,
                Err(ChannelError::Disconnected) => {
                    info!("session {}: peer disconnected", self.id);
                    break;
                }
                Err(e) => {
                    warn!("session {}: read failed: {}", self.id, e);
                    break;
                }
            };

            if let Err(e) = self.handle_frame(frame) {
                match e {
                    ChannelError::Disconnected => {
                        info!("session {}: peer disconnected", self.id)
                    }
                    e => warn!("session {}: write failed: {}", self.id, e),
                }
                break;
            }
        }

        self.core.arena.advance(self.id, ThreadState::Stopping);
        self.teardown();
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let seq = frame.header.seq;
        let result = self.decode_and_dispatch(&frame);
        let flushed = self.flush_events()?;

        let success = ResultCode::Success.raw();
        match result {
            Ok(Reply::Empty) => self.channel.write_frame(FrameKind::Response, success, seq, &[]),
            Ok(Reply::Record(body)) => {
                self.channel
                    .write_frame(FrameKind::Response, success, seq, &[&body])
            }
            Ok(Reply::EventCount) => self.channel.write_record(
                FrameKind::Response,
                success,
                seq,
                &CountResult { count: flushed },
            ),
            Ok(Reply::Images(body, swapchain)) => {
                let fds: Vec<BorrowedFd<'_>> =
                    swapchain.images().iter().map(|image| image.fd.as_fd()).collect();
                self.channel
                    .write_frame_with_fds(FrameKind::Response, success, seq, &[&body], &fds)
            }
            Err(e) => {
                debug!("session {}: request seq {} failed: {}", self.id, seq, e);
                self.channel
                    .write_frame(FrameKind::Response, e.code().raw(), seq, &[])
            }
        }
    }

    fn decode_and_dispatch(&mut self, frame: &Frame) -> Result<Reply, IpcError> {
        let header = &frame.header;
        if header.frame_kind() != Some(FrameKind::Request) {
            return Err(IpcError::MalformedFrame(format!(
                "unexpected frame kind {}",
                header.kind
            )));
        }
        if frame.oversized {
            return Err(IpcError::MalformedFrame(format!(
                "payload of {} bytes exceeds {}",
                header.len, MAX_PAYLOAD
            )));
        }
        let opcode =
            Opcode::from_raw(header.code as u32).ok_or(IpcError::UnknownOpcode(header.code as u32))?;
        trace!("session {}: {:?} seq {}", self.id, opcode, header.seq);
        self.dispatch(opcode, &frame.payload)
    }

    /// Write every pending event to the peer; returns how many were sent
    fn flush_events(&mut self) -> Result<u32, ChannelError> {
        let events = self.shared.events.drain();
        for event in &events {
            let (kind, record) = event.to_record();
            self.channel.write_record(
                FrameKind::Event,
                kind as i32,
                event.sequence as u32,
                &record,
            )?;
        }
        Ok(events.len() as u32)
    }

    fn teardown(&mut self) {
        if self.shared.stop_requested() {
            // The read side is shut down; a final notice may still get out.
            if let Err(e) = self.flush_events() {
                trace!("session {}: final event flush failed: {}", self.id, e);
            }
        }
        self.shared.events.close();

        if self.running {
            self.running = false;
            self.shared
                .update_flags(ClientFlags::empty(), ClientFlags::SESSION_ACTIVE);
            if let Err(e) = self.client.end_session() {
                warn!("session {}: end_session failed: {}", self.id, e);
            }
        }

        for index in self.swapchains.active_indices() {
            if let Err(e) = self.release_swapchain(index) {
                warn!("session {}: swapchain {} release failed: {}", self.id, index, e);
            }
        }
        self.shared.set_debug_images(None);
        self.core.on_session_stopped(self.id);
        info!("session {}: stopped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{format, Compositor, HeadlessCompositor};
    use crate::ipc::protocol::SwapchainUsage;

    #[test]
    fn test_flags_update() {
        let shared = SessionShared::new(3, 4);
        assert!(!shared.is_running());
        shared.update_flags(ClientFlags::SESSION_ACTIVE | ClientFlags::VISIBLE, ClientFlags::empty());
        assert!(shared.is_running());
        shared.update_flags(ClientFlags::FOCUSED, ClientFlags::VISIBLE);
        assert_eq!(
            shared.flags(),
            ClientFlags::SESSION_ACTIVE | ClientFlags::FOCUSED
        );
    }

    #[test]
    fn test_request_stop_closes_queue() {
        let shared = SessionShared::new(0, 4);
        assert_eq!(shared.post(Event::SessionLossPending), PushOutcome::Queued);
        shared.request_stop();
        assert!(shared.stop_requested());
        assert_eq!(shared.post(Event::SessionLossPending), PushOutcome::Closed);
        // Events queued before the stop are still drained.
        assert_eq!(shared.events().drain().len(), 1);
    }

    #[test]
    fn test_debug_images_follow_swapchain() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        let info = SwapchainInfo {
            format: format::XRGB8888,
            width: 8,
            height: 8,
            image_count: 2,
            usage: SwapchainUsage::COLOR,
        };
        let swapchain = client.create_swapchain(&info).unwrap();

        let shared = SessionShared::new(0, 4);
        shared.set_debug_images(Some(DebugImages {
            swapchain_index: 1,
            info,
            swapchain,
            image_index: 1,
            sequence: 5,
        }));
        let view = shared.debug_images().unwrap();
        assert_eq!(view.images().len(), 2);
        assert_eq!(view.images()[0].size, 8 * 8 * 4);

        shared.forget_debug_swapchain(0);
        assert!(shared.debug_images().is_some());
        shared.forget_debug_swapchain(1);
        assert!(shared.debug_images().is_none());
    }
}
