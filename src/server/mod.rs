//! IPC server core
//!
//! One calloop event loop accepts connections and reaps finished sessions.
//! Each accepted connection is handed to its own session thread after the
//! handshake has delivered the shared-memory descriptor.

mod active;
mod arena;

use std::fs;
use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use calloop::channel::{self, Channel, Sender};
use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, Interest, LoopSignal, Mode, PostAction};
use log::{debug, error, info, warn};

use crate::compositor::Compositor;
use crate::config::{ServerConfig, SocketActivation, REFRESH_RATE_RANGE};
use crate::device::{DeviceInfo, DeviceSet};
use crate::error::{ChannelError, CompositorError, IpcError, ResultCode, StartupError};
use crate::ipc::channel::MessageChannel;
use crate::ipc::protocol::{Event, FrameKind, HandshakeRecord, PROTOCOL_VERSION};
use crate::session::{ClientInfo, DebugImages, Session, SessionShared};
use crate::shm::{ActivePair, SharedMemory, TimingRecord, TimingWriter};
use crate::timing::monotonic_ns;

use active::ActiveSessions;
pub use arena::{SessionArena, ThreadState};

/// First descriptor passed by a socket-activating supervisor
const LISTEN_FDS_START: i32 = 3;

/// Poll interval while waiting for session threads at shutdown
const JOIN_POLL: Duration = Duration::from_millis(5);

/// State shared by the event loop, every session thread and every handle
pub struct ServerCore {
    pub(crate) config: ServerConfig,
    compositor: Arc<dyn Compositor>,
    shm: Arc<SharedMemory>,
    pub(crate) arena: SessionArena,
    active: ActiveSessions,
    devices: Mutex<DeviceSet>,
    timing: Mutex<TimingWriter>,
    period_ns: AtomicU64,
    epoch_ns: u64,
    running: AtomicBool,
    had_sessions: AtomicBool,
    signal: LoopSignal,
    socket_path: String,
    /// Filesystem socket this process created and must remove
    bound_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum AdmitError {
    #[error("render ring {0} is still held")]
    RingBusy(u32),
    #[error(transparent)]
    Compositor(#[from] CompositorError),
    #[error("handshake failed: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reports a session thread's exit to the event loop, even on panic
struct DoneGuard {
    id: u32,
    tx: Sender<u32>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        // The loop is gone only during shutdown, which joins directly.
        let _ = self.tx.send(self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServerCore {
    /// Current frame period and the vsync epoch it is aligned to
    pub fn display_timing(&self) -> (u64, u64) {
        (self.period_ns.load(Ordering::Acquire), self.epoch_ns)
    }

    pub fn session(&self, id: u32) -> Option<Arc<SessionShared>> {
        self.arena.shared(id)
    }

    pub fn set_active_session(&self, id: u32) -> Result<(), IpcError> {
        self.active.set_active(id, &self.arena)
    }

    pub(crate) fn on_session_begin(&self, id: u32) {
        self.active.on_session_begin(id, &self.arena);
    }

    /// Session `id` ended or is stopping; idempotent
    pub(crate) fn on_session_stopped(&self, id: u32) {
        self.active.deactivate(id, &self.arena);
    }

    fn broadcast(&self, event: Event) {
        for id in self.arena.occupied_ids() {
            if let Some(shared) = self.arena.shared(id) {
                shared.post(event);
            }
        }
    }

    fn request_shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
        self.signal.wakeup();
    }

    fn accept_pending(self: &Arc<Self>, listener: &UnixListener, done_tx: &Sender<u32>) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => self.admit(stream, done_tx),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, stream: UnixStream, done_tx: &Sender<u32>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("Dropping connection: {}", e);
            return;
        }
        let Some(id) = self.arena.claim() else {
            warn!(
                "Rejecting connection: all {} session slots in use",
                self.arena.capacity()
            );
            self.reject(stream);
            return;
        };
        if let Err(e) = self.start_session(id, stream, done_tx) {
            warn!("session {}: failed to start: {}", id, e);
            self.arena.recycle(id);
        }
    }

    fn reject(&self, stream: UnixStream) {
        let mut channel = MessageChannel::new(stream);
        let record = HandshakeRecord {
            result: ResultCode::ResourceExhausted.raw(),
            session_id: u32::MAX,
            protocol_version: PROTOCOL_VERSION,
            max_swapchains: 0,
            shm_size: 0,
        };
        if let Err(e) = channel.write_record(
            FrameKind::Handshake,
            ResultCode::ResourceExhausted.raw(),
            0,
            &record,
        ) {
            debug!("Rejected peer left before the handshake: {}", e);
        }
    }

    fn start_session(
        self: &Arc<Self>,
        id: u32,
        stream: UnixStream,
        done_tx: &Sender<u32>,
    ) -> Result<(), AdmitError> {
        let ring = self
            .shm
            .claim_ring(id as usize)
            .ok_or(AdmitError::RingBusy(id))?;
        let client = self.compositor.create_client(id)?;
        let mut channel = MessageChannel::new(stream);
        let closer = channel.closer()?;

        // A peer that has its session id already receives broadcasts.
        let shared = Arc::new(SessionShared::new(id, self.config.event_queue_capacity));
        self.arena.install(id, shared.clone(), closer);

        let handshake = HandshakeRecord {
            result: ResultCode::Success.raw(),
            session_id: id,
            protocol_version: PROTOCOL_VERSION,
            max_swapchains: self.config.max_swapchains as u32,
            shm_size: self.shm.size() as u64,
        };
        channel.write_frame_with_fds(
            FrameKind::Handshake,
            ResultCode::Success.raw(),
            0,
            &[bytemuck::bytes_of(&handshake)],
            &[self.shm.fd()],
        )?;

        let session = Session::new(self.clone(), shared, client, channel, ring);

        self.arena.advance(id, ThreadState::Starting);
        let tx = done_tx.clone();
        let thread = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || {
                let _done = DoneGuard { id, tx };
                session.run();
            })?;
        self.arena.set_thread(id, thread);
        self.had_sessions.store(true, Ordering::Release);

        info!(
            "session {}: connected ({} of {} slots in use)",
            id,
            self.arena.count(),
            self.arena.capacity()
        );
        Ok(())
    }

    /// A session thread finished; release its slot
    fn reap(&self, id: u32) {
        match self.arena.take_thread(id) {
            Some(thread) => {
                if thread.join().is_err() {
                    error!("session {}: thread panicked", id);
                }
            }
            None if !self.arena.is_occupied(id) => return,
            None => {}
        }
        self.arena.advance(id, ThreadState::Stopping);
        self.on_session_stopped(id);
        self.arena.recycle(id);

        let remaining = self.arena.count();
        info!("session {}: slot released ({} remaining)", id, remaining);
        if self.config.exit_on_disconnect
            && remaining == 0
            && self.had_sessions.load(Ordering::Acquire)
        {
            info!("Last client disconnected");
            self.request_shutdown();
        }
    }

    /// Stop every session and wait for their threads, bounded
    fn stop_sessions(&self) {
        let ids = self.arena.occupied_ids();
        info!("Stopping {} sessions", ids.len());
        for &id in &ids {
            if let Some(shared) = self.arena.shared(id) {
                shared.post(Event::SessionLossPending);
            }
            self.arena.signal_stop(id);
        }

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let deadline = Instant::now() + timeout;
        for id in ids {
            let Some(thread) = self.arena.take_thread(id) else {
                self.arena.recycle(id);
                continue;
            };
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !thread.is_finished() {
                error!(
                    "session {}: did not stop within {:?}, abandoning its thread",
                    id, timeout
                );
                continue;
            }
            if thread.join().is_err() {
                error!("session {}: thread panicked", id);
            }
            self.on_session_stopped(id);
            self.arena.recycle(id);
        }
    }
}

/// A started server, ready to [`run`](Server::run)
pub struct Server {
    core: Arc<ServerCore>,
    event_loop: EventLoop<'static, ()>,
}

impl Server {
    /// Allocate shared memory, open the listening endpoint and bring up the
    /// compositor
    pub fn start(
        config: ServerConfig,
        compositor: Arc<dyn Compositor>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let listener = open_listener(&config)?;
        Self::start_with_listener(config, compositor, listener)
    }

    /// Start on an already-listening socket
    pub fn start_with_listener(
        config: ServerConfig,
        compositor: Arc<dyn Compositor>,
        listener: Listener,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        info!("Starting server with the {} compositor", compositor.name());

        let initial_devices = compositor.devices()?;
        let (shm, writers) =
            SharedMemory::create(config.max_sessions).map_err(StartupError::SharedMemory)?;
        let devices = DeviceSet::new(writers.devices, initial_devices);

        let period_ns = config.frame_period_ns();
        let epoch_ns = monotonic_ns();
        let mut timing = writers.timing;
        timing.write(TimingRecord {
            period_ns,
            epoch_ns,
        });

        let Listener {
            listener,
            description,
            bound_path,
        } = listener;
        listener
            .set_nonblocking(true)
            .map_err(|e| StartupError::Bind {
                path: PathBuf::from(&description),
                source: e,
            })?;

        let event_loop: EventLoop<'static, ()> =
            EventLoop::try_new().map_err(|e| StartupError::EventLoop(e.to_string()))?;
        let (done_tx, done_rx): (Sender<u32>, Channel<u32>) = channel::channel();

        let core = Arc::new(ServerCore {
            arena: SessionArena::new(config.max_sessions),
            active: ActiveSessions::new(writers.global),
            devices: Mutex::new(devices),
            timing: Mutex::new(timing),
            period_ns: AtomicU64::new(period_ns),
            epoch_ns,
            running: AtomicBool::new(true),
            had_sessions: AtomicBool::new(false),
            signal: event_loop.get_signal(),
            socket_path: description,
            bound_path,
            config,
            compositor,
            shm,
        });

        let handle = event_loop.handle();
        let listener_fd = listener
            .try_clone()
            .map(OwnedFd::from)
            .map_err(|e| StartupError::EventLoop(e.to_string()))?;
        handle
            .insert_source(Generic::new(listener_fd, Interest::READ, Mode::Level), {
                let core = core.clone();
                move |_, _, _| {
                    core.accept_pending(&listener, &done_tx);
                    Ok(PostAction::Continue)
                }
            })
            .map_err(|e| StartupError::EventLoop(e.to_string()))?;

        handle
            .insert_source(done_rx, {
                let core = core.clone();
                move |event, _, _| {
                    if let channel::Event::Msg(id) = event {
                        core.reap(id);
                    }
                }
            })
            .map_err(|e| StartupError::EventLoop(e.to_string()))?;

        info!(
            "Listening on {} ({} session slots, {} bytes shared memory)",
            core.socket_path,
            core.arena.capacity(),
            core.shm.size()
        );
        Ok(Self { core, event_loop })
    }

    /// Start on a dedicated thread and return once the server is listening
    pub fn spawn(
        config: ServerConfig,
        compositor: Arc<dyn Compositor>,
    ) -> Result<(ServerHandle, JoinHandle<Result<(), StartupError>>), StartupError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name("tessera-server".into())
            .spawn(move || {
                let server = match Server::start(config, compositor) {
                    Ok(server) => server,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return Ok(());
                    }
                };
                let _ = tx.send(Ok(server.handle()));
                server.run()
            })
            .map_err(StartupError::Thread)?;

        match rx.recv() {
            Ok(Ok(handle)) => Ok((handle, thread)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(StartupError::EventLoop(
                "server thread exited during startup".into(),
            )),
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            core: self.core.clone(),
        }
    }

    /// Shut down cleanly on SIGINT or SIGTERM
    ///
    /// Call before any session thread exists so they inherit the signal
    /// mask.
    pub fn watch_signals(&mut self) -> Result<(), StartupError> {
        let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
            .map_err(|e| StartupError::EventLoop(e.to_string()))?;
        let core = self.core.clone();
        self.event_loop
            .handle()
            .insert_source(signals, move |event, _, _| {
                info!("Received {:?}", event.signal());
                core.request_shutdown();
            })
            .map_err(|e| StartupError::EventLoop(e.to_string()))?;
        Ok(())
    }

    /// Serve until shutdown is requested, then stop every session
    pub fn run(mut self) -> Result<(), StartupError> {
        let mut result = Ok(());
        while self.core.running.load(Ordering::Acquire) {
            if let Err(e) = self.event_loop.dispatch(None, &mut ()) {
                error!("Event loop error: {}", e);
                self.core.running.store(false, Ordering::Release);
                result = Err(StartupError::EventLoop(e.to_string()));
            }
        }

        self.core.stop_sessions();
        if let Some(path) = &self.core.bound_path {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove socket {:?}: {}", path, e);
            }
        }
        info!("Server stopped");
        result
    }
}

/// Cloneable control surface of a running server
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<ServerCore>,
}

impl ServerHandle {
    /// Wake the event loop and begin an orderly shutdown
    pub fn request_shutdown(&self) {
        self.core.request_shutdown();
    }

    /// False once shutdown has been requested
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Where clients connect; `@name` for the abstract namespace
    pub fn socket_path(&self) -> &str {
        &self.core.socket_path
    }

    /// Occupied session slots, including ones still starting up or
    /// abandoned during shutdown
    pub fn session_count(&self) -> usize {
        self.core.arena.count()
    }

    /// Ids of the occupied slots, in ascending order
    pub fn session_ids(&self) -> Vec<u32> {
        self.core.arena.occupied_ids()
    }

    /// Lifecycle state of slot `id`; `None` while the slot is free
    pub fn session_state(&self, id: u32) -> Option<ThreadState> {
        if self.core.arena.is_occupied(id) {
            self.core.arena.state(id)
        } else {
            None
        }
    }

    /// What session `id` reported about itself through SetClientInfo
    pub fn client_info(&self, id: u32) -> Option<ClientInfo> {
        self.core.session(id).map(|s| s.client_info())
    }

    pub fn set_active_session(&self, id: u32) -> Result<(), IpcError> {
        self.core.set_active_session(id)
    }

    /// Current and previous active session as published in shared memory
    pub fn active(&self) -> ActivePair {
        self.core.shm.reader().active()
    }

    /// Session whose frames are on screen right now
    pub fn composited_session(&self) -> Option<u32> {
        self.core.shm.reader().composited_session()
    }

    pub fn refresh_rate_hz(&self) -> f64 {
        1e9 / self.core.period_ns.load(Ordering::Acquire) as f64
    }

    /// Change the display refresh rate for every session
    pub fn set_refresh_rate(&self, hz: f64) -> Result<(), IpcError> {
        if !REFRESH_RATE_RANGE.contains(&hz) {
            return Err(IpcError::InvalidArgument(format!(
                "refresh rate {} not within {:?}",
                hz, REFRESH_RATE_RANGE
            )));
        }
        let period_ns = (1e9 / hz) as u64;

        let previous = {
            let mut timing = lock(&self.core.timing);
            let previous = self.core.period_ns.swap(period_ns, Ordering::AcqRel);
            timing.write(TimingRecord {
                period_ns,
                epoch_ns: self.core.epoch_ns,
            });
            previous
        };
        if previous == period_ns {
            return Ok(());
        }

        let from_mhz = (1e12 / previous as f64).round() as u32;
        let to_mhz = (1e12 / period_ns as f64).round() as u32;
        info!("Refresh rate {} mHz -> {} mHz", from_mhz, to_mhz);
        self.core
            .broadcast(Event::RefreshRateChanged { from_mhz, to_mhz });
        Ok(())
    }

    /// Hot-plug a device
    pub fn attach_device(&self, device: DeviceInfo) -> Result<u32, IpcError> {
        let index = lock(&self.core.devices).attach(device)?;
        self.core.broadcast(Event::DeviceChanged {
            device_index: index,
            connected: true,
        });
        Ok(index)
    }

    pub fn detach_device(&self, index: u32) -> Result<DeviceInfo, IpcError> {
        let device = lock(&self.core.devices).detach(index)?;
        self.core.broadcast(Event::DeviceChanged {
            device_index: index,
            connected: false,
        });
        Ok(device)
    }

    pub fn device(&self, index: u32) -> Option<DeviceInfo> {
        lock(&self.core.devices).get(index).cloned()
    }

    /// Swapchain images the session presented most recently
    pub fn debug_images(&self, session: u32) -> Option<DebugImages> {
        self.core.session(session)?.debug_images()
    }
}

/// A listening socket plus how it was obtained
pub struct Listener {
    listener: UnixListener,
    description: String,
    bound_path: Option<PathBuf>,
}

impl Listener {
    /// Wrap a socket that is already listening; it is never unlinked
    pub fn inherited(listener: UnixListener, description: impl Into<String>) -> Self {
        Self {
            listener,
            description: description.into(),
            bound_path: None,
        }
    }

    /// Bind the configured path or abstract name
    pub fn bind(config: &ServerConfig) -> Result<Self, StartupError> {
        if let Some(name) = config.abstract_name() {
            let bind_error = |source| StartupError::Bind {
                path: PathBuf::from(&config.socket_path),
                source,
            };
            let addr = SocketAddr::from_abstract_name(name.as_bytes()).map_err(bind_error)?;
            let listener = UnixListener::bind_addr(&addr).map_err(bind_error)?;
            return Ok(Self::inherited(listener, config.socket_path.clone()));
        }

        let path = Path::new(&config.socket_path);
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path).map_err(|source| StartupError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            listener,
            description: config.socket_path.clone(),
            bound_path: Some(path.to_path_buf()),
        })
    }
}

fn open_listener(config: &ServerConfig) -> Result<Listener, StartupError> {
    if config.socket_activation != SocketActivation::Never {
        if let Some(listener) = activated_listener()? {
            info!("Using socket passed by the service manager");
            return Ok(listener);
        }
        if config.socket_activation == SocketActivation::Require {
            return Err(StartupError::SocketActivation(
                "no listening socket was passed (LISTEN_FDS unset)".into(),
            ));
        }
    }
    Listener::bind(config)
}

/// The socket named by `LISTEN_PID`/`LISTEN_FDS`, if it is meant for us
fn activated_listener() -> Result<Option<Listener>, StartupError> {
    let pid = std::env::var("LISTEN_PID").ok();
    let fds = std::env::var("LISTEN_FDS").ok();
    let (Some(pid), Some(fds)) = (pid, fds) else {
        return Ok(None);
    };
    if pid.parse::<u32>().ok() != Some(std::process::id()) {
        debug!("LISTEN_PID {} is not this process", pid);
        return Ok(None);
    }
    let count: u32 = fds
        .parse()
        .map_err(|_| StartupError::SocketActivation(format!("bad LISTEN_FDS {:?}", fds)))?;
    if count == 0 {
        return Ok(None);
    }
    if count > 1 {
        warn!("{} sockets passed, using the first", count);
    }

    // Refuse to adopt a descriptor that is not open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(LISTEN_FDS_START) };
    rustix::io::fcntl_getfd(borrowed).map_err(|e| {
        StartupError::SocketActivation(format!("fd {}: {}", LISTEN_FDS_START, e))
    })?;
    let fd = unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START) };
    Ok(Some(Listener::inherited(
        UnixListener::from(fd),
        format!("fd {}", LISTEN_FDS_START),
    )))
}

/// Remove a socket file nobody is listening on any more
fn remove_stale_socket(path: &Path) -> Result<(), StartupError> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).is_ok() {
        return Err(StartupError::Bind {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AddrInUse,
                "another server is listening",
            ),
        });
    }
    debug!("Removing stale socket {:?}", path);
    fs::remove_file(path).map_err(|source| StartupError::Bind {
        path: path.to_path_buf(),
        source,
    })
}
