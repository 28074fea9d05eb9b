#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tessera::compositor::{format, Compositor, HeadlessCompositor};
use tessera::config::{ServerConfig, SocketActivation};
use tessera::error::StartupError;
use tessera::ipc::protocol::{CreateSwapchainArgs, SwapchainUsage};
use tessera::ipc::Connection;
use tessera::server::{Server, ServerHandle};

/// A server on its own thread, listening in a temporary directory
pub struct TestServer {
    pub handle: ServerHandle,
    thread: Option<JoinHandle<Result<(), StartupError>>>,
    _dir: TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut ServerConfig)) -> Self {
        Self::with_compositor(Arc::new(HeadlessCompositor::new()), adjust)
    }

    pub fn with_compositor(
        compositor: Arc<dyn Compositor>,
        adjust: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            socket_path: dir.path().join("tessera.sock").to_string_lossy().into_owned(),
            socket_activation: SocketActivation::Never,
            shutdown_timeout_ms: 1000,
            ..ServerConfig::default()
        };
        adjust(&mut config);
        let (handle, thread) = Server::spawn(config, compositor).unwrap();
        Self {
            handle,
            thread: Some(thread),
            _dir: dir,
        }
    }

    pub fn connect(&self) -> Connection {
        Connection::connect(self.handle.socket_path()).unwrap()
    }

    /// Request shutdown and wait for the server thread
    pub fn stop(mut self) {
        self.handle.request_shutdown();
        self.join();
    }

    /// Like [`stop`](Self::stop), but hand back the handle for inspection
    /// after the server thread has returned
    pub fn stop_and_keep_handle(mut self) -> ServerHandle {
        self.handle.request_shutdown();
        self.join();
        self.handle.clone()
    }

    /// Wait for the server to stop on its own
    pub fn wait_exit(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.request_shutdown();
            let _ = thread.join();
        }
    }
}

/// Poll `condition` for up to five seconds
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn swapchain_args(width: u32, height: u32, image_count: u32) -> CreateSwapchainArgs {
    CreateSwapchainArgs {
        format: format::ARGB8888,
        width,
        height,
        image_count,
        usage: SwapchainUsage::COLOR.bits(),
    }
}
