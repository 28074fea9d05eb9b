mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{wait_until, TestServer};
use tessera::compositor::{
    Compositor, CompositorClient, HeadlessCompositor, Swapchain, SwapchainInfo,
};
use tessera::config::ServerConfig;
use tessera::device::DeviceInfo;
use tessera::error::{CompositorError, ResultCode};
use tessera::ipc::protocol::Layer;

/// Switches shared by a [`FaultyCompositor`] and its clients
#[derive(Default)]
struct Faults {
    fail_submits: AtomicBool,
    stall_session: Mutex<Option<u32>>,
    stalled: AtomicBool,
    released: Mutex<bool>,
    release: Condvar,
}

impl Faults {
    fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.release.notify_all();
    }

    fn wait_for_release(&self) {
        let released = self.released.lock().unwrap();
        let _ = self
            .release
            .wait_timeout_while(released, Duration::from_secs(30), |released| !*released)
            .unwrap();
    }
}

/// Headless compositor whose submits can fail or hang on demand
struct FaultyCompositor {
    inner: HeadlessCompositor,
    faults: Arc<Faults>,
}

impl Compositor for FaultyCompositor {
    fn name(&self) -> &str {
        "faulty"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, CompositorError> {
        self.inner.devices()
    }

    fn create_client(&self, session_id: u32) -> Result<Box<dyn CompositorClient>, CompositorError> {
        Ok(Box::new(FaultyClient {
            session_id,
            inner: self.inner.create_client(session_id)?,
            faults: self.faults.clone(),
        }))
    }
}

struct FaultyClient {
    session_id: u32,
    inner: Box<dyn CompositorClient>,
    faults: Arc<Faults>,
}

impl CompositorClient for FaultyClient {
    fn begin_session(&mut self) -> Result<(), CompositorError> {
        self.inner.begin_session()
    }

    fn end_session(&mut self) -> Result<(), CompositorError> {
        self.inner.end_session()
    }

    fn create_swapchain(
        &mut self,
        info: &SwapchainInfo,
    ) -> Result<Arc<dyn Swapchain>, CompositorError> {
        self.inner.create_swapchain(info)
    }

    fn destroy_swapchain(&mut self, swapchain: Arc<dyn Swapchain>) {
        self.inner.destroy_swapchain(swapchain)
    }

    fn submit_frame(&mut self, frame_id: i64, layers: &[Layer]) -> Result<(), CompositorError> {
        if self.faults.fail_submits.load(Ordering::Acquire) {
            return Err(CompositorError::Other("injected failure".into()));
        }
        if *self.faults.stall_session.lock().unwrap() == Some(self.session_id) {
            self.faults.stalled.store(true, Ordering::Release);
            self.faults.wait_for_release();
        }
        self.inner.submit_frame(frame_id, layers)
    }
}

fn faulty_server(adjust: impl FnOnce(&mut ServerConfig)) -> (TestServer, Arc<Faults>) {
    let faults = Arc::new(Faults::default());
    let compositor = FaultyCompositor {
        inner: HeadlessCompositor::new(),
        faults: faults.clone(),
    };
    (TestServer::with_compositor(Arc::new(compositor), adjust), faults)
}

#[test]
fn test_failed_compositor_submit_leaves_frame_open() {
    let (server, faults) = faulty_server(|_| {});
    let mut conn = server.connect();
    let id = conn.session_id() as usize;
    conn.begin_session().unwrap();
    let frame = conn.predict_frame().unwrap().frame_id;

    faults.fail_submits.store(true, Ordering::Release);
    assert_eq!(
        conn.submit_frame(frame, &[]).unwrap_err().code(),
        Some(ResultCode::CompositorFailure)
    );
    assert_eq!(conn.shm().published(id), 0);

    // The same frame can be submitted again once the compositor recovers.
    faults.fail_submits.store(false, Ordering::Release);
    assert_eq!(conn.submit_frame(frame, &[]).unwrap(), 1);
    assert_eq!(conn.shm().published(id), 1);
    assert_eq!(
        conn.submit_frame(frame, &[]).unwrap_err().code(),
        Some(ResultCode::InvalidState)
    );
    server.stop();
}

#[test]
fn test_shutdown_abandons_stuck_session_and_recycles_others() {
    let timeout = Duration::from_millis(300);
    let (server, faults) =
        faulty_server(|c| c.shutdown_timeout_ms = timeout.as_millis() as u64);
    let mut stuck = server.connect();
    let mut healthy = server.connect();
    let (stuck_id, healthy_id) = (stuck.session_id(), healthy.session_id());
    assert!(stuck_id < healthy_id);

    *faults.stall_session.lock().unwrap() = Some(stuck_id);
    stuck.begin_session().unwrap();
    healthy.begin_session().unwrap();
    let frame = stuck.predict_frame().unwrap().frame_id;
    let submitter = thread::spawn(move || {
        let _ = stuck.submit_frame(frame, &[]);
    });
    assert!(wait_until(|| faults.stalled.load(Ordering::Acquire)));

    let started = Instant::now();
    let handle = server.stop_and_keep_handle();
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);
    assert!(
        elapsed < timeout + Duration::from_secs(2),
        "returned after {:?}",
        elapsed
    );

    // The stuck slot is never handed out again; the healthy one was joined.
    assert_eq!(handle.session_ids(), vec![stuck_id]);
    assert!(handle.session_state(stuck_id).is_some());
    assert!(handle.session_state(healthy_id).is_none());
    healthy.wait_closed().unwrap();

    faults.release();
    submitter.join().unwrap();
}
