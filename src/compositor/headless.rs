//! Headless compositor
//!
//! Implements the capability interface without a display: images are
//! memfd-backed buffers, acquire walks the images round-robin and frames
//! are only counted.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};
use rustix::fs::MemfdFlags;

use super::{format, Compositor, CompositorClient, NativeImage, Swapchain, SwapchainInfo};
use crate::device::{DeviceInfo, DeviceKind};
use crate::error::CompositorError;
use crate::ipc::protocol::Layer;

/// Counters shared by a headless compositor and everything it created
#[derive(Debug, Default)]
pub struct HeadlessStats {
    pub clients_created: AtomicU64,
    pub live_clients: AtomicU64,
    pub running_sessions: AtomicU64,
    pub live_swapchains: AtomicU64,
    pub frames_submitted: AtomicU64,
}

/// Compositor that renders nowhere
#[derive(Debug)]
pub struct HeadlessCompositor {
    devices: Vec<DeviceInfo>,
    stats: Arc<HeadlessStats>,
}

impl HeadlessCompositor {
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceInfo::new("Headless Display", DeviceKind::Display, 1)],
            stats: Arc::new(HeadlessStats::default()),
        }
    }

    /// Replace the startup device list
    pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
        self.devices = devices;
        self
    }

    pub fn stats(&self) -> Arc<HeadlessStats> {
        self.stats.clone()
    }
}

impl Default for HeadlessCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor for HeadlessCompositor {
    fn name(&self) -> &str {
        "headless"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, CompositorError> {
        Ok(self.devices.clone())
    }

    fn create_client(&self, session_id: u32) -> Result<Box<dyn CompositorClient>, CompositorError> {
        self.stats.clients_created.fetch_add(1, Ordering::Relaxed);
        self.stats.live_clients.fetch_add(1, Ordering::Relaxed);
        debug!("Headless client created for session {}", session_id);
        Ok(Box::new(HeadlessClient {
            session_id,
            running: false,
            stats: self.stats.clone(),
        }))
    }
}

struct HeadlessClient {
    session_id: u32,
    running: bool,
    stats: Arc<HeadlessStats>,
}

impl CompositorClient for HeadlessClient {
    fn begin_session(&mut self) -> Result<(), CompositorError> {
        if !self.running {
            self.running = true;
            self.stats.running_sessions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), CompositorError> {
        if self.running {
            self.running = false;
            self.stats.running_sessions.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn create_swapchain(
        &mut self,
        info: &SwapchainInfo,
    ) -> Result<Arc<dyn Swapchain>, CompositorError> {
        let bpp = format::bytes_per_pixel(info.format)
            .ok_or(CompositorError::UnsupportedFormat(info.format))?;
        let size = (info.width as u64)
            .checked_mul(info.height as u64)
            .and_then(|pixels| pixels.checked_mul(bpp as u64))
            .ok_or(CompositorError::OutOfMemory)?;

        let images = (0..info.image_count)
            .map(|_| allocate_image(size))
            .collect::<Result<Vec<_>, _>>()?;

        self.stats.live_swapchains.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Session {}: headless swapchain {}x{} format {:#x}, {} images",
            self.session_id, info.width, info.height, info.format, info.image_count
        );

        Ok(Arc::new(HeadlessSwapchain {
            info: *info,
            images,
            states: Mutex::new(ImageRing::new(info.image_count as usize)),
            stats: self.stats.clone(),
        }))
    }

    fn destroy_swapchain(&mut self, swapchain: Arc<dyn Swapchain>) {
        trace!(
            "Session {}: releasing swapchain with {} images",
            self.session_id,
            swapchain.images().len()
        );
        drop(swapchain);
    }

    fn submit_frame(&mut self, frame_id: i64, layers: &[Layer]) -> Result<(), CompositorError> {
        if !self.running {
            return Err(CompositorError::Other("session not running".into()));
        }
        self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Session {}: frame {} with {} layers",
            self.session_id,
            frame_id,
            layers.len()
        );
        Ok(())
    }
}

impl Drop for HeadlessClient {
    fn drop(&mut self) {
        if self.running {
            self.stats.running_sessions.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.live_clients.fetch_sub(1, Ordering::Relaxed);
    }
}

fn allocate_image(size: u64) -> Result<NativeImage, CompositorError> {
    let fd = rustix::fs::memfd_create("tessera-image", MemfdFlags::CLOEXEC)
        .map_err(|e| CompositorError::Other(format!("memfd_create: {}", e)))?;
    let file = File::from(fd);
    file.set_len(size).map_err(|_| CompositorError::OutOfMemory)?;
    Ok(NativeImage {
        fd: file.into(),
        size,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageState {
    Available,
    Acquired,
    Waited,
}

#[derive(Debug)]
struct ImageRing {
    states: Vec<ImageState>,
    next: usize,
}

impl ImageRing {
    fn new(count: usize) -> Self {
        Self {
            states: vec![ImageState::Available; count],
            next: 0,
        }
    }

    fn acquire(&mut self) -> Option<u32> {
        let count = self.states.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if self.states[index] == ImageState::Available {
                self.states[index] = ImageState::Acquired;
                self.next = (index + 1) % count;
                return Some(index as u32);
            }
        }
        None
    }
}

struct HeadlessSwapchain {
    info: SwapchainInfo,
    images: Vec<NativeImage>,
    states: Mutex<ImageRing>,
    stats: Arc<HeadlessStats>,
}

impl HeadlessSwapchain {
    fn ring(&self) -> std::sync::MutexGuard<'_, ImageRing> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Swapchain for HeadlessSwapchain {
    fn info(&self) -> &SwapchainInfo {
        &self.info
    }

    fn images(&self) -> &[NativeImage] {
        &self.images
    }

    fn acquire_image(&self) -> Result<u32, CompositorError> {
        self.ring().acquire().ok_or(CompositorError::NoImageAvailable)
    }

    fn wait_image(&self, index: u32, _timeout: Duration) -> Result<(), CompositorError> {
        // Nothing reads the images, so they are ready as soon as acquired.
        let mut ring = self.ring();
        match ring.states.get(index as usize) {
            Some(ImageState::Acquired) | Some(ImageState::Waited) => {
                ring.states[index as usize] = ImageState::Waited;
                Ok(())
            }
            _ => Err(CompositorError::ImageState(index)),
        }
    }

    fn release_image(&self, index: u32) -> Result<(), CompositorError> {
        let mut ring = self.ring();
        match ring.states.get(index as usize) {
            Some(ImageState::Acquired) | Some(ImageState::Waited) => {
                ring.states[index as usize] = ImageState::Available;
                Ok(())
            }
            _ => Err(CompositorError::ImageState(index)),
        }
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        self.stats.live_swapchains.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::SwapchainUsage;

    fn info(image_count: u32) -> SwapchainInfo {
        SwapchainInfo {
            format: format::ARGB8888,
            width: 64,
            height: 64,
            image_count,
            usage: SwapchainUsage::COLOR,
        }
    }

    #[test]
    fn test_swapchain_images_sized() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        let swapchain = client.create_swapchain(&info(2)).unwrap();
        assert_eq!(swapchain.images().len(), 2);
        assert_eq!(swapchain.images()[0].size, 64 * 64 * 4);
        assert_eq!(compositor.stats().live_swapchains.load(Ordering::Relaxed), 1);
        client.destroy_swapchain(swapchain);
        assert_eq!(compositor.stats().live_swapchains.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_oversized_swapchain_is_out_of_memory() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        let mut huge = info(1);
        huge.width = u32::MAX;
        huge.height = u32::MAX;
        assert!(matches!(
            client.create_swapchain(&huge),
            Err(CompositorError::OutOfMemory)
        ));
        assert_eq!(compositor.stats().live_swapchains.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unsupported_format() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        let mut bad = info(1);
        bad.format = 0x1234;
        assert!(matches!(
            client.create_swapchain(&bad),
            Err(CompositorError::UnsupportedFormat(0x1234))
        ));
    }

    #[test]
    fn test_acquire_wait_release_cycle() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        let swapchain = client.create_swapchain(&info(2)).unwrap();

        assert_eq!(swapchain.acquire_image().unwrap(), 0);
        assert_eq!(swapchain.acquire_image().unwrap(), 1);
        assert_eq!(
            swapchain.acquire_image(),
            Err(CompositorError::NoImageAvailable)
        );

        swapchain.wait_image(0, Duration::from_millis(1)).unwrap();
        swapchain.release_image(0).unwrap();
        assert_eq!(swapchain.release_image(0), Err(CompositorError::ImageState(0)));
        assert_eq!(swapchain.acquire_image().unwrap(), 0);
        assert!(swapchain.wait_image(7, Duration::ZERO).is_err());
    }

    #[test]
    fn test_submit_requires_session() {
        let compositor = HeadlessCompositor::new();
        let mut client = compositor.create_client(0).unwrap();
        assert!(client.submit_frame(1, &[]).is_err());
        client.begin_session().unwrap();
        client.submit_frame(1, &[]).unwrap();
        assert_eq!(compositor.stats().frames_submitted.load(Ordering::Relaxed), 1);
        assert_eq!(compositor.stats().running_sessions.load(Ordering::Relaxed), 1);
        drop(client);
        assert_eq!(compositor.stats().running_sessions.load(Ordering::Relaxed), 0);
        assert_eq!(compositor.stats().live_clients.load(Ordering::Relaxed), 0);
    }
}
