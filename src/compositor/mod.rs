//! Compositor capability interface
//!
//! The server drives rendering through these traits and never looks behind
//! them. A [`Compositor`] is created once per process; each session gets its
//! own [`CompositorClient`], and every swapchain it creates is a shared
//! [`Swapchain`] handle so the debug view can keep images alive for one
//! publish cycle.

pub mod headless;

use std::os::unix::io::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceInfo;
use crate::error::CompositorError;
use crate::ipc::protocol::{CreateSwapchainArgs, Layer, SwapchainUsage};

pub use headless::HeadlessCompositor;

/// Pixel formats as DRM fourcc codes
pub mod format {
    pub const ARGB8888: u64 = 0x3432_5241;
    pub const XRGB8888: u64 = 0x3432_5258;
    pub const ABGR8888: u64 = 0x3432_4241;
    pub const XBGR8888: u64 = 0x3432_4258;

    /// Bytes per pixel for the formats above
    pub fn bytes_per_pixel(format: u64) -> Option<u32> {
        match format {
            ARGB8888 | XRGB8888 | ABGR8888 | XBGR8888 => Some(4),
            _ => None,
        }
    }
}

/// Parameters of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub format: u64,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub usage: SwapchainUsage,
}

impl From<&CreateSwapchainArgs> for SwapchainInfo {
    fn from(args: &CreateSwapchainArgs) -> Self {
        Self {
            format: args.format,
            width: args.width,
            height: args.height,
            image_count: args.image_count,
            usage: SwapchainUsage::from_bits_truncate(args.usage),
        }
    }
}

/// A backing image the peer maps itself
#[derive(Debug)]
pub struct NativeImage {
    pub fd: OwnedFd,
    pub size: u64,
}

/// Compositor-side swapchain
pub trait Swapchain: Send + Sync {
    fn info(&self) -> &SwapchainInfo;

    fn images(&self) -> &[NativeImage];

    /// Hand the next free image to the client
    fn acquire_image(&self) -> Result<u32, CompositorError>;

    /// Block until the compositor no longer reads `index`
    fn wait_image(&self, index: u32, timeout: Duration) -> Result<(), CompositorError>;

    /// Return `index` to the compositor
    fn release_image(&self, index: u32) -> Result<(), CompositorError>;
}

/// Per-session compositor handle
pub trait CompositorClient: Send {
    fn begin_session(&mut self) -> Result<(), CompositorError>;

    fn end_session(&mut self) -> Result<(), CompositorError>;

    fn create_swapchain(
        &mut self,
        info: &SwapchainInfo,
    ) -> Result<Arc<dyn Swapchain>, CompositorError>;

    fn destroy_swapchain(&mut self, swapchain: Arc<dyn Swapchain>);

    fn submit_frame(&mut self, frame_id: i64, layers: &[Layer]) -> Result<(), CompositorError>;
}

/// Process-wide compositor
pub trait Compositor: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the compositor up and report the devices present at startup
    fn devices(&self) -> Result<Vec<DeviceInfo>, CompositorError>;

    fn create_client(&self, session_id: u32) -> Result<Box<dyn CompositorClient>, CompositorError>;
}
