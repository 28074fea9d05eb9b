//! Request handlers
//!
//! Each opcode decodes exactly one argument record, validates it against
//! session-local bounds and produces exactly one result record.

use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use log::{debug, info, trace};

use super::{ClientInfo, DebugImages, Session};
use crate::compositor::{Swapchain, SwapchainInfo};
use crate::error::IpcError;
use crate::ipc::protocol::{
    decode, decode_array, decode_name, decode_prefix, encode_name, ClientFlags, ClientInfoArgs,
    ClientInfoResult, CountResult, CreateSwapchainArgs, CreateSwapchainResult, FrameIdArgs,
    ImageArgs, ImageResult, Layer, LayerKind, Opcode, SessionArgs, SubmitFrameArgs,
    SubmitFrameResult, SwapchainArgs, WaitForEventArgs, WaitImageArgs, MAX_LAYERS,
    MAX_SWAPCHAIN_DIMENSION, MAX_SWAPCHAIN_IMAGES,
};
use crate::timing::monotonic_ns;

/// Longest `WaitWoke` sleep, in frame periods
const MAX_WAKE_PERIODS: u64 = 2;

/// Successful outcome of a request
pub(super) enum Reply {
    Empty,
    Record(Vec<u8>),
    /// Answer with the number of events flushed ahead of the response
    EventCount,
    /// Record sent together with the swapchain's image descriptors
    Images(Vec<u8>, Arc<dyn Swapchain>),
}

impl Reply {
    fn record<T: Pod>(record: &T) -> Self {
        Reply::Record(bytemuck::bytes_of(record).to_vec())
    }
}

fn expect_empty(payload: &[u8]) -> Result<(), IpcError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(IpcError::MalformedFrame(format!(
            "expected empty payload, got {} bytes",
            payload.len()
        )))
    }
}

impl Session {
    pub(super) fn dispatch(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Reply, IpcError> {
        match opcode {
            Opcode::SetClientInfo => self.set_client_info(decode(payload)?),
            Opcode::SessionBegin => {
                expect_empty(payload)?;
                self.begin_session()
            }
            Opcode::SessionEnd => {
                expect_empty(payload)?;
                self.end_session()
            }
            Opcode::PollEvents => {
                expect_empty(payload)?;
                Ok(Reply::EventCount)
            }
            Opcode::WaitForEvent => self.wait_for_event(decode(payload)?),

            Opcode::PredictFrame => {
                expect_empty(payload)?;
                self.predict_frame()
            }
            Opcode::WaitWoke => self.wait_woke(decode(payload)?),
            Opcode::BeginFrame => {
                let args: FrameIdArgs = decode(payload)?;
                self.require_running()?;
                self.timing.mark_begin(args.frame_id, monotonic_ns())?;
                Ok(Reply::Empty)
            }
            Opcode::DiscardFrame => {
                let args: FrameIdArgs = decode(payload)?;
                self.require_running()?;
                self.timing.mark_discarded(args.frame_id)?;
                Ok(Reply::Empty)
            }
            Opcode::SubmitFrame => self.submit_frame(payload),

            Opcode::CreateSwapchain => self.create_swapchain(decode(payload)?),
            Opcode::DestroySwapchain => {
                let args: SwapchainArgs = decode(payload)?;
                self.release_swapchain(args.index)?;
                Ok(Reply::Empty)
            }
            Opcode::AcquireImage => {
                let args: SwapchainArgs = decode(payload)?;
                let (_, swapchain) = self.swapchains.get(args.index)?;
                let image_index = swapchain.acquire_image()?;
                Ok(Reply::record(&ImageResult { image_index }))
            }
            Opcode::WaitImage => {
                let args: WaitImageArgs = decode(payload)?;
                let swapchain = self.swapchains.image(args.index, args.image_index)?;
                swapchain.wait_image(args.image_index, Duration::from_nanos(args.timeout_ns))?;
                Ok(Reply::Empty)
            }
            Opcode::ReleaseImage => {
                let args: ImageArgs = decode(payload)?;
                let swapchain = self.swapchains.image(args.index, args.image_index)?;
                swapchain.release_image(args.image_index)?;
                Ok(Reply::Empty)
            }

            Opcode::GetClients => {
                expect_empty(payload)?;
                self.get_clients()
            }
            Opcode::GetClientInfo => self.get_client_info(decode(payload)?),
            Opcode::SetActiveClient => {
                let args: SessionArgs = decode(payload)?;
                self.core.set_active_session(args.session_id)?;
                Ok(Reply::Empty)
            }
        }
    }

    fn require_running(&self) -> Result<(), IpcError> {
        if self.running {
            Ok(())
        } else {
            Err(IpcError::InvalidState("session not running"))
        }
    }

    // ------------------------------------------------------------------
    // Client and session state
    // ------------------------------------------------------------------

    fn set_client_info(&mut self, args: ClientInfoArgs) -> Result<Reply, IpcError> {
        let info = ClientInfo {
            pid: args.pid,
            name: decode_name(&args.name),
        };
        info!(
            "session {}: client {:?} (pid {})",
            self.id, info.name, info.pid
        );
        self.shared.set_client_info(info);
        Ok(Reply::Empty)
    }

    fn begin_session(&mut self) -> Result<Reply, IpcError> {
        if self.running {
            return Err(IpcError::InvalidState("session already running"));
        }
        self.client.begin_session()?;
        self.running = true;
        self.shared
            .update_flags(ClientFlags::SESSION_ACTIVE, ClientFlags::empty());
        self.core.on_session_begin(self.id);
        info!("session {}: session begun", self.id);
        Ok(Reply::Empty)
    }

    fn end_session(&mut self) -> Result<Reply, IpcError> {
        self.require_running()?;
        self.running = false;
        self.shared
            .update_flags(ClientFlags::empty(), ClientFlags::SESSION_ACTIVE);
        self.core.on_session_stopped(self.id);
        self.client.end_session()?;
        info!("session {}: session ended", self.id);
        Ok(Reply::Empty)
    }

    fn wait_for_event(&mut self, args: WaitForEventArgs) -> Result<Reply, IpcError> {
        if self.shared.events.is_empty() {
            let outcome = self
                .shared
                .events
                .wait(Duration::from_millis(args.timeout_ms as u64));
            trace!("session {}: event wait returned {:?}", self.id, outcome);
        }
        Ok(Reply::EventCount)
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    fn predict_frame(&mut self) -> Result<Reply, IpcError> {
        self.require_running()?;
        let (period_ns, epoch_ns) = self.core.display_timing();
        if period_ns != self.timing.period_ns() {
            self.timing.set_period(period_ns, epoch_ns);
        }
        let prediction = self.timing.predict(monotonic_ns());
        Ok(Reply::record(&prediction))
    }

    fn wait_woke(&mut self, args: FrameIdArgs) -> Result<Reply, IpcError> {
        self.require_running()?;
        let wake_up_ns = self.timing.wake_up_ns(args.frame_id)?;
        let now = monotonic_ns();
        if wake_up_ns > now {
            let limit = self.timing.period_ns() * MAX_WAKE_PERIODS;
            std::thread::sleep(Duration::from_nanos((wake_up_ns - now).min(limit)));
        }
        self.timing.mark_woke(args.frame_id, monotonic_ns())?;
        Ok(Reply::Empty)
    }

    fn submit_frame(&mut self, payload: &[u8]) -> Result<Reply, IpcError> {
        let (args, tail) = decode_prefix::<SubmitFrameArgs>(payload)?;
        let count = args.layer_count as usize;
        if count > MAX_LAYERS {
            return Err(IpcError::InvalidArgument(format!(
                "{} layers exceed the limit of {}",
                count, MAX_LAYERS
            )));
        }
        let layers: Vec<Layer> = decode_array(tail, count)?;
        self.require_running()?;

        for layer in &layers {
            self.swapchains
                .image(layer.swapchain_index, layer.image_index)?;
            if LayerKind::from_raw(layer.kind).is_none() {
                return Err(IpcError::InvalidArgument(format!(
                    "unknown layer kind {}",
                    layer.kind
                )));
            }
        }

        self.timing.check_deliverable(args.frame_id)?;
        self.client.submit_frame(args.frame_id, &layers)?;
        let display_ns = self.timing.mark_delivered(args.frame_id, monotonic_ns())?;
        let sequence = self
            .ring
            .publish(args.frame_id, display_ns, self.id, &layers);
        self.update_debug_images(&layers, sequence);

        trace!(
            "session {}: frame {} published as {} with {} layers",
            self.id,
            args.frame_id,
            sequence,
            layers.len()
        );
        Ok(Reply::record(&SubmitFrameResult { sequence }))
    }

    fn update_debug_images(&self, layers: &[Layer], sequence: u64) {
        let Some(layer) = layers.first() else {
            return;
        };
        if let Ok((_, swapchain)) = self.swapchains.get(layer.swapchain_index) {
            self.shared.set_debug_images(Some(DebugImages {
                swapchain_index: layer.swapchain_index,
                info: *swapchain.info(),
                swapchain: swapchain.clone(),
                image_index: layer.image_index,
                sequence,
            }));
        }
    }

    // ------------------------------------------------------------------
    // Swapchains
    // ------------------------------------------------------------------

    fn create_swapchain(&mut self, args: CreateSwapchainArgs) -> Result<Reply, IpcError> {
        let dimensions = 1..=MAX_SWAPCHAIN_DIMENSION;
        if !dimensions.contains(&args.width) || !dimensions.contains(&args.height) {
            return Err(IpcError::InvalidArgument(format!(
                "swapchain size {}x{} not within 1..={}",
                args.width, args.height, MAX_SWAPCHAIN_DIMENSION
            )));
        }
        if args.image_count == 0 || args.image_count as usize > MAX_SWAPCHAIN_IMAGES {
            return Err(IpcError::InvalidArgument(format!(
                "image count {} not in 1..={}",
                args.image_count, MAX_SWAPCHAIN_IMAGES
            )));
        }

        let index = self.swapchains.first_free()?;
        let info = SwapchainInfo::from(&args);
        let swapchain = self.client.create_swapchain(&info)?;
        self.swapchains.insert(index, swapchain.clone())?;

        let result = CreateSwapchainResult {
            index,
            image_count: swapchain.images().len() as u32,
            image_size: swapchain.images().first().map_or(0, |image| image.size),
        };
        debug!(
            "session {}: swapchain {} created, {}x{} format {:#x}, {} images",
            self.id, index, info.width, info.height, info.format, result.image_count
        );
        Ok(Reply::Images(
            bytemuck::bytes_of(&result).to_vec(),
            swapchain,
        ))
    }

    /// Destroy swapchain `index`; an already inactive slot is left alone
    pub(super) fn release_swapchain(&mut self, index: u32) -> Result<(), IpcError> {
        if let Some(swapchain) = self.swapchains.take(index)? {
            self.shared.forget_debug_swapchain(index);
            self.client.destroy_swapchain(swapchain);
            self.swapchains.free(index);
            debug!("session {}: swapchain {} destroyed", self.id, index);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // System calls
    // ------------------------------------------------------------------

    fn get_clients(&self) -> Result<Reply, IpcError> {
        let ids = self.core.arena.occupied_ids();
        let mut body = bytemuck::bytes_of(&CountResult {
            count: ids.len() as u32,
        })
        .to_vec();
        body.extend_from_slice(bytemuck::cast_slice(&ids));
        Ok(Reply::Record(body))
    }

    fn get_client_info(&self, args: SessionArgs) -> Result<Reply, IpcError> {
        let shared = self
            .core
            .session(args.session_id)
            .ok_or(IpcError::NotFound)?;
        let info = shared.client_info();
        Ok(Reply::record(&ClientInfoResult {
            pid: info.pid,
            flags: shared.flags().bits(),
            name: encode_name(&info.name),
        }))
    }
}
