//! Render timing helper
//!
//! Predicts when a client's next frame will be displayed and when the
//! client should wake up to start it, and tracks each frame through
//! woke, begun and delivered so the application time estimate follows what
//! the client actually takes.

use rustix::time::{clock_gettime, ClockId};

use crate::error::IpcError;
use crate::ipc::protocol::FramePrediction;

/// Frames tracked at once; older records are overwritten
const FRAME_RECORDS: usize = 16;

/// Initial guess for the time a client needs to produce a frame
const DEFAULT_APP_TIME_NS: u64 = 4_000_000;
/// Slack between the predicted end of client work and the display time
const MARGIN_NS: u64 = 1_000_000;

/// Current `CLOCK_MONOTONIC` time in nanoseconds
pub fn monotonic_ns() -> u64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FrameState {
    #[default]
    Free,
    Predicted,
    Woke,
    Begun,
    Delivered,
    Discarded,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameRecord {
    frame_id: i64,
    state: FrameState,
    predicted_display_ns: u64,
    wake_up_ns: u64,
    woke_ns: u64,
    begin_ns: u64,
}

/// Per-session frame timing state
#[derive(Debug)]
pub struct RenderTiming {
    period_ns: u64,
    epoch_ns: u64,
    app_time_ns: u64,
    next_frame_id: i64,
    last_display_ns: u64,
    frames: [FrameRecord; FRAME_RECORDS],
}

impl RenderTiming {
    /// `epoch_ns` is the monotonic time of any past vsync
    pub fn new(period_ns: u64, epoch_ns: u64) -> Self {
        Self {
            period_ns: period_ns.max(1),
            epoch_ns,
            app_time_ns: DEFAULT_APP_TIME_NS,
            next_frame_id: 1,
            last_display_ns: 0,
            frames: [FrameRecord::default(); FRAME_RECORDS],
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    pub fn app_time_ns(&self) -> u64 {
        self.app_time_ns
    }

    /// Follow a display refresh-rate change
    pub fn set_period(&mut self, period_ns: u64, epoch_ns: u64) {
        self.period_ns = period_ns.max(1);
        self.epoch_ns = epoch_ns;
    }

    /// Start a new frame and predict its timing
    pub fn predict(&mut self, now_ns: u64) -> FramePrediction {
        let earliest = now_ns + self.app_time_ns + MARGIN_NS;
        let mut display = self.next_vsync(earliest);
        // Two frames never share a display slot.
        if display <= self.last_display_ns {
            display = self.last_display_ns + self.period_ns;
        }
        let wake_up = display.saturating_sub(self.app_time_ns + MARGIN_NS);

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.last_display_ns = display;
        self.frames[frame_id as usize % FRAME_RECORDS] = FrameRecord {
            frame_id,
            state: FrameState::Predicted,
            predicted_display_ns: display,
            wake_up_ns: wake_up,
            woke_ns: 0,
            begin_ns: 0,
        };

        FramePrediction {
            frame_id,
            wake_up_ns: wake_up,
            display_ns: display,
            period_ns: self.period_ns,
        }
    }

    /// Wake-up time predicted for a frame that has not woken yet
    pub fn wake_up_ns(&mut self, frame_id: i64) -> Result<u64, IpcError> {
        let record = self.record(frame_id)?;
        if record.state != FrameState::Predicted {
            return Err(IpcError::InvalidState("frame already woke"));
        }
        Ok(record.wake_up_ns)
    }

    pub fn mark_woke(&mut self, frame_id: i64, now_ns: u64) -> Result<(), IpcError> {
        let record = self.record(frame_id)?;
        if record.state != FrameState::Predicted {
            return Err(IpcError::InvalidState("frame already woke"));
        }
        record.state = FrameState::Woke;
        record.woke_ns = now_ns;
        Ok(())
    }

    pub fn mark_begin(&mut self, frame_id: i64, now_ns: u64) -> Result<(), IpcError> {
        let record = self.record(frame_id)?;
        match record.state {
            FrameState::Predicted | FrameState::Woke => {
                if record.woke_ns == 0 {
                    record.woke_ns = now_ns;
                }
                record.state = FrameState::Begun;
                record.begin_ns = now_ns;
                Ok(())
            }
            _ => Err(IpcError::InvalidState("frame already begun")),
        }
    }

    /// Fails unless `frame_id` is still open for submission
    pub fn check_deliverable(&mut self, frame_id: i64) -> Result<(), IpcError> {
        match self.record(frame_id)?.state {
            FrameState::Predicted | FrameState::Woke | FrameState::Begun => Ok(()),
            _ => Err(IpcError::InvalidState("frame already finished")),
        }
    }

    /// Frame handed to the compositor; returns its predicted display time
    pub fn mark_delivered(&mut self, frame_id: i64, now_ns: u64) -> Result<u64, IpcError> {
        self.check_deliverable(frame_id)?;
        let record = self.record(frame_id)?;
        record.state = FrameState::Delivered;
        let started = if record.woke_ns != 0 {
            record.woke_ns
        } else {
            record.wake_up_ns
        };
        let display = record.predicted_display_ns;

        let measured = now_ns
            .saturating_sub(started)
            .min(self.period_ns.saturating_mul(2));
        self.app_time_ns = (self.app_time_ns * 7 + measured) / 8;
        Ok(display)
    }

    pub fn mark_discarded(&mut self, frame_id: i64) -> Result<(), IpcError> {
        let record = self.record(frame_id)?;
        match record.state {
            FrameState::Delivered | FrameState::Discarded => {
                Err(IpcError::InvalidState("frame already finished"))
            }
            _ => {
                record.state = FrameState::Discarded;
                Ok(())
            }
        }
    }

    fn next_vsync(&self, earliest_ns: u64) -> u64 {
        if earliest_ns <= self.epoch_ns {
            return self.epoch_ns;
        }
        let periods = (earliest_ns - self.epoch_ns).div_ceil(self.period_ns);
        self.epoch_ns + periods * self.period_ns
    }

    fn record(&mut self, frame_id: i64) -> Result<&mut FrameRecord, IpcError> {
        if frame_id <= 0 {
            return Err(IpcError::InvalidArgument(format!("frame id {}", frame_id)));
        }
        let record = &mut self.frames[frame_id as usize % FRAME_RECORDS];
        if record.frame_id != frame_id || record.state == FrameState::Free {
            return Err(IpcError::InvalidArgument(format!(
                "unknown frame id {}",
                frame_id
            )));
        }
        Ok(record)
    }
}
