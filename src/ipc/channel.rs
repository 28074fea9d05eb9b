//! Framed message channel over a Unix stream socket
//!
//! Reads and writes block. A channel is cancelled from another thread by
//! shutting down its read side through a [`ChannelCloser`], which makes the
//! blocked read return end-of-stream while the owner can still write a
//! final notification.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use bytemuck::Pod;
use log::trace;
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};

use crate::error::ChannelError;
use crate::ipc::protocol::{
    FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD, MAX_SWAPCHAIN_IMAGES,
};

/// Most descriptors that can arrive with a single frame
pub const MAX_FDS: usize = MAX_SWAPCHAIN_IMAGES;

/// A frame as read off the wire
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    /// The declared payload exceeded [`MAX_PAYLOAD`] and was discarded
    pub oversized: bool,
}

/// One end of a connection
#[derive(Debug)]
pub struct MessageChannel {
    stream: UnixStream,
}

/// Handle that can cancel a channel from another thread
#[derive(Debug)]
pub struct ChannelCloser {
    stream: UnixStream,
}

impl ChannelCloser {
    /// Stop reads on the socket; idempotent
    pub fn close(&self) {
        // The peer may already be gone, which leaves nothing to shut down.
        let _ = self.stream.shutdown(Shutdown::Read);
    }
}

impl MessageChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Create a closer sharing this channel's socket
    pub fn closer(&self) -> io::Result<ChannelCloser> {
        Ok(ChannelCloser {
            stream: self.stream.try_clone()?,
        })
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Read one frame; descriptors are not expected in this direction
    pub fn read_frame(&mut self) -> Result<Frame, ChannelError> {
        let mut raw = [0u8; HEADER_SIZE];
        self.stream
            .read_exact(&mut raw)
            .map_err(ChannelError::from_read)?;
        let header: FrameHeader = bytemuck::pod_read_unaligned(&raw);
        self.read_payload(header)
    }

    /// Read one frame together with any descriptors sent alongside it
    pub fn recv_frame(&mut self) -> Result<(Frame, Vec<OwnedFd>), ChannelError> {
        let mut raw = [0u8; HEADER_SIZE];
        let mut filled = 0;
        let mut fds = Vec::new();
        let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS))];

        while filled < HEADER_SIZE {
            let mut control = RecvAncillaryBuffer::new(&mut space);
            let msg = recvmsg(
                &self.stream,
                &mut [IoSliceMut::new(&mut raw[filled..])],
                &mut control,
                RecvFlags::empty(),
            )
            .map_err(|e| ChannelError::from_read(io::Error::from(e)))?;

            for message in control.drain() {
                if let RecvAncillaryMessage::ScmRights(rights) = message {
                    fds.extend(rights);
                }
            }

            if msg.bytes == 0 {
                return Err(ChannelError::Disconnected);
            }
            filled += msg.bytes;
        }

        let header: FrameHeader = bytemuck::pod_read_unaligned(&raw);
        let frame = self.read_payload(header)?;
        Ok((frame, fds))
    }

    fn read_payload(&mut self, header: FrameHeader) -> Result<Frame, ChannelError> {
        let len = header.len as usize;
        if len > MAX_PAYLOAD {
            // Skip the body so the stream stays framed.
            let skipped = io::copy(
                &mut (&self.stream).take(len as u64),
                &mut io::sink(),
            )?;
            if skipped != len as u64 {
                return Err(ChannelError::Disconnected);
            }
            trace!("Discarded oversized frame of {} bytes", len);
            return Ok(Frame {
                header,
                payload: Vec::new(),
                oversized: true,
            });
        }

        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(ChannelError::from_read)?;
        Ok(Frame {
            header,
            payload,
            oversized: false,
        })
    }

    /// Write one frame built from a header and payload parts
    pub fn write_frame(
        &mut self,
        kind: FrameKind,
        code: i32,
        seq: u32,
        parts: &[&[u8]],
    ) -> Result<(), ChannelError> {
        let bytes = assemble(kind, code, seq, parts);
        self.stream.write_all(&bytes).map_err(ChannelError::from_read)
    }

    /// Write one frame with a single record payload
    pub fn write_record<T: Pod>(
        &mut self,
        kind: FrameKind,
        code: i32,
        seq: u32,
        record: &T,
    ) -> Result<(), ChannelError> {
        self.write_frame(kind, code, seq, &[bytemuck::bytes_of(record)])
    }

    /// Write one frame, passing `fds` with its first byte
    pub fn write_frame_with_fds(
        &mut self,
        kind: FrameKind,
        code: i32,
        seq: u32,
        parts: &[&[u8]],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), ChannelError> {
        if fds.is_empty() {
            return self.write_frame(kind, code, seq, parts);
        }
        if fds.len() > MAX_FDS {
            return Err(ChannelError::Protocol(format!(
                "{} descriptors exceed the per-frame limit of {}",
                fds.len(),
                MAX_FDS
            )));
        }

        let bytes = assemble(kind, code, seq, parts);
        let mut space = vec![MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))];
        let mut control = SendAncillaryBuffer::new(&mut space);
        if !control.push(SendAncillaryMessage::ScmRights(fds)) {
            return Err(ChannelError::Protocol(
                "ancillary buffer too small".into(),
            ));
        }

        let sent = sendmsg(
            &self.stream,
            &[IoSlice::new(&bytes)],
            &mut control,
            SendFlags::NOSIGNAL,
        )
        .map_err(|e| ChannelError::from_read(io::Error::from(e)))?;

        if sent < bytes.len() {
            self.stream
                .write_all(&bytes[sent..])
                .map_err(ChannelError::from_read)?;
        }
        Ok(())
    }
}

fn assemble(kind: FrameKind, code: i32, seq: u32, parts: &[&[u8]]) -> Vec<u8> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    let header = FrameHeader::new(kind, code, len, seq);
    let mut bytes = Vec::with_capacity(HEADER_SIZE + len);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for part in parts {
        bytes.extend_from_slice(part);
    }
    bytes
}
