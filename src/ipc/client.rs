//! Client side of the protocol
//!
//! [`Connection`] performs the handshake, maps the shared-memory segment
//! and offers one typed method per opcode. Event frames that arrive while
//! a response is awaited are buffered and handed out by
//! [`Connection::take_events`].

use std::collections::VecDeque;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::time::Duration;

use bytemuck::Pod;
use log::trace;

use crate::error::{ChannelError, ResultCode};
use crate::ipc::channel::{Frame, MessageChannel};
use crate::ipc::protocol::{
    decode, decode_array, decode_name, decode_prefix, encode_name, ClientFlags, ClientInfoArgs,
    ClientInfoResult, CountResult, CreateSwapchainArgs, CreateSwapchainResult, EventRecord,
    FrameIdArgs, FrameKind, FramePrediction, HandshakeRecord, ImageArgs, ImageResult, Layer,
    Opcode, QueuedEvent, SessionArgs, SubmitFrameArgs, SubmitFrameResult, SwapchainArgs,
    WaitForEventArgs, WaitImageArgs, PROTOCOL_VERSION,
};
use crate::shm::{ShmReader, ShmView};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Connection rejected: {0:?}")]
    Rejected(ResultCode),
    #[error("Request failed: {0:?}")]
    Request(ResultCode),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Failed to map shared memory: {0}")]
    Shm(#[source] io::Error),
}

impl ClientError {
    /// Result code of a failed request, if that is what this is
    pub fn code(&self) -> Option<ResultCode> {
        match self {
            ClientError::Rejected(code) | ClientError::Request(code) => Some(*code),
            _ => None,
        }
    }
}

/// Response to a raw request
#[derive(Debug)]
pub struct RawResponse {
    pub code: ResultCode,
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// A created swapchain and the descriptors of its images
#[derive(Debug)]
pub struct SwapchainImages {
    pub index: u32,
    pub image_size: u64,
    pub images: Vec<OwnedFd>,
}

/// Another client as reported by `GetClientInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteClient {
    pub pid: u32,
    pub name: String,
    pub flags: ClientFlags,
}

pub struct Connection {
    channel: MessageChannel,
    session_id: u32,
    max_swapchains: u32,
    shm: ShmView,
    next_seq: u32,
    events: VecDeque<QueuedEvent>,
}

fn protocol<E: std::fmt::Display>(err: E) -> ClientError {
    ClientError::Protocol(err.to_string())
}

impl Connection {
    /// Connect to `path`; a leading `@` names an abstract socket
    pub fn connect(path: &str) -> Result<Self, ClientError> {
        let stream = match path.strip_prefix('@') {
            Some(name) => SocketAddr::from_abstract_name(name.as_bytes())
                .and_then(|addr| UnixStream::connect_addr(&addr)),
            None => UnixStream::connect(path),
        }
        .map_err(ClientError::Connect)?;
        Self::handshake(stream)
    }

    /// Complete the handshake on a connected stream
    pub fn handshake(stream: UnixStream) -> Result<Self, ClientError> {
        let mut channel = MessageChannel::new(stream);
        let (frame, fds) = channel.recv_frame()?;
        if frame.header.frame_kind() != Some(FrameKind::Handshake) {
            return Err(ClientError::Protocol(format!(
                "expected handshake, got frame kind {}",
                frame.header.kind
            )));
        }
        let record: HandshakeRecord = decode(&frame.payload).map_err(protocol)?;
        let code = ResultCode::from_raw(record.result);
        if !code.is_success() {
            return Err(ClientError::Rejected(code));
        }
        if record.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::Protocol(format!(
                "server speaks protocol {}, expected {}",
                record.protocol_version, PROTOCOL_VERSION
            )));
        }
        let fd = fds
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Protocol("handshake without shared memory".into()))?;
        let shm = ShmView::map(fd, record.shm_size as usize).map_err(ClientError::Shm)?;

        trace!("Connected as session {}", record.session_id);
        Ok(Self {
            channel,
            session_id: record.session_id,
            max_swapchains: record.max_swapchains,
            shm,
            next_seq: 1,
            events: VecDeque::new(),
        })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn max_swapchains(&self) -> u32 {
        self.max_swapchains
    }

    pub fn shm(&self) -> ShmReader<'_> {
        self.shm.reader()
    }

    /// Events received so far, oldest first
    pub fn take_events(&mut self) -> Vec<QueuedEvent> {
        self.events.drain(..).collect()
    }

    /// Send any request and wait for its response, whatever the result
    pub fn raw_request(&mut self, code: u32, payload: &[u8]) -> Result<RawResponse, ClientError> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.channel
            .write_frame(FrameKind::Request, code as i32, seq, &[payload])?;

        loop {
            let (frame, fds) = self.channel.recv_frame()?;
            match frame.header.frame_kind() {
                Some(FrameKind::Event) => self.buffer_event(&frame)?,
                Some(FrameKind::Response) if frame.header.seq == seq => {
                    return Ok(RawResponse {
                        code: ResultCode::from_raw(frame.header.code),
                        payload: frame.payload,
                        fds,
                    });
                }
                Some(FrameKind::Response) => {
                    return Err(ClientError::Protocol(format!(
                        "response for seq {} while waiting for {}",
                        frame.header.seq, seq
                    )));
                }
                _ => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame kind {}",
                        frame.header.kind
                    )));
                }
            }
        }
    }

    /// Read until the server closes the connection, keeping its events
    pub fn wait_closed(&mut self) -> Result<(), ClientError> {
        loop {
            match self.channel.recv_frame() {
                Ok((frame, _)) if frame.header.frame_kind() == Some(FrameKind::Event) => {
                    self.buffer_event(&frame)?
                }
                Ok((frame, _)) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame kind {} after close",
                        frame.header.kind
                    )));
                }
                Err(ChannelError::Disconnected) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn buffer_event(&mut self, frame: &Frame) -> Result<(), ClientError> {
        let record: EventRecord = decode(&frame.payload).map_err(protocol)?;
        match QueuedEvent::from_record(frame.header.code, &record) {
            Some(event) => self.events.push_back(event),
            None => trace!("Ignoring event of unknown kind {}", frame.header.code),
        }
        Ok(())
    }

    fn call(&mut self, opcode: Opcode, args: &[u8]) -> Result<RawResponse, ClientError> {
        let response = self.raw_request(opcode as u32, args)?;
        if response.code.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Request(response.code))
        }
    }

    fn call_record<T: Pod>(&mut self, opcode: Opcode, args: &[u8]) -> Result<T, ClientError> {
        let response = self.call(opcode, args)?;
        decode(&response.payload).map_err(protocol)
    }

    fn call_empty(&mut self, opcode: Opcode, args: &[u8]) -> Result<(), ClientError> {
        self.call(opcode, args).map(|_| ())
    }

    pub fn set_client_info(&mut self, pid: u32, name: &str) -> Result<(), ClientError> {
        let args = ClientInfoArgs {
            pid,
            name: encode_name(name),
        };
        self.call_empty(Opcode::SetClientInfo, bytemuck::bytes_of(&args))
    }

    pub fn begin_session(&mut self) -> Result<(), ClientError> {
        self.call_empty(Opcode::SessionBegin, &[])
    }

    pub fn end_session(&mut self) -> Result<(), ClientError> {
        self.call_empty(Opcode::SessionEnd, &[])
    }

    /// Flush pending events; returns how many arrived
    pub fn poll_events(&mut self) -> Result<u32, ClientError> {
        let result: CountResult = self.call_record(Opcode::PollEvents, &[])?;
        Ok(result.count)
    }

    pub fn wait_for_event(&mut self, timeout: Duration) -> Result<u32, ClientError> {
        let args = WaitForEventArgs {
            timeout_ms: timeout.as_millis().min(u32::MAX as u128) as u32,
        };
        let result: CountResult =
            self.call_record(Opcode::WaitForEvent, bytemuck::bytes_of(&args))?;
        Ok(result.count)
    }

    pub fn predict_frame(&mut self) -> Result<FramePrediction, ClientError> {
        self.call_record(Opcode::PredictFrame, &[])
    }

    pub fn wait_woke(&mut self, frame_id: i64) -> Result<(), ClientError> {
        self.call_empty(Opcode::WaitWoke, bytemuck::bytes_of(&FrameIdArgs { frame_id }))
    }

    pub fn begin_frame(&mut self, frame_id: i64) -> Result<(), ClientError> {
        self.call_empty(Opcode::BeginFrame, bytemuck::bytes_of(&FrameIdArgs { frame_id }))
    }

    pub fn discard_frame(&mut self, frame_id: i64) -> Result<(), ClientError> {
        self.call_empty(
            Opcode::DiscardFrame,
            bytemuck::bytes_of(&FrameIdArgs { frame_id }),
        )
    }

    /// Submit a frame; returns its render ring sequence
    pub fn submit_frame(&mut self, frame_id: i64, layers: &[Layer]) -> Result<u64, ClientError> {
        let head = SubmitFrameArgs {
            frame_id,
            layer_count: layers.len() as u32,
            _pad: 0,
        };
        let mut payload = bytemuck::bytes_of(&head).to_vec();
        payload.extend_from_slice(bytemuck::cast_slice(layers));
        let result: SubmitFrameResult = self.call_record(Opcode::SubmitFrame, &payload)?;
        Ok(result.sequence)
    }

    pub fn create_swapchain(
        &mut self,
        args: &CreateSwapchainArgs,
    ) -> Result<SwapchainImages, ClientError> {
        let response = self.call(Opcode::CreateSwapchain, bytemuck::bytes_of(args))?;
        let result: CreateSwapchainResult = decode(&response.payload).map_err(protocol)?;
        if response.fds.len() != result.image_count as usize {
            return Err(ClientError::Protocol(format!(
                "{} image descriptors for {} images",
                response.fds.len(),
                result.image_count
            )));
        }
        Ok(SwapchainImages {
            index: result.index,
            image_size: result.image_size,
            images: response.fds,
        })
    }

    pub fn destroy_swapchain(&mut self, index: u32) -> Result<(), ClientError> {
        self.call_empty(
            Opcode::DestroySwapchain,
            bytemuck::bytes_of(&SwapchainArgs { index }),
        )
    }

    pub fn acquire_image(&mut self, index: u32) -> Result<u32, ClientError> {
        let result: ImageResult =
            self.call_record(Opcode::AcquireImage, bytemuck::bytes_of(&SwapchainArgs { index }))?;
        Ok(result.image_index)
    }

    pub fn wait_image(
        &mut self,
        index: u32,
        image_index: u32,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let args = WaitImageArgs {
            index,
            image_index,
            timeout_ns: timeout.as_nanos().min(u64::MAX as u128) as u64,
        };
        self.call_empty(Opcode::WaitImage, bytemuck::bytes_of(&args))
    }

    pub fn release_image(&mut self, index: u32, image_index: u32) -> Result<(), ClientError> {
        self.call_empty(
            Opcode::ReleaseImage,
            bytemuck::bytes_of(&ImageArgs { index, image_index }),
        )
    }

    /// Ids of every connected session
    pub fn get_clients(&mut self) -> Result<Vec<u32>, ClientError> {
        let response = self.call(Opcode::GetClients, &[])?;
        let (count, ids) = decode_prefix::<CountResult>(&response.payload).map_err(protocol)?;
        decode_array(ids, count.count as usize).map_err(protocol)
    }

    pub fn get_client_info(&mut self, session_id: u32) -> Result<RemoteClient, ClientError> {
        let result: ClientInfoResult = self.call_record(
            Opcode::GetClientInfo,
            bytemuck::bytes_of(&SessionArgs { session_id }),
        )?;
        Ok(RemoteClient {
            pid: result.pid,
            name: decode_name(&result.name),
            flags: ClientFlags::from_bits_truncate(result.flags),
        })
    }

    pub fn set_active_client(&mut self, session_id: u32) -> Result<(), ClientError> {
        self.call_empty(
            Opcode::SetActiveClient,
            bytemuck::bytes_of(&SessionArgs { session_id }),
        )
    }
}
