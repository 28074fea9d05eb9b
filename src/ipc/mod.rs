//! IPC transport and protocol

pub mod channel;
pub mod client;
pub mod protocol;

pub use channel::{ChannelCloser, Frame, MessageChannel};
pub use client::{ClientError, Connection};
