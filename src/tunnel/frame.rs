//! Transport-neutral frames exchanged by the frame relay.
//!
//! The client socket (axum) and the upstream socket (tokio-tungstenite) each
//! get adapted into a [`FrameSink`] / [`FrameStream`] pair so the relay never
//! sees either library's message type. Tests plug in in-memory pairs instead.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{future::BoxFuture, Sink, Stream};

use crate::error::TunnelError;

/// Close code sent to a peer when the other side failed.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close code sent to the client when its pending frames overflow.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// One relayed WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload size in bytes.
    pub(crate) fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }
}

/// Code and reason of a close handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Sent to the client when the upstream side fails.
    pub fn upstream_error() -> Self {
        Self::new(CLOSE_INTERNAL_ERROR, "Upstream WebSocket error")
    }

    /// Sent upstream when the client side fails.
    pub fn client_error() -> Self {
        Self::new(CLOSE_INTERNAL_ERROR, "Client WebSocket error")
    }

    pub fn pending_overflow() -> Self {
        Self::new(CLOSE_POLICY_VIOLATION, "Pending frame limit exceeded")
    }
}

/// What a socket reader produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// Close handshake received, or the stream ended (`None`: no code).
    Close(Option<CloseInfo>),
    Error(String),
}

/// What the relay writes to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close(Option<CloseInfo>),
}

pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = TunnelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

/// Resolves once the upstream socket is connected, or failed to connect.
pub type UpstreamConnector = BoxFuture<'static, Result<(FrameSink, FrameStream), TunnelError>>;
