//! Tunnel session state machine.
//!
//! # States
//! - UpstreamConnecting: client open, upstream handshake in flight
//! - Open: both sides open, frames flow directly
//! - Closing: one side is done, the other has not been told yet
//! - Closed: both sides done or told to close
//!
//! # State Transitions
//! ```text
//! UpstreamConnecting → Open: upstream handshake completes while client is open
//! UpstreamConnecting → Closing/Closed: client closes, errors or overflows the queue
//! Open → Closing → Closed: either side closes or errors, close propagated
//! ```
//!
//! The session performs no IO. The relay feeds it events and acts on what it
//! returns, which keeps every transition testable without sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tunnel::frame::Frame;

static TUNNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a tunnel, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(u64);

impl TunnelId {
    pub fn new() -> Self {
        Self(TUNNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tunnel-{}", self.0)
    }
}

/// Lifecycle of a tunnel as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    UpstreamConnecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle of the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Connecting,
    Open,
    Done,
}

/// Bounds on frames buffered while the upstream handshake is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_frames: usize,
    pub max_bytes: usize,
}

/// What to do with a frame the client just sent.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrameAction {
    /// Upstream is open: send it now.
    Forward(Frame),
    /// Buffered until the upstream handshake completes.
    Queued,
    /// Upstream is gone; the frame is discarded.
    Dropped,
    /// The pending queue is full; the session must fail.
    Overflow,
}

/// FIFO of client frames waiting for the upstream handshake.
#[derive(Debug)]
pub struct PendingQueue {
    frames: VecDeque<Frame>,
    bytes: usize,
    limits: QueueLimits,
}

impl PendingQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    /// Append a frame, refusing it if either limit would be exceeded.
    pub fn push(&mut self, frame: Frame) -> Result<(), Frame> {
        if self.frames.len() >= self.limits.max_frames
            || self.bytes + frame.len() > self.limits.max_bytes
        {
            return Err(frame);
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.len();
        Some(frame)
    }

    /// Put back a frame that could not be delivered. Limits are not applied:
    /// the frame was already accounted for once.
    pub fn push_front(&mut self, frame: Frame) {
        self.bytes += frame.len();
        self.frames.push_front(frame);
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        self.bytes = 0;
        dropped
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// State of one client↔upstream pairing.
#[derive(Debug)]
pub struct TunnelSession {
    state: TunnelState,
    client_open: bool,
    upstream: UpstreamPhase,
    pending: PendingQueue,
}

impl TunnelSession {
    /// A new session: client already upgraded, upstream connecting.
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            state: TunnelState::UpstreamConnecting,
            client_open: true,
            upstream: UpstreamPhase::Connecting,
            pending: PendingQueue::new(limits),
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TunnelState::Closed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn on_client_frame(&mut self, frame: Frame) -> ClientFrameAction {
        if !self.client_open {
            return ClientFrameAction::Dropped;
        }
        match self.upstream {
            UpstreamPhase::Open => ClientFrameAction::Forward(frame),
            UpstreamPhase::Connecting => match self.pending.push(frame) {
                Ok(()) => ClientFrameAction::Queued,
                Err(_) => ClientFrameAction::Overflow,
            },
            UpstreamPhase::Done => ClientFrameAction::Dropped,
        }
    }

    /// Record a completed upstream handshake. Returns `false` when the session
    /// no longer wants the upstream socket (the client is already gone).
    pub fn upstream_opened(&mut self) -> bool {
        if self.upstream != UpstreamPhase::Connecting || !self.client_open {
            return false;
        }
        self.upstream = UpstreamPhase::Open;
        self.refresh();
        true
    }

    /// Next queued frame to flush, oldest first. Yields nothing unless the
    /// upstream is open, so a drain stops as soon as upstream goes away.
    pub fn next_pending(&mut self) -> Option<Frame> {
        if self.upstream != UpstreamPhase::Open {
            return None;
        }
        self.pending.pop_front()
    }

    /// Return an undelivered frame to the head of the queue.
    pub fn requeue_front(&mut self, frame: Frame) {
        self.pending.push_front(frame);
    }

    /// Mark the client side done. Returns whether it was open before, i.e.
    /// whether the client still needs to be told to close.
    pub fn close_client(&mut self) -> bool {
        let was_open = self.client_open;
        self.client_open = false;
        self.refresh();
        was_open
    }

    /// Mark the upstream side done, returning the phase it was in.
    pub fn close_upstream(&mut self) -> UpstreamPhase {
        let previous = self.upstream;
        self.upstream = UpstreamPhase::Done;
        self.refresh();
        previous
    }

    /// Drop everything still waiting for upstream, returning how many frames.
    pub fn discard_pending(&mut self) -> usize {
        self.pending.clear()
    }

    fn refresh(&mut self) {
        self.state = match (self.client_open, self.upstream) {
            (false, UpstreamPhase::Done) => TunnelState::Closed,
            (false, _) | (true, UpstreamPhase::Done) => TunnelState::Closing,
            (true, UpstreamPhase::Open) => TunnelState::Open,
            (true, UpstreamPhase::Connecting) => TunnelState::UpstreamConnecting,
        };
    }
}
