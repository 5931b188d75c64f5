//! WebSocket tunnelling.
//!
//! # Data Flow
//! ```text
//! upgraded client socket ──┐
//!                          ├─→ relay.rs (FrameRelay task, owns a TunnelSession)
//! upstream.rs connect ─────┘        ↓
//!                          session.rs (state machine + bounded pending queue)
//! ```
//!
//! `frame.rs` holds the transport-neutral types both sockets are adapted to.

pub mod frame;
pub mod relay;
pub mod session;
pub mod upstream;

pub use frame::{CloseInfo, Frame, FrameSink, FrameStream, Inbound, Outbound, UpstreamConnector};
pub use relay::{FrameRelay, RelaySummary};
pub use session::{QueueLimits, TunnelId, TunnelSession, TunnelState};
