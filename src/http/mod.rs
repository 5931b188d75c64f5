//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper connection, upgrade gate, Axum router)
//!     → security (admission)
//!     → WebSocket upgrade?  → websocket.rs (tunnel manager) → tunnel
//!       otherwise           → relay.rs (HTTP relay)
//!                                → headers.rs (header filter)
//!                                → response.rs (CORS preflight)
//!     → Send to client
//! ```

pub mod headers;
pub mod relay;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use relay::HttpRelay;
pub use request::{ProxyRequestId, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
pub use websocket::TunnelManager;
