//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming proxy request (HTTP or WebSocket upgrade):
//!     → rate_limit.rs (per-client admission)
//!     → Pass to the HTTP relay or tunnel manager
//! ```
//!
//! Request body size is capped by tower-http's `RequestBodyLimitLayer` in
//! the server's layer stack.

pub mod rate_limit;

pub use rate_limit::{
    admission_middleware, client_ip, Admission, AdmissionControl, AdmissionState, AllowAll,
    FixedWindowLimiter,
};
