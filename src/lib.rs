//! Credential-hiding API proxy.
//!
//! Forwards HTTP requests and WebSocket connections under a path prefix to an
//! upstream API, attaching a secret the client never sees.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                     API KEY PROXY                    │
//!   Client        │  ┌─────────┐   ┌─────────┐   ┌───────────┐           │
//!   ──────────────┼─▶│   net   │──▶│  http   │──▶│ security  │           │
//!                 │  │listener │   │ server  │   │ admission │           │
//!                 │  └─────────┘   └─────────┘   └─────┬─────┘           │
//!                 │                                    │                 │
//!                 │                   ┌────────────────┴──────┐          │
//!                 │                   ▼                       ▼          │
//!                 │            ┌────────────┐         ┌─────────────┐    │
//!                 │            │ http relay │         │   tunnel    │    │  Upstream
//!                 │            │  (hyper)   │         │ frame relay │────┼──▶ API
//!                 │            └────────────┘         └─────────────┘    │
//!                 │                                                      │
//!                 │  config · lifecycle · observability (cross-cutting)  │
//!                 └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;
pub mod tunnel;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, TunnelError, TunnelRejected};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
