//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.
//! The upstream credential is the one exception: it is filled in from the
//! environment by the loader and is never read from or written to a file.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the credential-hiding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Upstream API endpoints and credential placement.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// WebSocket tunnel limits.
    pub tunnel: TunnelConfig,

    /// Admission control (per-client rate limiting).
    pub rate_limit: RateLimitConfig,

    /// Request limits.
    pub security: SecurityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Secret sent upstream. `None` runs the proxy in disabled mode.
    #[serde(skip)]
    pub credential: Option<Credential>,
}

/// The upstream API secret.
///
/// Cheap to clone and shared read-only by every session. `Debug` never prints
/// the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// The raw secret, for placing into an outbound request.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Where proxied traffic goes and how the credential travels with it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL for REST calls.
    pub http_base: String,

    /// Base URL for WebSocket tunnels.
    pub ws_base: String,

    /// Path prefix under which clients address the proxy (no trailing slash).
    pub path_prefix: String,

    /// Header carrying the credential on HTTP requests.
    pub credential_header: String,

    /// Query parameter carrying the credential on WebSocket handshakes.
    pub credential_query_param: String,

    /// Environment variables consulted for the credential, first non-empty wins.
    pub credential_env: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            http_base: "https://generativelanguage.googleapis.com".to_string(),
            ws_base: "wss://generativelanguage.googleapis.com".to_string(),
            path_prefix: "/api-proxy".to_string(),
            credential_header: "x-goog-api-key".to_string(),
            credential_query_param: "key".to_string(),
            credential_env: vec!["GEMINI_API_KEY".to_string(), "API_KEY".to_string()],
        }
    }
}

/// Timeout configuration for upstream calls and shutdown.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed for upstream response headers in seconds. 0 disables.
    /// Streaming bodies are not bounded by this.
    pub response_secs: u64,

    /// How long shutdown waits for live connections to drain.
    pub shutdown_grace_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn response(&self) -> Option<Duration> {
        (self.response_secs > 0).then(|| Duration::from_secs(self.response_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            response_secs: 300,
            shutdown_grace_secs: 10,
        }
    }
}

/// WebSocket tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Upper bound on the upstream WebSocket handshake, in seconds.
    pub connect_timeout_secs: u64,

    /// Client frames that may wait for the upstream handshake.
    pub max_pending_frames: usize,

    /// Total payload bytes that may wait for the upstream handshake.
    pub max_pending_bytes: usize,

    /// Time allowed to flush the final close frames, in milliseconds.
    pub close_grace_ms: u64,
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_pending_frames: 1024,
            max_pending_bytes: 16 * 1024 * 1024,
            close_grace_ms: 1000,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Length of one counting window in seconds.
    pub window_secs: u64,

    /// Requests allowed per client within one window.
    pub max_requests: u32,

    /// Body of the 429 response.
    pub message: String,

    /// Number of trusted reverse proxies in front of this one. When non-zero the
    /// client address is taken from `X-Forwarded-For`.
    pub trusted_proxy_hops: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 15 * 60,
            max_requests: 100,
            message: "Too many requests from this IP, please try again after 15 minutes"
                .to_string(),
            trusted_proxy_hops: 1,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum inbound request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 50 * 1024 * 1024, // 50MB
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
