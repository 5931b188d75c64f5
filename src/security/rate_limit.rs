//! Admission control: per-client fixed-window rate limiting.
//!
//! # Responsibilities
//! - Decide allow/deny per client address and request time
//! - Report quota on every proxied response (`RateLimit-*` headers)
//! - Evict expired windows in the background
//!
//! # Design Decisions
//! - Applied as a route layer, so only proxy routes consume quota
//! - Both HTTP requests and WebSocket upgrades pass through the same gate
//! - Window state lives in a sharded `DashMap`; no global lock

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::config::RateLimitConfig;
use crate::observability::metrics;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        limit: u32,
        remaining: u32,
        reset: Duration,
    },
    Denied {
        limit: u32,
        retry_after: Duration,
    },
    /// No limit applies.
    Unlimited,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied { .. })
    }
}

/// The gate applied before any proxy logic runs.
pub trait AdmissionControl: Send + Sync {
    fn admit(&self, client: IpAddr, now: Instant) -> Admission;

    /// Drop state that can no longer affect a decision.
    fn sweep(&self, _now: Instant) {}
}

/// Admits everything. Installed when rate limiting is disabled.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AdmissionControl for AllowAll {
    fn admit(&self, _client: IpAddr, _now: Instant) -> Admission {
        Admission::Unlimited
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per client in consecutive fixed windows.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    windows: DashMap<IpAddr, Window>,
    window: Duration,
    max_requests: u32,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    /// Number of clients with a live window.
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

impl AdmissionControl for FixedWindowLimiter {
    fn admit(&self, client: IpAddr, now: Instant) -> Admission {
        let mut entry = self.windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let reset = self
            .window
            .saturating_sub(now.saturating_duration_since(entry.started));
        if entry.count >= self.max_requests {
            return Admission::Denied {
                limit: self.max_requests,
                retry_after: reset,
            };
        }
        entry.count += 1;
        Admission::Allowed {
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset,
        }
    }

    fn sweep(&self, now: Instant) {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.windows.len(), "Swept rate limit windows");
        }
    }
}

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    pub control: Arc<dyn AdmissionControl>,
    pub message: Arc<str>,
    pub trusted_proxy_hops: usize,
}

impl AdmissionState {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let control: Arc<dyn AdmissionControl> = if config.enabled {
            Arc::new(FixedWindowLimiter::new(config.window(), config.max_requests))
        } else {
            Arc::new(AllowAll)
        };
        Self {
            control,
            message: Arc::from(config.message.as_str()),
            trusted_proxy_hops: config.trusted_proxy_hops,
        }
    }

    /// Periodically evict expired windows until shutdown.
    pub fn spawn_sweeper(
        &self,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let control = Arc::clone(&self.control);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => control.sweep(Instant::now()),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

/// Client identity for admission: the peer address, or the address `hops`
/// positions from the right of `X-Forwarded-For` when behind trusted proxies.
pub fn client_ip(headers: &HeaderMap, peer: IpAddr, hops: usize) -> IpAddr {
    if hops == 0 {
        return peer;
    }
    let forwarded: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    forwarded
        .len()
        .checked_sub(hops)
        .and_then(|i| forwarded[i].parse().ok())
        .unwrap_or(peer)
}

pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = client_ip(request.headers(), peer.ip(), state.trusted_proxy_hops);

    match state.control.admit(client, Instant::now()) {
        Admission::Unlimited => next.run(request).await,
        Admission::Allowed {
            limit,
            remaining,
            reset,
        } => {
            let mut response = next.run(request).await;
            insert_quota_headers(response.headers_mut(), limit, remaining, reset);
            response
        }
        Admission::Denied { limit, retry_after } => {
            tracing::warn!(client = %client, "Rate limit exceeded");
            metrics::record_rate_limited();
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, state.message.to_string()).into_response();
            let headers = response.headers_mut();
            insert_quota_headers(headers, limit, 0, retry_after);
            headers.insert(axum::http::header::RETRY_AFTER, secs_header(retry_after));
            response
        }
    }
}

fn insert_quota_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: Duration) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATELIMIT_RESET, secs_header(reset));
}

/// Whole seconds, rounded up so a client never retries early.
fn secs_header(duration: Duration) -> HeaderValue {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    HeaderValue::from(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn fixed_window_denies_after_limit_then_resets() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();

        assert!(matches!(
            limiter.admit(ip(1), t0),
            Admission::Allowed { remaining: 1, .. }
        ));
        assert!(matches!(
            limiter.admit(ip(1), t0),
            Admission::Allowed { remaining: 0, .. }
        ));
        assert!(!limiter.admit(ip(1), t0 + Duration::from_secs(1)).is_allowed());
        assert!(limiter.admit(ip(2), t0).is_allowed(), "clients are independent");

        assert!(limiter.admit(ip(1), t0 + Duration::from_secs(60)).is_allowed());
    }

    #[test]
    fn denial_reports_time_left_in_window() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        limiter.admit(ip(1), t0);
        match limiter.admit(ip(1), t0 + Duration::from_secs(45)) {
            Admission::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(15))
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn sweep_evicts_only_expired_windows() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(10), 5);
        let t0 = Instant::now();
        limiter.admit(ip(1), t0);
        limiter.admit(ip(2), t0 + Duration::from_secs(8));

        limiter.sweep(t0 + Duration::from_secs(12));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn client_ip_uses_trusted_hops() {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 198.51.100.2"),
        );
        let peer = ip(9);

        assert_eq!(client_ip(&headers, peer, 0), peer);
        assert_eq!(client_ip(&headers, peer, 1), "198.51.100.2".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&headers, peer, 2), "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&headers, peer, 3), peer, "too few hops falls back");
    }

    #[test]
    fn client_ip_ignores_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, ip(3), 1), ip(3));
        assert_eq!(client_ip(&HeaderMap::new(), ip(3), 1), ip(3));
    }

    #[test]
    fn allow_all_never_denies() {
        let t0 = Instant::now();
        for _ in 0..1000 {
            assert_eq!(AllowAll.admit(ip(1), t0), Admission::Unlimited);
        }
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(secs_header(Duration::from_millis(1500)), HeaderValue::from(2u64));
        assert_eq!(secs_header(Duration::from_secs(3)), HeaderValue::from(3u64));
    }
}
