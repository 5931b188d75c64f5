//! Configuration validation.
//!
//! Serde handles syntax; this module checks that the values make sense
//! together. Validation is a pure function that reports every problem at once
//! instead of stopping at the first.

use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    MaxConnections,

    #[error("upstream.path_prefix {0:?} must start with '/', must not end with '/' and must not be '/'")]
    PathPrefix(String),

    #[error("upstream.{field} {value:?} must be a URL with scheme {expected}")]
    UpstreamUrl {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("upstream.credential_header {0:?} is not a valid header name")]
    CredentialHeader(String),

    #[error("upstream.credential_query_param must not be empty")]
    CredentialParam,

    #[error("credential contains characters that cannot be sent in a header")]
    CredentialValue,

    #[error("tunnel.{0} must be greater than zero")]
    TunnelLimit(&'static str),

    #[error("rate_limit.{0} must be greater than zero when rate limiting is enabled")]
    RateLimit(&'static str),

    #[error("security.max_body_bytes must be greater than zero")]
    BodyLimit,

    #[error("timeouts.{0} must be greater than zero")]
    Timeout(&'static str),
}

/// Check a configuration, returning every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::MaxConnections);
    }

    let upstream = &config.upstream;
    let prefix = upstream.path_prefix.as_str();
    if !prefix.starts_with('/') || prefix.ends_with('/') {
        errors.push(ValidationError::PathPrefix(prefix.to_string()));
    }

    check_url(&mut errors, "http_base", &upstream.http_base, &["http", "https"], "http(s)");
    check_url(&mut errors, "ws_base", &upstream.ws_base, &["ws", "wss"], "ws(s)");

    if HeaderName::from_bytes(upstream.credential_header.as_bytes()).is_err() {
        errors.push(ValidationError::CredentialHeader(upstream.credential_header.clone()));
    }
    if upstream.credential_query_param.is_empty() {
        errors.push(ValidationError::CredentialParam);
    }
    if let Some(credential) = &config.credential {
        if HeaderValue::from_str(credential.expose()).is_err() {
            errors.push(ValidationError::CredentialValue);
        }
    }

    if config.tunnel.max_pending_frames == 0 {
        errors.push(ValidationError::TunnelLimit("max_pending_frames"));
    }
    if config.tunnel.max_pending_bytes == 0 {
        errors.push(ValidationError::TunnelLimit("max_pending_bytes"));
    }
    if config.tunnel.connect_timeout_secs == 0 {
        errors.push(ValidationError::TunnelLimit("connect_timeout_secs"));
    }

    if config.rate_limit.enabled {
        if config.rate_limit.window_secs == 0 {
            errors.push(ValidationError::RateLimit("window_secs"));
        }
        if config.rate_limit.max_requests == 0 {
            errors.push(ValidationError::RateLimit("max_requests"));
        }
    }

    if config.security.max_body_bytes == 0 {
        errors.push(ValidationError::BodyLimit);
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::Timeout("connect_secs"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(
    errors: &mut Vec<ValidationError>,
    field: &'static str,
    value: &str,
    schemes: &[&str],
    expected: &'static str,
) {
    let valid = Url::parse(value)
        .map(|url| schemes.contains(&url.scheme()) && url.has_host())
        .unwrap_or(false);
    if !valid {
        errors.push(ValidationError::UpstreamUrl {
            field,
            value: value.to_string(),
            expected,
        });
    }
}
