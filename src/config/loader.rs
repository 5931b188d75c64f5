//! Configuration loading from disk and the process environment.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::{Credential, ProxyConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load configuration from an optional TOML file, overlay the environment and
/// validate the result.
pub fn load_config(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ProxyConfig::default(),
    };

    apply_env(&mut config, |name| std::env::var(name).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay environment-provided values: `PORT` and the credential.
///
/// `lookup` abstracts the environment so callers can supply their own source.
pub fn apply_env<F>(config: &mut ProxyConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
        config.listener.bind_address = match config.listener.bind_address.parse::<SocketAddr>() {
            Ok(mut addr) => {
                addr.set_port(port);
                addr.to_string()
            }
            Err(_) => format!("0.0.0.0:{}", port),
        };
    }

    config.credential = config
        .upstream
        .credential_env
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .map(Credential::new);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn first_non_empty_credential_wins() {
        let mut config = ProxyConfig::default();
        apply_env(&mut config, env(&[("GEMINI_API_KEY", ""), ("API_KEY", "fallback")]));
        assert_eq!(config.credential, Some(Credential::new("fallback")));

        apply_env(&mut config, env(&[("GEMINI_API_KEY", "primary"), ("API_KEY", "fallback")]));
        assert_eq!(config.credential, Some(Credential::new("primary")));
    }

    #[test]
    fn missing_credential_is_not_an_error() {
        let mut config = ProxyConfig::default();
        apply_env(&mut config, env(&[]));
        assert!(config.credential.is_none());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn port_replaces_bind_port() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "127.0.0.1:3000".to_string();
        apply_env(&mut config, env(&[("PORT", "8088")]));
        assert_eq!(config.listener.bind_address, "127.0.0.1:8088");
    }

    #[test]
    fn invalid_port_is_ignored() {
        let mut config = ProxyConfig::default();
        apply_env(&mut config, env(&[("PORT", "eighty")]));
        assert_eq!(config.listener.bind_address, "0.0.0.0:3000");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Some(Path::new("/nonexistent/proxy.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
