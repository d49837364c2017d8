//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listener definitions (non-empty addresses and paths, TLS files named)
//! - Detect two TCP listeners on the same address
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GracefulConfig → Result<(), Vec<ValidationError>>
//! - Files are not opened here; TLS material is read when serving starts

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{GracefulConfig, ListenerConfig};
use crate::net::listener::normalize_addr;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener {index}: address is empty")]
    EmptyAddress { index: usize },

    #[error("listener {index}: TLS listener needs both cert_path and key_path")]
    MissingTlsMaterial { index: usize },

    #[error("listener {index}: unix socket path is empty")]
    EmptySocketPath { index: usize },

    #[error("listener {index}: file descriptor {fd} is negative")]
    NegativeDescriptor { index: usize, fd: i32 },

    #[error("listener {index}: {kind} listeners are only supported on unix")]
    UnsupportedPlatform { index: usize, kind: &'static str },

    #[error("listener {index}: address {address} is already used by another listener")]
    DuplicateAddress { index: usize, address: String },

    #[error("metrics address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),

    #[error("log level {0:?} is not one of trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Check the configuration, collecting every problem found.
pub fn validate_config(config: &GracefulConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (index, listener) in config.listeners.iter().enumerate() {
        match listener {
            ListenerConfig::Addr { address } => {
                check_address(index, address, &mut seen, &mut errors);
            }
            ListenerConfig::Tls {
                address,
                cert_path,
                key_path,
            } => {
                check_address(index, address, &mut seen, &mut errors);
                if cert_path.as_os_str().is_empty() || key_path.as_os_str().is_empty() {
                    errors.push(ValidationError::MissingTlsMaterial { index });
                }
            }
            ListenerConfig::Unix { path } => {
                if !cfg!(unix) {
                    errors.push(ValidationError::UnsupportedPlatform { index, kind: "unix" });
                }
                if path.as_os_str().is_empty() {
                    errors.push(ValidationError::EmptySocketPath { index });
                }
            }
            ListenerConfig::Fd { fd } => {
                if !cfg!(unix) {
                    errors.push(ValidationError::UnsupportedPlatform { index, kind: "fd" });
                }
                if *fd < 0 {
                    errors.push(ValidationError::NegativeDescriptor { index, fd: *fd });
                }
            }
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }
    if !["trace", "debug", "info", "warn", "error"]
        .contains(&observability.log_level.to_ascii_lowercase().as_str())
    {
        errors.push(ValidationError::InvalidLogLevel(observability.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(
    index: usize,
    address: &str,
    seen: &mut HashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    if address.trim().is_empty() {
        errors.push(ValidationError::EmptyAddress { index });
        return;
    }
    let normalized = normalize_addr(address);
    if !seen.insert(normalized.clone()) {
        errors.push(ValidationError::DuplicateAddress {
            index,
            address: normalized,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GracefulConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GracefulConfig::default();
        config.listeners = vec![
            ListenerConfig::Addr {
                address: "".into(),
            },
            ListenerConfig::Addr {
                address: ":9000".into(),
            },
            ListenerConfig::Tls {
                address: "0.0.0.0:9000".into(),
                cert_path: PathBuf::new(),
                key_path: "key.pem".into(),
            },
            ListenerConfig::Fd { fd: -1 },
        ];
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::EmptyAddress { index: 0 }));
        assert!(errors.contains(&ValidationError::DuplicateAddress {
            index: 2,
            address: "0.0.0.0:9000".into()
        }));
        assert!(errors.contains(&ValidationError::MissingTlsMaterial { index: 2 }));
        assert!(errors.contains(&ValidationError::NegativeDescriptor { index: 3, fd: -1 }));
        assert!(errors.contains(&ValidationError::InvalidMetricsAddress(
            "not-an-address".into()
        )));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut config = GracefulConfig::default();
        config.observability.log_level = "loud".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors, vec![ValidationError::InvalidLogLevel("loud".into())]);
    }
}
