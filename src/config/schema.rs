//! Configuration schema definitions.
//!
//! This module defines the file-based configuration of a graceful router.
//! All types derive Serde traits for deserialization from TOML.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GracefulConfig {
    /// Listeners to start, in order. Empty means the default `:8080` listener.
    pub listeners: Vec<ListenerConfig>,

    /// Shutdown and per-server timeouts.
    pub timeouts: TimeoutConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// One listener, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListenerConfig {
    /// Plain HTTP on a TCP address (e.g. ":8080", "127.0.0.1:3000").
    Addr { address: String },

    /// HTTPS on a TCP address. Certificate and key are read when serving starts.
    Tls {
        address: String,
        cert_path: PathBuf,
        key_path: PathBuf,
    },

    /// HTTP over a Unix domain socket created at `path`.
    Unix { path: PathBuf },

    /// HTTP on an inherited, already-listening file descriptor.
    Fd { fd: i32 },
}

/// Timeout configuration. Zero means "use the built-in default".
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum time allowed for draining servers on shutdown, in seconds.
    pub shutdown_secs: u64,

    /// Time allowed to receive a whole request, in seconds.
    pub read_secs: u64,

    /// Time allowed for the handler to produce a response, in seconds.
    pub write_secs: u64,

    /// Keep-alive idle timeout, in seconds.
    pub idle_secs: u64,
}

impl TimeoutConfig {
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty output for development, JSON for log shipping.
    pub log_format: LogFormat,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
