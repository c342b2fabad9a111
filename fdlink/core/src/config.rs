//! Transceiver Configuration
//!
//! Limits for descriptor transfer and where the daemon socket lives.
//! Values come from defaults, a TOML file, or `FDLINK_*` environment
//! variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conn::ancillary::MAX_FDS_PER_WRITE;

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// File that was requested
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Descriptor transfer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransceiverConfig {
    /// Descriptors carried by one write
    ///
    /// Values above 64 are clamped to 64; 0 is rejected.
    pub max_fds_per_write: usize,

    /// Received descriptors cached per connection before the oldest is evicted
    pub max_cached_fds: usize,

    /// Daemon socket path (None = use default)
    ///
    /// Default: $XDG_RUNTIME_DIR/fdlink/fdlink.sock
    /// Fallback: /tmp/fdlink-$UID/fdlink.sock
    pub socket_path: Option<PathBuf>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            max_fds_per_write: MAX_FDS_PER_WRITE,
            max_cached_fds: 1024,
            socket_path: None,
            connect_timeout_ms: 5000,
        }
    }
}

impl TransceiverConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `FDLINK_MAX_FDS_PER_WRITE`: Descriptors per write (1-64)
    /// - `FDLINK_MAX_CACHED_FDS`: Cache bound per connection
    /// - `FDLINK_SOCKET`: Path to the daemon socket
    /// - `FDLINK_CONNECT_TIMEOUT`: Connection timeout in ms
    ///
    /// Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_fds_per_write: std::env::var("FDLINK_MAX_FDS_PER_WRITE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_fds_per_write)
                .min(MAX_FDS_PER_WRITE),
            max_cached_fds: std::env::var("FDLINK_MAX_CACHED_FDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_cached_fds),
            socket_path: std::env::var("FDLINK_SOCKET").ok().map(PathBuf::from),
            connect_timeout_ms: std::env::var("FDLINK_CONNECT_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
        }
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validated()
    }

    /// Read, parse, and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Reject zero limits and clamp the batch size
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if either limit is zero.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.max_fds_per_write == 0 {
            return Err(ConfigError::Invalid(
                "max_fds_per_write must be at least 1".into(),
            ));
        }
        if self.max_cached_fds == 0 {
            return Err(ConfigError::Invalid(
                "max_cached_fds must be at least 1".into(),
            ));
        }
        if self.max_fds_per_write > MAX_FDS_PER_WRITE {
            tracing::warn!(
                requested = self.max_fds_per_write,
                max = MAX_FDS_PER_WRITE,
                "Clamping max_fds_per_write"
            );
            self.max_fds_per_write = MAX_FDS_PER_WRITE;
        }
        Ok(self)
    }

    /// Batch size actually used by a connection
    #[must_use]
    pub fn fds_per_write(&self) -> usize {
        self.max_fds_per_write.clamp(1, MAX_FDS_PER_WRITE)
    }

    /// Configured socket path, or the default
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }
}

/// Get the default daemon socket path
///
/// Uses the XDG runtime directory if available, otherwise /tmp/fdlink-$UID/
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("fdlink").join("fdlink.sock"),
        None => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/fdlink-{uid}/fdlink.sock"))
        }
    }
}
