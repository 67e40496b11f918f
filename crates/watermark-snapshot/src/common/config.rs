//! # Read-Only Snapshot Configuration
//!
//! Settings for incremental snapshots over a read-only connection. No
//! watermark rows are written; watermarks are the executed position sets the
//! server reports, which requires MySQL 5.6.5 or later.
//!
//! ```rust,ignore
//! use watermark_snapshot::common::ReadOnlySnapshotConfig;
//!
//! let config = ReadOnlySnapshotConfig::builder()
//!     .connector_name("inventory")
//!     .chunk_size(2048)
//!     .build()?;
//! ```

use crate::common::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for read-only incremental snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlySnapshotConfig {
    /// Logical connector name; signal records keyed with another name are ignored
    pub connector_name: String,

    /// Rows per chunk query (default: 1024)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Capacity of the signal queue (default: 128)
    #[serde(default = "default_signal_channel_capacity")]
    pub signal_channel_capacity: usize,

    /// Pause between signal source polls in milliseconds (default: 500)
    #[serde(default = "default_signal_poll_interval_ms")]
    pub signal_poll_interval_ms: u64,

    /// Oldest server able to report executed position sets
    #[serde(default = "default_min_server_version")]
    pub min_server_version: ServerVersion,
}

fn default_chunk_size() -> usize {
    1024
}

fn default_signal_channel_capacity() -> usize {
    128
}

fn default_signal_poll_interval_ms() -> u64 {
    500
}

fn default_min_server_version() -> ServerVersion {
    ServerVersion::new(5, 6, 5)
}

impl Default for ReadOnlySnapshotConfig {
    fn default() -> Self {
        Self {
            connector_name: "watermark-snapshot".to_string(),
            chunk_size: default_chunk_size(),
            signal_channel_capacity: default_signal_channel_capacity(),
            signal_poll_interval_ms: default_signal_poll_interval_ms(),
            min_server_version: default_min_server_version(),
        }
    }
}

impl ReadOnlySnapshotConfig {
    /// Create a new builder.
    pub fn builder() -> ReadOnlySnapshotConfigBuilder {
        ReadOnlySnapshotConfigBuilder::default()
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connector_name.trim().is_empty() {
            return Err(SnapshotError::config("connector_name must not be empty"));
        }
        if self.chunk_size == 0 {
            return Err(SnapshotError::config("chunk_size must be at least 1"));
        }
        if self.signal_channel_capacity == 0 {
            return Err(SnapshotError::config(
                "signal_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Check that the server reports executed position sets.
    pub fn check_server_version(&self, version: &str) -> Result<()> {
        let actual: ServerVersion = version.parse()?;
        if actual < self.min_server_version {
            return Err(SnapshotError::unsupported_version(
                self.min_server_version.to_string(),
                version,
            ));
        }
        Ok(())
    }
}

/// Builder for ReadOnlySnapshotConfig.
#[derive(Default)]
pub struct ReadOnlySnapshotConfigBuilder {
    config: ReadOnlySnapshotConfig,
}

impl ReadOnlySnapshotConfigBuilder {
    pub fn connector_name(mut self, name: impl Into<String>) -> Self {
        self.config.connector_name = name.into();
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn signal_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.signal_channel_capacity = capacity;
        self
    }

    pub fn signal_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.signal_poll_interval_ms = ms;
        self
    }

    pub fn min_server_version(mut self, version: ServerVersion) -> Self {
        self.config.min_server_version = version;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ReadOnlySnapshotConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// `major.minor.patch` server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServerVersion {
    type Err = SnapshotError;

    /// Parse version strings such as `8.0.34-log` or `5.7`.
    fn from_str(s: &str) -> Result<Self> {
        let numeric = s
            .trim()
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()
            .unwrap_or_default();

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| SnapshotError::config(format!("invalid server version '{}'", s))),
                None if required => Err(SnapshotError::config(format!(
                    "invalid server version '{}'",
                    s
                ))),
                None => Ok(0),
            }
        };

        Ok(Self {
            major: next(true)?,
            minor: next(true)?,
            patch: next(false)?,
        })
    }
}

impl Serialize for ServerVersion {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerVersion {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
