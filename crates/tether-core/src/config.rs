//! Peer Configuration
//!
//! Minimal peer configuration: the identity to request from the broker, the
//! broker credential, how chatty the broker library should be, and the
//! deadline for a data channel to open.
//!
//! Configuration can be assembled with builder methods or loaded from TOML:
//!
//! ```toml
//! id = "alice"
//! key = "znaqnunoxaqt1emi"
//! debug = "warnings"
//! connect_timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{Result, TetherError};
use crate::identifiers::PeerId;

/// Deadline for a session to leave the connecting state
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Diagnostic verbosity requested from the broker library
///
/// Mirrors the 0..=3 verbosity scale common to browser signaling libraries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    /// No diagnostics
    None,
    /// Errors only
    #[default]
    Errors,
    /// Errors and warnings
    Warnings,
    /// Everything
    All,
}

impl DebugLevel {
    /// Map a numeric verbosity (0..=3) onto a level; larger values saturate
    pub fn from_verbosity(level: u8) -> Self {
        match level {
            0 => Self::None,
            1 => Self::Errors,
            2 => Self::Warnings,
            _ => Self::All,
        }
    }

    /// Numeric verbosity of this level
    pub fn verbosity(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Errors => 1,
            Self::Warnings => 2,
            Self::All => 3,
        }
    }

    /// `tracing` filter directive equivalent to this level
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Errors => "error",
            Self::Warnings => "warn",
            Self::All => "debug",
        }
    }
}

/// Local peer configuration handed to the broker at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Identity to request; the broker assigns one when absent
    pub id: Option<PeerId>,

    /// Broker API key or credential
    pub key: Option<String>,

    /// Broker library verbosity
    pub debug: DebugLevel,

    /// Deadline for a session to open
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            key: None,
            debug: DebugLevel::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl PeerConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a specific identity from the broker
    pub fn with_id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the broker credential
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the broker library verbosity
    pub fn with_debug(mut self, debug: DebugLevel) -> Self {
        self.debug = debug;
        self
    }

    /// Override the session open deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Parse configuration from a TOML document and validate it
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(TetherError::config(
                "connect_timeout must be greater than 0",
            ));
        }

        if matches!(&self.key, Some(key) if key.trim().is_empty()) {
            return Err(TetherError::config("key must not be blank when set"));
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
