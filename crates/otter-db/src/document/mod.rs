//! Document store (MongoDB) configuration and client
//!
//! The configuration types are always available so services can load and
//! validate settings without linking the driver. The client itself needs the
//! `mongo` feature.

#[cfg(feature = "mongo")]
mod client;

#[cfg(feature = "mongo")]
pub use client::DocumentClient;

use crate::error::{DbError, DbResult};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_POOL_SIZE: u32 = 100;
pub const DEFAULT_MIN_POOL_SIZE: u32 = 5;
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_CONNECTING: u32 = 10;

/// Which replica set members serve reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    Secondary,
    PrimaryPreferred,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

impl FromStr for ReadPreferenceMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(ReadPreferenceMode::Primary),
            "secondary" => Ok(ReadPreferenceMode::Secondary),
            "primaryPreferred" => Ok(ReadPreferenceMode::PrimaryPreferred),
            "secondaryPreferred" => Ok(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Ok(ReadPreferenceMode::Nearest),
            other => Err(DbError::configuration(format!(
                "invalid read preference: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ReadPreferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document store connection options. Zero or empty fields mean "use the
/// default"; the read preference is kept as text so that an unknown mode
/// surfaces as a configuration error at connect time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentConfig {
    pub uri: String,
    pub database: String,
    pub timeout: Duration,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub max_idle_time: Duration,
    pub max_connecting: u32,
    pub read_preference: String,
    pub retry_writes: bool,
    pub retry_reads: bool,
}

impl DocumentConfig {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        let missing = if self.uri.is_empty() {
            "URI is required"
        } else if self.database.is_empty() {
            "database name is required"
        } else {
            return Ok(());
        };
        Err(DbError::configuration(format!(
            "invalid configuration: {}",
            missing
        )))
    }

    pub fn with_defaults(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.max_pool_size == 0 {
            self.max_pool_size = DEFAULT_MAX_POOL_SIZE;
        }
        if self.min_pool_size == 0 {
            self.min_pool_size = DEFAULT_MIN_POOL_SIZE;
        }
        if self.max_idle_time.is_zero() {
            self.max_idle_time = DEFAULT_MAX_IDLE_TIME;
        }
        if self.max_connecting == 0 {
            self.max_connecting = DEFAULT_MAX_CONNECTING;
        }
        if self.read_preference.is_empty() {
            self.read_preference = ReadPreferenceMode::Primary.as_str().to_string();
        }
        self
    }

    /// Configured timeout, or the default when unset
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Parsed read preference; empty means primary
    pub fn read_preference_mode(&self) -> DbResult<ReadPreferenceMode> {
        if self.read_preference.is_empty() {
            return Ok(ReadPreferenceMode::Primary);
        }
        self.read_preference.parse()
    }
}
