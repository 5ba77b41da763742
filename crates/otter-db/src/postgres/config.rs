//! PostgreSQL connection configuration

use crate::error::{DbError, DbResult};
use crate::handle::LogLevel;
use std::time::Duration;

pub const DEFAULT_MAX_IDLE_CONNS: usize = 10;
pub const DEFAULT_MAX_OPEN_CONNS: usize = 100;
pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(200);
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// SSL mode for PostgreSQL connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }

    /// libpq spelling; `verify-ca` and `verify-full` require TLS
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disable" => Some(SslMode::Disable),
            "allow" | "prefer" => Some(SslMode::Prefer),
            "require" | "verify-ca" | "verify-full" => Some(SslMode::Require),
            _ => None,
        }
    }
}

/// PostgreSQL connection and pool options.
///
/// Zero or empty fields mean "use the default"; see
/// [`with_defaults`](PostgresConfig::with_defaults).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostgresConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub port: u16,
    pub ssl_mode: Option<SslMode>,
    pub timezone: String,
    pub max_idle_conns: usize,
    pub max_open_conns: usize,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
    /// Map SQLSTATE codes onto typed errors (unique / foreign key violations)
    pub translate_errors: bool,
    pub log_level: Option<LogLevel>,
    pub slow_threshold: Duration,
    pub application_name: Option<String>,
}

impl PostgresConfig {
    /// Parse a PostgreSQL connection URL
    pub fn from_url(url: &str) -> DbResult<Self> {
        let url = url::Url::parse(url).map_err(|e| DbError::InvalidUrl(e.to_string()))?;

        if url.scheme() != "postgres" && url.scheme() != "postgresql" {
            return Err(DbError::InvalidUrl(format!(
                "Expected postgres:// or postgresql:// scheme, got {}://",
                url.scheme()
            )));
        }

        let mut config = Self {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            name: url.path().trim_start_matches('/').to_string(),
            user: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            ..Self::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    config.ssl_mode = Some(SslMode::parse(&value).ok_or_else(|| {
                        DbError::InvalidUrl(format!("unknown sslmode: {}", value))
                    })?);
                }
                "pool_max_conns" | "max" => {
                    config.max_open_conns = value.parse().map_err(|_| {
                        DbError::InvalidUrl(format!("invalid pool size: {}", value))
                    })?;
                }
                "application_name" => {
                    config.application_name = Some(value.to_string());
                }
                "timezone" | "TimeZone" => {
                    config.timezone = value.to_string();
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> DbResult<()> {
        let missing = if self.host.is_empty() {
            "host is required"
        } else if self.user.is_empty() {
            "user is required"
        } else if self.name.is_empty() {
            "database name is required"
        } else if self.port == 0 {
            "port is required"
        } else {
            return Ok(());
        };
        Err(DbError::configuration(format!(
            "invalid configuration: {}",
            missing
        )))
    }

    /// Fill every unset field with its default
    pub fn with_defaults(mut self) -> Self {
        if self.ssl_mode.is_none() {
            self.ssl_mode = Some(SslMode::Disable);
        }
        if self.timezone.is_empty() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
        if self.max_idle_conns == 0 {
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        if self.max_open_conns == 0 {
            self.max_open_conns = DEFAULT_MAX_OPEN_CONNS;
        }
        if self.conn_max_lifetime.is_zero() {
            self.conn_max_lifetime = DEFAULT_CONN_MAX_LIFETIME;
        }
        if self.conn_max_idle_time.is_zero() {
            self.conn_max_idle_time = DEFAULT_CONN_MAX_IDLE_TIME;
        }
        if self.log_level.is_none() {
            self.log_level = Some(LogLevel::Info);
        }
        if self.slow_threshold.is_zero() {
            self.slow_threshold = DEFAULT_SLOW_THRESHOLD;
        }
        self
    }

    /// libpq keyword/value connection string
    pub fn dsn(&self) -> String {
        let ssl = self.ssl_mode.unwrap_or_default();
        let tz = if self.timezone.is_empty() {
            DEFAULT_TIMEZONE
        } else {
            &self.timezone
        };
        format!(
            "host={} user={} password={} dbname={} port={} sslmode={} TimeZone={}",
            self.host,
            self.user,
            self.password,
            self.name,
            self.port,
            ssl.as_str(),
            tz
        )
    }
}
