//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection pool.
///
/// # Example
///
/// ```rust
/// use docdb_driver_pool::PoolOptions;
/// use std::time::Duration;
///
/// let options = PoolOptions::new()
///     .max_pool_size(20)
///     .min_pool_size(2)
///     .wait_queue_timeout(Duration::from_secs(5));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    /// Maximum number of live connections (ready + in use + establishing).
    pub max_pool_size: usize,

    /// Number of connections the pool keeps open while Ready.
    pub min_pool_size: usize,

    /// Maximum number of concurrent connection establishments.
    pub max_connecting: usize,

    /// How long a checkout may wait before failing with a timeout.
    pub wait_queue_timeout: Duration,

    /// Idle time after which a ready connection is reaped. `None` disables reaping.
    pub max_idle_time: Option<Duration>,

    /// Age after which a connection is retired. `None` disables the limit.
    pub max_life_time: Option<Duration>,

    /// Maximum number of requests blocked on capacity. `None` is unbounded.
    pub wait_queue_size: Option<usize>,

    /// Upper bound on a single connection establishment.
    pub connect_timeout: Duration,

    /// Period of the maintenance loop.
    pub maintenance_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            min_pool_size: 0,
            max_connecting: 2,
            wait_queue_timeout: Duration::from_secs(120),
            max_idle_time: None,
            max_life_time: None,
            wait_queue_size: None,
            connect_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl PoolOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the maximum number of concurrent establishments.
    #[must_use]
    pub fn max_connecting(mut self, count: usize) -> Self {
        self.max_connecting = count;
        self
    }

    /// Set the wait queue timeout.
    #[must_use]
    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.wait_queue_timeout = timeout;
        self
    }

    /// Set the maximum idle time of a ready connection.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = Some(idle);
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_life_time(mut self, lifetime: Duration) -> Self {
        self.max_life_time = Some(lifetime);
        self
    }

    /// Cap the number of requests waiting for capacity.
    #[must_use]
    pub fn wait_queue_size(mut self, size: usize) -> Self {
        self.wait_queue_size = Some(size);
        self
    }

    /// Set the connection establishment timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maintenance loop period.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_pool_size == 0 {
            return Err(PoolError::Config("maxPoolSize must be greater than 0".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(PoolError::Config(format!(
                "minPoolSize ({}) cannot exceed maxPoolSize ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.max_connecting == 0 {
            return Err(PoolError::Config("maxConnecting must be greater than 0".into()));
        }
        if self.wait_queue_size == Some(0) {
            return Err(PoolError::Config(
                "waitQueueSize must be greater than 0 when set".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::Config("connectTimeout must be greater than 0".into()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(PoolError::Config(
                "maintenance interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Read pool options from the query part of a connection string.
    ///
    /// Supports URI-style strings:
    /// ```text
    /// docdb://db1:27017,db2:27017/app?maxPoolSize=50&waitQueueTimeoutMS=500
    /// ```
    ///
    /// Only pool options are interpreted; other options are ignored.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, PoolError> {
        let mut options = Self::default();

        let query = match conn_str.split_once('?') {
            Some((_, query)) => query,
            None => return Ok(options),
        };

        let mut wait_queue_multiple = None;

        for part in query.split(['&', ';']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let name = key.trim();
            let key = name.to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "maxpoolsize" => options.max_pool_size = parse_count(name, value)?,
                "minpoolsize" => options.min_pool_size = parse_count(name, value)?,
                "maxconnecting" => options.max_connecting = parse_count(name, value)?,
                "waitqueuesize" => {
                    options.wait_queue_size = Some(parse_count(name, value)?).filter(|n| *n > 0);
                }
                "waitqueuemultiple" => {
                    let multiple: f64 = value.parse().map_err(|_| {
                        PoolError::Config(format!("invalid {name}: {value}"))
                    })?;
                    if !multiple.is_finite() || multiple < 0.0 {
                        return Err(PoolError::Config(format!("invalid {name}: {value}")));
                    }
                    wait_queue_multiple = Some(multiple);
                }
                "waitqueuetimeout" | "waitqueuetimeoutms" => {
                    options.wait_queue_timeout = parse_duration(name, value)?;
                }
                "maxidletime" | "maxidletimems" => {
                    options.max_idle_time =
                        Some(parse_duration(name, value)?).filter(|d| !d.is_zero());
                }
                "maxlifetime" | "maxlifetimems" => {
                    options.max_life_time =
                        Some(parse_duration(name, value)?).filter(|d| !d.is_zero());
                }
                "connecttimeout" | "connecttimeoutms" => {
                    options.connect_timeout = parse_duration(name, value)?;
                }
                _ => {
                    tracing::debug!(
                        key = name,
                        value = value,
                        "ignoring non-pool connection string option"
                    );
                }
            }
        }

        if let Some(multiple) = wait_queue_multiple {
            let size = (multiple * options.max_pool_size as f64).round() as usize;
            options.wait_queue_size = Some(size).filter(|n| *n > 0);
        }

        options.validate()?;
        Ok(options)
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Config(format!("invalid {name}: {value}")))
}

/// Parse a duration option.
///
/// Keys ending in `MS` are milliseconds. Otherwise the value may carry an
/// `ms`, `s`, `m` or `h` suffix; a bare number is seconds.
fn parse_duration(name: &str, value: &str) -> Result<Duration, PoolError> {
    let invalid = || PoolError::Config(format!("invalid {name}: {value}"));

    let lower_name = name.to_ascii_lowercase();
    let lower_value = value.to_ascii_lowercase();

    let (number, millis_per_unit) = if lower_name.ends_with("ms") {
        (lower_value.as_str(), 1u64)
    } else if let Some(number) = lower_value.strip_suffix("ms") {
        (number, 1)
    } else if let Some(number) = lower_value.strip_suffix('s') {
        (number, 1_000)
    } else if let Some(number) = lower_value.strip_suffix('m') {
        (number, 60_000)
    } else if let Some(number) = lower_value.strip_suffix('h') {
        (number, 3_600_000)
    } else {
        (lower_value.as_str(), 1_000)
    };

    let number: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }

    Ok(Duration::from_millis((number * millis_per_unit as f64).round() as u64))
}
