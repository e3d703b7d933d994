//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::address::ServerAddress;
use crate::event::CheckOutFailedReason;

/// Errors returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Establishing a connection failed (network or handshake error).
    #[error("error connecting to {address}: {source}")]
    Connection {
        /// Server the pool belongs to.
        address: ServerAddress,
        /// Underlying establishment failure.
        #[source]
        source: ConnectError,
    },

    /// The pool was cleared while the request was waiting.
    #[error("connection pool for {address} was cleared (generation {generation}) while waiting for a connection")]
    PoolCleared {
        /// Server the pool belongs to.
        address: ServerAddress,
        /// Generation the pool was cleared to.
        generation: u32,
    },

    /// The pool is closed or was closed while the request was waiting.
    #[error("connection pool for {address} is closed")]
    PoolClosed {
        /// Server the pool belongs to.
        address: ServerAddress,
    },

    /// No connection became available before the request deadline.
    #[error(
        "timed out after {}ms waiting for a connection from the pool for {address}; \
         maxPoolSize: {max_pool_size}, connections in use: {in_use}",
        elapsed.as_millis()
    )]
    Timeout {
        /// Server the pool belongs to.
        address: ServerAddress,
        /// Time spent waiting.
        elapsed: Duration,
        /// Connections checked out when the request gave up.
        in_use: usize,
        /// Configured pool capacity.
        max_pool_size: usize,
    },

    /// The wait queue is at its configured capacity.
    #[error("wait queue for the connection pool of {address} is full (limit {limit})")]
    WaitQueueFull {
        /// Server the pool belongs to.
        address: ServerAddress,
        /// Configured wait queue capacity.
        limit: usize,
    },

    /// The caller's cancellation signal fired while waiting.
    #[error("checkout from the connection pool for {address} was cancelled")]
    Cancelled {
        /// Server the pool belongs to.
        address: ServerAddress,
    },

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// The CMAP check-out failure reason reported for this error.
    #[must_use]
    pub fn failure_reason(&self) -> CheckOutFailedReason {
        match self {
            Self::PoolClosed { .. } => CheckOutFailedReason::PoolClosed,
            Self::Timeout { .. } => CheckOutFailedReason::Timeout,
            Self::WaitQueueFull { .. } => CheckOutFailedReason::WaitQueueFull,
            Self::Connection { .. }
            | Self::PoolCleared { .. }
            | Self::Cancelled { .. }
            | Self::Config(_) => CheckOutFailedReason::ConnectionError,
        }
    }

    /// Check if this error is a wait-queue timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the operation layer may retry on a different connection.
    ///
    /// The pool never retries by itself.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolCleared { .. } => true,
            Self::Connection { source, .. } => source.is_network(),
            _ => false,
        }
    }
}

/// Errors raised while establishing a single connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// IO error while connecting.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The establishment did not finish within the connect timeout.
    #[error("connection establishment timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// The server rejected or broke off the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl ConnectError {
    /// Check if this is a network-level failure.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TimedOut(_))
    }
}
