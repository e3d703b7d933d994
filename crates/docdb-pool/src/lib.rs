//! # docdb-driver-pool
//!
//! Per-server connection pool for the docdb driver, following the Connection
//! Monitoring and Pooling (CMAP) model.
//!
//! Each server known to the topology layer gets one [`ConnectionPool`]. The
//! pool hands out established connections, bounds how many exist and how many
//! are being established at once, queues callers fairly when it is saturated,
//! invalidates connections lazily after server errors, and reports every
//! lifecycle step as a [`PoolEvent`].
//!
//! ## Features
//!
//! - FIFO hand-off to waiting callers with per-request deadlines
//! - `maxPoolSize`, `minPoolSize` and `maxConnecting` bounds
//! - Generation-based clearing, scoped per service behind load balancers
//! - Idle and lifetime reaping with background top-up
//! - Pluggable [`Connector`] for the network connect and handshake
//! - Structured events and pool metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use docdb_driver_pool::{ConnectionPool, PoolOptions, ServerAddress, TracingEventHandler};
//! use std::time::Duration;
//!
//! let options = PoolOptions::from_connection_string(
//!     "docdb://db1.example.net/?maxPoolSize=20&minPoolSize=2&waitQueueTimeoutMS=500",
//! )?;
//!
//! let pool = ConnectionPool::builder(ServerAddress::parse("db1.example.net")?)
//!     .options(options)
//!     .event_handler(TracingEventHandler)
//!     .build()?;
//! pool.mark_ready();
//!
//! // Get a connection from the pool
//! let conn = pool.get().await?;
//! // Use connection...
//! // Connection automatically returned to pool on drop
//!
//! // Check pool status
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//!
//! // Get metrics
//! let metrics = pool.metrics();
//! println!("Checkout success rate: {:.2}", metrics.checkout_success_rate());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod address;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod event;
pub mod pool;
pub mod registry;

mod establish;
mod generation;
mod inner;
mod maintenance;
mod wait_queue;

// Addressing
pub use address::{ConnectionId, DEFAULT_PORT, ServerAddress, ServerId, ServiceId};

// Configuration
pub use config::PoolOptions;

// Error types
pub use error::{ConnectError, PoolError};

// Connections
pub use connection::{Connection, ConnectionState};
pub use connector::{Connector, Established, TcpConnector, Transport};

// Events
pub use event::{
    CheckOutFailedReason, ConnectionRemovedReason, EventHandler, PoolEvent, PoolEventKind,
    TracingEventHandler,
};

// Pool types
pub use inner::{ClearRequest, PoolState};
pub use pool::{
    CheckoutOptions, ConnectionPool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection,
};
pub use registry::PoolRegistry;
