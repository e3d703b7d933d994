//! # docdb-testing
//!
//! Test infrastructure for the docdb connection pool.
//!
//! - [`MockConnector`]: in-memory connections with scripted delays, failures
//!   and service ids, plus counters for establishment concurrency
//! - [`EventRecorder`]: an event handler that keeps every pool event and can
//!   wait for one to appear
//! - [`eventually`]: poll a condition until it holds or a timeout passes
//!
//! ## Example
//!
//! ```rust,ignore
//! use docdb_testing::{EventRecorder, MockConnector, mock_pool};
//!
//! let connector = MockConnector::new().with_delay(Duration::from_millis(10));
//! let recorder = EventRecorder::new();
//! let pool = mock_pool(PoolOptions::new().max_pool_size(1), &connector, &recorder)?;
//!
//! let conn = pool.get().await?;
//! assert_eq!(connector.attempts(), 1);
//! assert_eq!(recorder.count("ConnectionAdded"), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docdb_driver_pool::{
    ConnectError, ConnectionPool, Connector, Established, EventHandler, PoolError, PoolEvent,
    PoolOptions, ServerAddress, ServiceId,
};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Address used by pools built with [`mock_pool`].
pub const MOCK_HOST: &str = "localhost";

/// Build a pool for [`MOCK_HOST`] backed by `connector` and reporting to `recorder`.
pub fn mock_pool(
    options: PoolOptions,
    connector: &MockConnector,
    recorder: &EventRecorder,
) -> Result<ConnectionPool, PoolError> {
    ConnectionPool::builder(ServerAddress::new(MOCK_HOST, docdb_driver_pool::DEFAULT_PORT))
        .options(options)
        .connector(connector.clone())
        .event_handler(recorder.clone())
        .build()
}

/// Install a test-friendly `tracing` subscriber once.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Works with paused time: each round sleeps one millisecond of tokio time.
pub async fn eventually(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// =============================================================================
// Mock connector
// =============================================================================

/// A scripted establishment failure.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// The server refused the TCP connection.
    Refused,
    /// The server rejected the handshake.
    Handshake(String),
}

impl MockFailure {
    fn into_error(self) -> ConnectError {
        match self {
            Self::Refused => ConnectError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )),
            Self::Handshake(message) => ConnectError::Handshake(message),
        }
    }
}

#[derive(Default)]
struct MockState {
    delay: Mutex<Duration>,
    failures: Mutex<VecDeque<MockFailure>>,
    failing: AtomicBool,
    service_id: Mutex<Option<ServiceId>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

/// Decrements the in-flight counter when an establishment ends, even if the
/// pool's connect timeout drops it midway.
struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector producing in-memory duplex connections.
///
/// Clones share their script and counters, so a test can keep one handle and
/// give another to the pool.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// A connector that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every establishment by `delay` of tokio time.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    /// Report `service_id` from every handshake.
    #[must_use]
    pub fn with_service_id(self, service_id: ServiceId) -> Self {
        self.set_service_id(Some(service_id));
        self
    }

    /// Change the establishment delay.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    /// Change the service id reported by later handshakes.
    pub fn set_service_id(&self, service_id: Option<ServiceId>) {
        *self.state.service_id.lock() = service_id;
    }

    /// Fail the next `count` establishments with a refused connection.
    pub fn fail_next(&self, count: usize) {
        let mut failures = self.state.failures.lock();
        failures.extend(std::iter::repeat_n(MockFailure::Refused, count));
    }

    /// Fail the next establishment with `failure`.
    pub fn fail_next_with(&self, failure: MockFailure) {
        self.state.failures.lock().push_back(failure);
    }

    /// Fail every establishment until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of establishments started.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Number of establishments currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent establishments seen.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of connections whose server side is still held.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state.peers.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<Established, ConnectError> {
        let state = &*self.state;
        let _in_flight = InFlight::enter(state);
        let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = state.failures.lock().pop_front();
        if let Some(failure) = scripted {
            tracing::debug!(%address, attempt, ?failure, "mock establishment failing");
            return Err(failure.into_error());
        }
        if state.failing.load(Ordering::SeqCst) {
            return Err(MockFailure::Refused.into_error());
        }

        let (client, server) = tokio::io::duplex(1024);
        state.peers.lock().push(server);

        let established = Established::new(client);
        Ok(match *state.service_id.lock() {
            Some(service_id) => established.with_service_id(service_id),
            None => established,
        })
    }
}

// =============================================================================
// Event recorder
// =============================================================================

/// Event handler that records every event in order.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<PoolEvent>>>,
    notify: Arc<Notify>,
}

impl EventRecorder {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Names of all events so far.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind.name()).collect()
    }

    /// Number of events named `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind.name() == name)
            .count()
    }

    /// Events matching `predicate`.
    #[must_use]
    pub fn matching(&self, predicate: impl Fn(&PoolEvent) -> bool) -> Vec<PoolEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Wait until the recorded events satisfy `predicate`.
    ///
    /// Returns `false` if `timeout` passes first.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&[PoolEvent]) -> bool,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if predicate(&self.events.lock()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.events.lock());
            }
        }
    }

    /// Wait until at least `n` events named `name` were recorded.
    pub fn wait_for_count<'a>(
        &'a self,
        name: &'a str,
        n: usize,
        timeout: Duration,
    ) -> impl Future<Output = bool> + 'a {
        self.wait_for(
            move |events| events.iter().filter(|e| e.kind.name() == name).count() >= n,
            timeout,
        )
    }
}

impl EventHandler for EventRecorder {
    fn handle(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }
}
