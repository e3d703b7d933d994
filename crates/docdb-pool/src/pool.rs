//! Connection pool implementation.
//!
//! This module holds the public face of a per-server pool: checkout and
//! check-in, clear, readiness transitions, shutdown, status and metrics.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::{ServerAddress, ServerId, ServiceId};
use crate::config::PoolOptions;
use crate::connection::Connection;
use crate::connector::{Connector, TcpConnector};
use crate::error::PoolError;
use crate::establish;
use crate::event::{
    CheckOutFailedReason, ConnectionRemovedReason, EventHandler, PoolEvent, PoolEventKind,
};
use crate::inner::{ClearRequest, Effects, Inner, PoolState, Registration};
use crate::maintenance;

/// A CMAP connection pool for one server.
///
/// The pool bounds the number of live connections, hands them out in request
/// order and invalidates them lazily through generations. Handles are cheap
/// to clone and share one pool.
///
/// # Example
///
/// ```rust,ignore
/// use docdb_driver_pool::{ConnectionPool, PoolOptions, ServerAddress};
///
/// let pool = ConnectionPool::builder(ServerAddress::new("db1.example.net", 27017))
///     .options(PoolOptions::new().max_pool_size(20).min_pool_size(2))
///     .build()?;
/// pool.mark_ready();
///
/// let conn = pool.get().await?;
/// // Use connection...
/// // Returned to the pool on drop
///
/// let status = pool.status();
/// println!("Pool utilization: {:.1}%", status.utilization());
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

/// State shared by pool handles, background tasks and checked-out connections.
pub(crate) struct Shared {
    pub(crate) server_id: ServerId,
    pub(crate) options: PoolOptions,
    pub(crate) connector: Arc<dyn Connector>,
    handler: Option<Arc<dyn EventHandler>>,
    pub(crate) inner: Mutex<Inner>,
    metrics: Mutex<PoolMetricsInner>,
    /// Stops the maintenance task.
    pub(crate) shutdown: CancellationToken,
    created_at: std::time::Instant,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections established.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Total failed establishments.
    establishment_failures: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts.
    checkouts_failed: u64,
    /// Failed checkouts that hit their deadline.
    checkout_timeouts: u64,
    /// Total clears that bumped a generation.
    clears: u64,
}

impl Shared {
    pub(crate) fn address(&self) -> &ServerAddress {
        &self.server_id.address
    }

    fn event(&self, kind: PoolEventKind) -> PoolEvent {
        PoolEvent::new(self.address(), kind)
    }

    /// Record and publish one event.
    pub(crate) fn emit(&self, event: PoolEvent) {
        {
            let mut metrics = self.metrics.lock();
            match event.kind {
                PoolEventKind::ConnectionAdded => metrics.connections_created += 1,
                PoolEventKind::ConnectionRemoved { .. } => metrics.connections_closed += 1,
                PoolEventKind::CheckedOut => metrics.checkouts_successful += 1,
                PoolEventKind::CheckOutFailed { reason } => {
                    metrics.checkouts_failed += 1;
                    if reason == CheckOutFailedReason::Timeout {
                        metrics.checkout_timeouts += 1;
                    }
                }
                PoolEventKind::Cleared { .. } => metrics.clears += 1,
                _ => {}
            }
        }
        if let Some(handler) = &self.handler {
            handler.handle(&event);
        }
    }

    pub(crate) fn record_establishment_failure(&self) {
        self.metrics.lock().establishment_failures += 1;
    }

    /// Perform the work decided under the lock. Socket closes run in the
    /// background.
    pub(crate) fn apply(self: &Arc<Self>, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        for (conn, reason) in self.deliver(effects) {
            self.spawn_close(conn, reason);
        }
    }

    /// Like [`Shared::apply`], but waits for every socket close.
    async fn apply_and_wait(self: &Arc<Self>, effects: Effects) {
        let closes = self.deliver(effects);
        join_all(
            closes
                .into_iter()
                .map(|(conn, reason)| self.close_connection(conn, reason)),
        )
        .await;
    }

    fn deliver(self: &Arc<Self>, effects: Effects) -> Vec<(Connection, ConnectionRemovedReason)> {
        let Effects {
            events,
            handoffs,
            failures,
            closes,
            establish,
            resume_top_up_at,
        } = effects;

        for event in events {
            self.emit(event);
        }
        for attempt in establish {
            establish::spawn(self, attempt);
        }
        if let Some(at) = resume_top_up_at {
            maintenance::schedule_top_up(self, at);
        }
        for (tx, conn) in handoffs {
            // A receiver that is gone hands the connection straight back.
            let _ = tx.send(Ok(PooledConnection::new(conn, Arc::clone(self))));
        }
        for (tx, err) in failures {
            let _ = tx.send(Err(err));
        }
        closes
    }

    fn spawn_close(self: &Arc<Self>, conn: Connection, reason: ConnectionRemovedReason) {
        match Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(self);
                handle.spawn(async move { shared.close_connection(conn, reason).await });
            }
            Err(_) => {
                let event = self
                    .event(PoolEventKind::ConnectionRemoved { reason })
                    .with_connection(conn.id())
                    .with_service(conn.service_id().copied());
                drop(conn);
                self.emit(event);
            }
        }
    }

    async fn close_connection(&self, conn: Connection, reason: ConnectionRemovedReason) {
        let started = Instant::now();
        let event = self
            .event(PoolEventKind::ConnectionRemoved { reason })
            .with_connection(conn.id())
            .with_service(conn.service_id().copied());
        conn.close().await;
        self.emit(event.with_duration(started.elapsed()));
    }

    pub(crate) fn check_in(self: &Arc<Self>, conn: Connection, broken: bool) {
        tracing::trace!(
            address = %self.address(),
            connection_id = %conn.id(),
            broken,
            "returning connection to pool"
        );
        let effects = self.inner.lock().check_in(conn, broken, Instant::now());
        self.apply(effects);
    }

    pub(crate) async fn maintain(self: &Arc<Self>) {
        let effects = self.inner.lock().maintain(Instant::now());
        if !effects.closes.is_empty() {
            tracing::debug!(
                address = %self.address(),
                closing = effects.closes.len(),
                "pool maintenance closing connections"
            );
        }
        self.apply_and_wait(effects).await;
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            address: self.address().clone(),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum GaveUp {
    Timeout,
    Cancelled,
}

impl ConnectionPool {
    /// Create a new pool builder for a server.
    #[must_use]
    pub fn builder(address: ServerAddress) -> PoolBuilder {
        PoolBuilder::new(address)
    }

    /// Create a pool in the Paused state.
    ///
    /// For more control over pool creation, use [`ConnectionPool::builder()`].
    pub fn new(
        server_id: ServerId,
        options: PoolOptions,
        connector: Arc<dyn Connector>,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> Result<Self, PoolError> {
        options.validate()?;

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new(server_id.address.clone(), options.clone())),
            server_id,
            options,
            connector,
            handler,
            metrics: Mutex::new(PoolMetricsInner::default()),
            shutdown: CancellationToken::new(),
            created_at: std::time::Instant::now(),
        });

        shared.emit(shared.event(PoolEventKind::Opening));
        tracing::info!(
            address = %shared.address(),
            min = shared.options.min_pool_size,
            max = shared.options.max_pool_size,
            max_connecting = shared.options.max_connecting,
            "connection pool created"
        );
        shared.emit(shared.event(PoolEventKind::Opened));

        Ok(Self { shared })
    }

    /// Get a connection with the default checkout options.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        self.check_out(CheckoutOptions::default()).await
    }

    /// Get a connection from the pool.
    ///
    /// Returns a ready connection if one matches, otherwise establishes a new
    /// one if the pool has capacity, otherwise waits in request order until a
    /// connection is returned, the deadline passes or the pool is cleared or
    /// closed. The effective deadline is the earlier of `waitQueueTimeout`
    /// and [`CheckoutOptions::deadline`].
    pub async fn check_out(&self, options: CheckoutOptions) -> Result<PooledConnection, PoolError> {
        let started = Instant::now();
        self.shared.emit(
            self.shared
                .event(PoolEventKind::CheckOutStarted)
                .with_service(options.service_id),
        );

        let result = self.acquire(&options, started).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(conn) => self.shared.emit(
                self.shared
                    .event(PoolEventKind::CheckedOut)
                    .with_connection(conn.id())
                    .with_service(conn.service_id().copied())
                    .with_duration(elapsed),
            ),
            Err(err) => {
                tracing::debug!(
                    address = %self.shared.address(),
                    error = %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "connection checkout failed"
                );
                self.shared.emit(
                    self.shared
                        .event(PoolEventKind::CheckOutFailed {
                            reason: err.failure_reason(),
                        })
                        .with_service(options.service_id)
                        .with_duration(elapsed),
                );
            }
        }
        result
    }

    async fn acquire(
        &self,
        options: &CheckoutOptions,
        started: Instant,
    ) -> Result<PooledConnection, PoolError> {
        let shared = &self.shared;
        // `None` waits without a deadline.
        let queue_deadline = started.checked_add(shared.options.wait_queue_timeout);
        let deadline = match (queue_deadline, options.deadline) {
            (Some(queue), Some(requested)) => Some(queue.min(requested)),
            (queue, requested) => queue.or(requested),
        };

        let (tx, mut rx) = oneshot::channel();
        let (registration, effects) =
            shared
                .inner
                .lock()
                .begin_check_out(options.service_id, started, tx);
        shared.apply(effects);

        let waiter_id = match registration {
            Registration::Immediate(conn) => {
                return Ok(PooledConnection::new(conn, Arc::clone(shared)));
            }
            Registration::Failed(err) => return Err(err),
            Registration::Queued(id) => id,
        };

        let cancelled = async {
            match &options.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let gave_up = tokio::select! {
            biased;
            delivered = &mut rx => {
                return delivered.unwrap_or_else(|_| Err(shared.closed_error()));
            }
            () = expired => GaveUp::Timeout,
            () = cancelled => GaveUp::Cancelled,
        };

        let (withdrawn, in_use) = {
            let mut inner = shared.inner.lock();
            (inner.abandon(waiter_id), inner.in_use())
        };
        if !withdrawn {
            // Served while giving up; the result is already on the channel.
            return rx.await.unwrap_or_else(|_| Err(shared.closed_error()));
        }

        Err(match gave_up {
            GaveUp::Timeout => PoolError::Timeout {
                address: shared.address().clone(),
                elapsed: started.elapsed(),
                in_use,
                max_pool_size: shared.options.max_pool_size,
            },
            GaveUp::Cancelled => PoolError::Cancelled {
                address: shared.address().clone(),
            },
        })
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping it.
    pub fn check_in(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Invalidate connections in the request's scope.
    ///
    /// Ready connections of older generations are closed, checked-out ones are
    /// closed on check-in, and waiters in scope fail. Returns `false` if the
    /// pool is closed or the scope was already cleared past
    /// [`ClearRequest::if_generation`].
    pub fn clear(&self, request: ClearRequest) -> bool {
        let (cleared, effects) = self.shared.inner.lock().clear(&request, Instant::now());
        if cleared {
            tracing::info!(
                address = %self.shared.address(),
                service_id = request.service_id.map(|id| id.to_string()),
                interrupt_in_use = request.interrupt_in_use,
                reason = request.reason.as_deref(),
                "connection pool cleared"
            );
        }
        self.shared.apply(effects);
        cleared
    }

    /// Mark the server healthy. Starts background population and maintenance.
    ///
    /// Returns `false` if the pool was not Paused.
    pub fn mark_ready(&self) -> bool {
        let (changed, effects) = self.shared.inner.lock().mark_ready(Instant::now());
        if changed {
            tracing::debug!(address = %self.shared.address(), "connection pool ready");
            maintenance::spawn(&self.shared);
        }
        self.shared.apply(effects);
        changed
    }

    /// Request the Paused state.
    ///
    /// A pool that is already Ready stays Ready; clear it instead. Returns
    /// whether the pool is Paused.
    pub fn mark_paused(&self) -> bool {
        self.shared.inner.lock().mark_paused()
    }

    /// Close the pool.
    ///
    /// Waiters fail with [`PoolError::PoolClosed`], ready connections are
    /// closed before this returns and checked-out connections are closed when
    /// they come back. Closing twice is a no-op.
    pub async fn close(&self) {
        let (closed, effects) = self.shared.inner.lock().close();
        if !closed {
            return;
        }
        self.shared.shutdown.cancel();
        self.shared.apply_and_wait(effects).await;
        self.shared.emit(self.shared.event(PoolEventKind::Closed));
        tracing::info!(address = %self.shared.address(), "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == PoolState::Closed
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().state()
    }

    /// Current generation of a scope.
    #[must_use]
    pub fn generation(&self, service_id: Option<&ServiceId>) -> u32 {
        self.shared.inner.lock().generation(service_id)
    }

    /// The server this pool belongs to.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.shared.server_id
    }

    /// The server endpoint.
    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        self.shared.address()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock();
        PoolStatus {
            state: inner.state(),
            available: inner.available(),
            in_use: inner.in_use(),
            establishing: inner.establishing(),
            waiting: inner.waiting(),
            total: inner.total(),
            max: self.shared.options.max_pool_size,
            generation: inner.generation(None),
            longest_wait: inner.longest_wait(Instant::now()),
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.shared.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            establishment_failures: inner.establishment_failures,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            checkout_timeouts: inner.checkout_timeouts,
            clears: inner.clears,
            uptime: self.shared.created_at.elapsed(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server_id", &self.shared.server_id)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ConnectionPool::builder(address)
///     .max_pool_size(50)
///     .connector(my_connector)
///     .event_handler(TracingEventHandler)
///     .build()?;
/// ```
pub struct PoolBuilder {
    server_id: ServerId,
    options: PoolOptions,
    connector: Option<Arc<dyn Connector>>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new(address: ServerAddress) -> Self {
        Self {
            server_id: ServerId::new(0, address),
            options: PoolOptions::default(),
            connector: None,
            handler: None,
        }
    }

    /// Set the cluster the server belongs to.
    #[must_use]
    pub fn cluster_id(mut self, cluster_id: u32) -> Self {
        self.server_id.cluster_id = cluster_id;
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.options.max_pool_size = size;
        self
    }

    /// Set the number of connections kept open while Ready.
    #[must_use]
    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.options.min_pool_size = size;
        self
    }

    /// Set the checkout wait timeout.
    #[must_use]
    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.options.wait_queue_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.options.max_idle_time = Some(idle);
        self
    }

    /// Set how new connections are established. Defaults to [`TcpConnector`].
    #[must_use]
    pub fn connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Set the receiver of pool events.
    #[must_use]
    pub fn event_handler<H: EventHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<ConnectionPool, PoolError> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new()));
        ConnectionPool::new(self.server_id, self.options, connector, self.handler)
    }
}

/// Per-request checkout parameters.
#[derive(Debug, Clone, Default)]
pub struct CheckoutOptions {
    service_id: Option<ServiceId>,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
}

impl CheckoutOptions {
    /// Default options: any connection, `waitQueueTimeout` deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept a connection bound to this service.
    #[must_use]
    pub fn service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    /// Give up at `deadline` if it is earlier than `waitQueueTimeout`.
    #[must_use]
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Give up after `timeout` if it is shorter than `waitQueueTimeout`.
    ///
    /// A timeout too large to represent sets no deadline.
    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.deadline(deadline),
            None => self,
        }
    }

    /// Give up with [`PoolError::Cancelled`] when `token` fires.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Lifecycle state.
    pub state: PoolState,
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Number of establishments in flight.
    pub establishing: usize,
    /// Number of queued checkout requests.
    pub waiting: usize,
    /// Total number of connections, including establishing ones.
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
    /// Current global generation.
    pub generation: u32,
    /// How long the oldest queued request has been waiting.
    pub longest_wait: Option<Duration>,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Establishments that failed or timed out.
    pub establishment_failures: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Failed checkouts that hit their deadline.
    pub checkout_timeouts: u64,
    /// Clears that bumped a generation.
    pub clears: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate establishment success rate (0.0 to 1.0).
    #[must_use]
    pub fn establishment_success_rate(&self) -> f64 {
        let total = self.connections_created + self.establishment_failures;
        if total == 0 {
            return 1.0;
        }
        self.connections_created as f64 / total as f64
    }
}

/// A connection retrieved from the pool.
///
/// When dropped, the connection is automatically returned to the pool.
/// Use [`discard()`](PooledConnection::discard) to close it instead.
pub struct PooledConnection {
    /// Always `Some` until drop.
    conn: Option<Connection>,
    /// Reference to the pool for returning the connection.
    pool: Arc<Shared>,
    broken: bool,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<Shared>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            broken: false,
        }
    }

    /// Mark the connection unusable. It is closed instead of reused on check-in.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Close the connection instead of returning it for reuse.
    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    #[allow(clippy::expect_used)] // only taken in Drop
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    #[allow(clippy::expect_used)] // only taken in Drop
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.broken);
        }
    }
}
