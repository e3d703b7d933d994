//! Locked pool state.
//!
//! Every count, the ready set, the wait queue and the generations live in one
//! [`Inner`] behind a single mutex. Methods here never block and never touch
//! the network: they mutate state and describe the I/O they want done as
//! [`Effects`], which the caller applies after releasing the lock.

use std::collections::VecDeque;
use std::time::Duration;

use hashbrown::HashMap;
use serde::Serialize;
use smallvec::SmallVec;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::{ConnectionId, ServerAddress, ServiceId};
use crate::config::PoolOptions;
use crate::connection::Connection;
use crate::connector::Established;
use crate::error::{ConnectError, PoolError};
use crate::event::{ConnectionRemovedReason, PoolEvent, PoolEventKind};
use crate::generation::GenerationTracker;
use crate::wait_queue::{CheckoutResult, WaitQueue, Waiter};

/// First delay after a failed background top-up.
const TOP_UP_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Upper bound for the top-up delay.
const TOP_UP_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Lifecycle state of a pool.
///
/// Transitions are `Paused -> Ready -> Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolState {
    /// Constructed; serves checkouts but does not populate in the background.
    Paused,
    /// Server known healthy; background top-up is active.
    Ready,
    /// Shut down. Every operation except check-in fails.
    Closed,
}

/// An establishment the locked state decided to start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt {
    pub(crate) id: u64,
    pub(crate) connection_id: ConnectionId,
    /// Global generation when the attempt started.
    pub(crate) global_generation: u32,
    /// Started for a checkout rather than for `minPoolSize`.
    pub(crate) for_waiter: bool,
}

/// Work to perform once the lock is released.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) events: SmallVec<[PoolEvent; 4]>,
    pub(crate) handoffs: Vec<(oneshot::Sender<CheckoutResult>, Connection)>,
    pub(crate) failures: Vec<(oneshot::Sender<CheckoutResult>, PoolError)>,
    pub(crate) closes: Vec<(Connection, ConnectionRemovedReason)>,
    pub(crate) establish: SmallVec<[Attempt; 2]>,
    /// Top-up is held back until this instant.
    pub(crate) resume_top_up_at: Option<Instant>,
}

impl Effects {
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.handoffs.is_empty()
            && self.failures.is_empty()
            && self.closes.is_empty()
            && self.establish.is_empty()
            && self.resume_top_up_at.is_none()
    }
}

/// Immediate outcome of a checkout request.
pub(crate) enum Registration {
    /// A ready connection was available.
    Immediate(Connection),
    /// The request was queued under this id.
    Queued(u64),
    /// The request failed without waiting.
    Failed(PoolError),
}

/// Parameters of a clear.
#[derive(Debug, Clone, Default)]
pub struct ClearRequest {
    pub(crate) service_id: Option<ServiceId>,
    pub(crate) interrupt_in_use: bool,
    pub(crate) if_generation: Option<u32>,
    pub(crate) reason: Option<String>,
}

impl ClearRequest {
    /// Clear every connection of the pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the clear to connections bound to one service.
    #[must_use]
    pub fn service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    /// Also signal stale connections that are currently checked out.
    #[must_use]
    pub fn interrupt_in_use(mut self, interrupt: bool) -> Self {
        self.interrupt_in_use = interrupt;
        self
    }

    /// Only clear if the scope is still at `generation`.
    ///
    /// Several operations failing on connections of the same generation then
    /// produce a single clear.
    #[must_use]
    pub fn if_generation(mut self, generation: u32) -> Self {
        self.if_generation = Some(generation);
        self
    }

    /// Attach a human readable cause for logging.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Bookkeeping for a checked-out connection.
struct Lent {
    generation: u32,
    service_id: Option<ServiceId>,
    interrupt: CancellationToken,
}

/// Exponential back-off for background population.
#[derive(Debug, Default)]
struct TopUpBackoff {
    failures: u32,
    resume_at: Option<Instant>,
}

impl TopUpBackoff {
    fn allows(&self, now: Instant) -> bool {
        self.resume_at.is_none_or(|at| now >= at)
    }

    fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let shift = (self.failures - 1).min(16);
        let delay = TOP_UP_BACKOFF_BASE
            .saturating_mul(1u32 << shift)
            .min(TOP_UP_BACKOFF_MAX);
        self.resume_at = Some(now + delay);
        delay
    }

    fn resume_at(&self) -> Option<Instant> {
        self.resume_at
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.resume_at = None;
    }
}

/// The mutable state of one pool.
pub(crate) struct Inner {
    address: ServerAddress,
    options: PoolOptions,
    state: PoolState,
    generations: GenerationTracker,
    /// Most recently used first.
    ready: VecDeque<Connection>,
    in_use: HashMap<ConnectionId, Lent>,
    establishing: usize,
    wait_queue: WaitQueue,
    next_connection_id: u64,
    next_attempt_id: u64,
    top_up: TopUpBackoff,
}

impl Inner {
    pub(crate) fn new(address: ServerAddress, options: PoolOptions) -> Self {
        Self {
            address,
            options,
            state: PoolState::Paused,
            generations: GenerationTracker::new(),
            ready: VecDeque::new(),
            in_use: HashMap::new(),
            establishing: 0,
            wait_queue: WaitQueue::new(),
            next_connection_id: 0,
            next_attempt_id: 0,
            top_up: TopUpBackoff::default(),
        }
    }

    pub(crate) fn state(&self) -> PoolState {
        self.state
    }

    pub(crate) fn generation(&self, service_id: Option<&ServiceId>) -> u32 {
        self.generations.current(service_id)
    }

    pub(crate) fn available(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.len()
    }

    pub(crate) fn establishing(&self) -> usize {
        self.establishing
    }

    pub(crate) fn waiting(&self) -> usize {
        self.wait_queue.len()
    }

    /// Ready, in use and establishing. Never exceeds `maxPoolSize`.
    pub(crate) fn total(&self) -> usize {
        self.ready.len() + self.in_use.len() + self.establishing
    }

    fn event(&self, kind: PoolEventKind) -> PoolEvent {
        PoolEvent::new(&self.address, kind)
    }

    fn can_establish(&self) -> bool {
        self.total() < self.options.max_pool_size
            && self.establishing < self.options.max_connecting
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Serve a checkout from the ready set, start an establishment for it, or
    /// queue it.
    pub(crate) fn begin_check_out(
        &mut self,
        service_id: Option<ServiceId>,
        now: Instant,
        tx: oneshot::Sender<CheckoutResult>,
    ) -> (Registration, Effects) {
        let mut effects = Effects::default();

        if self.state == PoolState::Closed {
            let err = PoolError::PoolClosed {
                address: self.address.clone(),
            };
            return (Registration::Failed(err), effects);
        }
        self.wait_queue.prune_abandoned();

        if let Some(conn) = self.take_ready(service_id.as_ref(), now, &mut effects) {
            return (Registration::Immediate(self.lend(conn)), effects);
        }

        let attempt = if self.can_establish() {
            Some(self.begin_attempt(true, &mut effects))
        } else {
            if let Some(limit) = self.options.wait_queue_size {
                if self.wait_queue.queued() >= limit {
                    let err = PoolError::WaitQueueFull {
                        address: self.address.clone(),
                        limit,
                    };
                    return (Registration::Failed(err), effects);
                }
            }
            None
        };

        let id = self.wait_queue.next_id();
        self.wait_queue.push(Waiter {
            id,
            service_id,
            requested_at: now,
            attempt,
            tx,
        });
        (Registration::Queued(id), effects)
    }

    /// Withdraw a queued request that gave up.
    ///
    /// Returns `false` if the request was already served; its result is then
    /// in flight on the channel.
    pub(crate) fn abandon(&mut self, waiter_id: u64) -> bool {
        self.wait_queue.remove(waiter_id).is_some()
    }

    /// First usable ready connection for `service_id`, retiring unusable ones
    /// found along the way.
    fn take_ready(
        &mut self,
        service_id: Option<&ServiceId>,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<Connection> {
        let mut index = 0;
        while index < self.ready.len() {
            let conn = &self.ready[index];
            let reason = if !self.generations.is_current(conn.service_id(), conn.generation()) {
                Some(ConnectionRemovedReason::Stale)
            } else if conn.is_life_expired(now, self.options.max_life_time) {
                Some(ConnectionRemovedReason::Expired)
            } else {
                None
            };

            if let Some(reason) = reason {
                if let Some(conn) = self.ready.remove(index) {
                    effects.closes.push((conn, reason));
                }
                continue;
            }
            if conn.matches(service_id) {
                return self.ready.remove(index);
            }
            index += 1;
        }
        None
    }

    fn lend(&mut self, mut conn: Connection) -> Connection {
        conn.mark_in_use();
        self.in_use.insert(
            conn.id(),
            Lent {
                generation: conn.generation(),
                service_id: conn.service_id().copied(),
                interrupt: conn.interrupt_token(),
            },
        );
        conn
    }

    fn hand_off(&mut self, waiter: Waiter, conn: Connection, effects: &mut Effects) {
        if let Some(attempt) = waiter.attempt {
            self.wait_queue.adopt_attempt(attempt);
        }
        let conn = self.lend(conn);
        effects.handoffs.push((waiter.tx, conn));
    }

    /// Give a usable connection to the oldest eligible waiter or park it.
    fn offer(&mut self, mut conn: Connection, now: Instant, effects: &mut Effects) {
        conn.mark_ready(now);
        match self.wait_queue.pop_eligible(conn.service_id()) {
            Some(waiter) => self.hand_off(waiter, conn, effects),
            None => self.ready.push_front(conn),
        }
    }

    fn begin_attempt(&mut self, for_waiter: bool, effects: &mut Effects) -> u64 {
        self.next_attempt_id += 1;
        self.next_connection_id += 1;
        self.establishing += 1;
        let attempt = Attempt {
            id: self.next_attempt_id,
            connection_id: ConnectionId(self.next_connection_id),
            global_generation: self.generations.global(),
            for_waiter,
        };
        effects.establish.push(attempt);
        attempt.id
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Match ready connections with waiters, start establishments for waiters
    /// without one and top up to `minPoolSize`.
    ///
    /// Runs after every state change.
    pub(crate) fn dispatch(&mut self, now: Instant, effects: &mut Effects) {
        if self.state == PoolState::Closed {
            return;
        }
        self.wait_queue.prune_abandoned();

        if !self.ready.is_empty() {
            let waiting: Vec<(u64, Option<ServiceId>)> = self
                .wait_queue
                .iter()
                .map(|w| (w.id, w.service_id))
                .collect();
            for (id, service_id) in waiting {
                if self.ready.is_empty() {
                    break;
                }
                let Some(conn) = self.take_ready(service_id.as_ref(), now, effects) else {
                    continue;
                };
                match self.wait_queue.remove(id) {
                    Some(waiter) => self.hand_off(waiter, conn, effects),
                    None => self.ready.push_front(conn),
                }
            }
        }

        while self.can_establish() {
            let Some(waiter_id) = self.wait_queue.oldest_without_attempt() else {
                break;
            };
            let attempt = self.begin_attempt(true, effects);
            self.wait_queue.assign_attempt(waiter_id, attempt);
        }

        if self.state == PoolState::Ready && self.top_up.allows(now) {
            while self.total() < self.options.min_pool_size && self.can_establish() {
                self.begin_attempt(false, effects);
            }
        }
    }

    // =========================================================================
    // Establishment
    // =========================================================================

    /// Fold the result of an establishment back into the pool.
    pub(crate) fn complete_attempt(
        &mut self,
        attempt: Attempt,
        result: Result<Established, ConnectError>,
        elapsed: Duration,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        self.establishing = self.establishing.saturating_sub(1);

        match result {
            Ok(established) => {
                self.top_up.record_success();
                self.wait_queue.unassign_attempt(attempt.id);
                let generation = match established.service_id.as_ref() {
                    Some(service_id) => self.generations.current(Some(service_id)),
                    None => attempt.global_generation,
                };
                let conn = Connection::new(attempt.connection_id, generation, established);
                effects.events.push(
                    self.event(PoolEventKind::ConnectionAdded)
                        .with_connection(conn.id())
                        .with_service(conn.service_id().copied())
                        .with_duration(elapsed),
                );

                if self.state == PoolState::Closed {
                    effects.closes.push((conn, ConnectionRemovedReason::PoolClosed));
                } else if self.generations.global() != attempt.global_generation {
                    // A clear ran while the handshake was in progress.
                    effects.closes.push((conn, ConnectionRemovedReason::Stale));
                } else {
                    self.offer(conn, now, &mut effects);
                }
            }
            Err(error) => {
                if !attempt.for_waiter {
                    let delay = self.top_up.record_failure(now);
                    tracing::warn!(
                        address = %self.address,
                        connection_id = %attempt.connection_id,
                        error = %error,
                        retry_in_ms = delay.as_millis() as u64,
                        "background connection establishment failed"
                    );
                    effects.resume_top_up_at = self.top_up.resume_at();
                }
                match self.wait_queue.pop_attempt(attempt.id) {
                    Some(waiter) => {
                        let err = PoolError::Connection {
                            address: self.address.clone(),
                            source: error,
                        };
                        effects.failures.push((waiter.tx, err));
                    }
                    None if attempt.for_waiter => {
                        tracing::debug!(
                            address = %self.address,
                            connection_id = %attempt.connection_id,
                            error = %error,
                            "connection establishment failed after its requester left"
                        );
                    }
                    None => {}
                }
            }
        }

        self.dispatch(now, &mut effects);
        effects
    }

    /// Undo an attempt that could not be started.
    pub(crate) fn cancel_attempt(&mut self, attempt: &Attempt) {
        self.establishing = self.establishing.saturating_sub(1);
        self.wait_queue.unassign_attempt(attempt.id);
    }

    // =========================================================================
    // Check-in
    // =========================================================================

    /// Take back a connection from its user.
    pub(crate) fn check_in(&mut self, conn: Connection, broken: bool, now: Instant) -> Effects {
        let mut effects = Effects::default();
        self.in_use.remove(&conn.id());
        effects.events.push(
            self.event(PoolEventKind::CheckedIn)
                .with_connection(conn.id())
                .with_service(conn.service_id().copied()),
        );

        let reason = if self.state == PoolState::Closed {
            Some(ConnectionRemovedReason::PoolClosed)
        } else if !self.generations.is_current(conn.service_id(), conn.generation()) {
            Some(ConnectionRemovedReason::Stale)
        } else if broken {
            Some(ConnectionRemovedReason::Error)
        } else if conn.is_life_expired(now, self.options.max_life_time) {
            Some(ConnectionRemovedReason::Expired)
        } else {
            None
        };

        match reason {
            Some(reason) => effects.closes.push((conn, reason)),
            None => self.offer(conn, now, &mut effects),
        }

        self.dispatch(now, &mut effects);
        effects
    }

    // =========================================================================
    // Clear, ready, pause, close
    // =========================================================================

    /// Invalidate every connection in the request's scope.
    ///
    /// Returns `false` if the clear was a no-op.
    pub(crate) fn clear(&mut self, request: &ClearRequest, now: Instant) -> (bool, Effects) {
        let mut effects = Effects::default();
        if self.state == PoolState::Closed {
            return (false, effects);
        }

        let scope = request.service_id.as_ref();
        if let Some(observed) = request.if_generation {
            if observed < self.generations.current(scope) {
                return (false, effects);
            }
        }

        effects
            .events
            .push(self.event(PoolEventKind::Clearing).with_service(request.service_id));

        let generation = self.generations.bump(scope);

        let mut kept = VecDeque::with_capacity(self.ready.len());
        for conn in self.ready.drain(..) {
            if self.generations.is_current(conn.service_id(), conn.generation()) {
                kept.push_back(conn);
            } else {
                effects.closes.push((conn, ConnectionRemovedReason::Stale));
            }
        }
        self.ready = kept;

        if request.interrupt_in_use {
            for lent in self.in_use.values() {
                if !self
                    .generations
                    .is_current(lent.service_id.as_ref(), lent.generation)
                {
                    lent.interrupt.cancel();
                }
            }
        }

        let failed = self
            .wait_queue
            .drain_where(|w| scope.is_none() || w.service_id.as_ref() == scope);
        for waiter in failed {
            let err = PoolError::PoolCleared {
                address: self.address.clone(),
                generation,
            };
            effects.failures.push((waiter.tx, err));
        }

        effects.events.push(
            self.event(PoolEventKind::Cleared {
                interrupt_in_use: request.interrupt_in_use,
            })
            .with_service(request.service_id),
        );

        self.dispatch(now, &mut effects);
        (true, effects)
    }

    /// Transition `Paused -> Ready`.
    pub(crate) fn mark_ready(&mut self, now: Instant) -> (bool, Effects) {
        let mut effects = Effects::default();
        if self.state != PoolState::Paused {
            return (false, effects);
        }
        self.state = PoolState::Ready;
        effects.events.push(self.event(PoolEventKind::Ready));
        self.dispatch(now, &mut effects);
        (true, effects)
    }

    /// Stop background population.
    ///
    /// A pool that has become Ready stays Ready; the topology layer clears it
    /// instead when the server goes unknown.
    pub(crate) fn mark_paused(&mut self) -> bool {
        self.state == PoolState::Paused
    }

    /// Transition to `Closed`, failing waiters and draining the ready set.
    ///
    /// In-use connections are closed when they are checked in.
    pub(crate) fn close(&mut self) -> (bool, Effects) {
        let mut effects = Effects::default();
        if self.state == PoolState::Closed {
            return (false, effects);
        }
        self.state = PoolState::Closed;
        effects.events.push(self.event(PoolEventKind::Closing));

        for waiter in self.wait_queue.drain_where(|_| true) {
            let err = PoolError::PoolClosed {
                address: self.address.clone(),
            };
            effects.failures.push((waiter.tx, err));
        }
        for conn in self.ready.drain(..) {
            effects.closes.push((conn, ConnectionRemovedReason::PoolClosed));
        }
        (true, effects)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Remove stale, expired and idle ready connections, then top up.
    ///
    /// Idle reaping starts at the least recently used end and never takes the
    /// pool below `minPoolSize`.
    pub(crate) fn maintain(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        if self.state != PoolState::Ready {
            return effects;
        }

        let mut kept = VecDeque::with_capacity(self.ready.len());
        for conn in self.ready.drain(..) {
            if !self.generations.is_current(conn.service_id(), conn.generation()) {
                effects.closes.push((conn, ConnectionRemovedReason::Stale));
            } else if conn.is_life_expired(now, self.options.max_life_time) {
                effects.closes.push((conn, ConnectionRemovedReason::Expired));
            } else {
                kept.push_back(conn);
            }
        }
        self.ready = kept;

        let mut reapable =
            (self.ready.len() + self.in_use.len()).saturating_sub(self.options.min_pool_size);
        while reapable > 0 {
            let idle = self
                .ready
                .back()
                .is_some_and(|c| c.is_idle_expired(now, self.options.max_idle_time));
            if !idle {
                break;
            }
            if let Some(conn) = self.ready.pop_back() {
                effects.closes.push((conn, ConnectionRemovedReason::Idle));
            }
            reapable -= 1;
        }

        self.dispatch(now, &mut effects);
        effects
    }

    /// How long the oldest queued request has been waiting.
    pub(crate) fn longest_wait(&self, now: Instant) -> Option<Duration> {
        self.wait_queue
            .iter()
            .filter(|w| !w.is_abandoned())
            .map(|w| now.saturating_duration_since(w.requested_at))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ServerAddress {
        ServerAddress::new("localhost", 27017)
    }

    fn inner(options: PoolOptions) -> Inner {
        Inner::new(addr(), options)
    }

    fn established() -> (Established, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        (Established::new(client), server)
    }

    /// Complete every attempt in `effects` successfully.
    fn establish_all(
        pool: &mut Inner,
        effects: Effects,
        servers: &mut Vec<tokio::io::DuplexStream>,
    ) -> Vec<Effects> {
        let now = Instant::now();
        effects
            .establish
            .into_iter()
            .map(|attempt| {
                let (est, server) = established();
                servers.push(server);
                pool.complete_attempt(attempt, Ok(est), Duration::ZERO, now)
            })
            .collect()
    }

    fn names(effects: &Effects) -> Vec<&'static str> {
        effects.events.iter().map(|e| e.kind.name()).collect()
    }

    #[tokio::test]
    async fn test_checkout_starts_attempt_then_hands_off() {
        let mut pool = inner(PoolOptions::new().max_pool_size(1));
        let mut servers = Vec::new();
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let (registration, effects) = pool.begin_check_out(None, now, tx);
        assert!(matches!(registration, Registration::Queued(_)));
        assert_eq!(effects.establish.len(), 1);
        assert_eq!(pool.total(), 1);

        let mut done = establish_all(&mut pool, effects, &mut servers);
        let done = done.remove(0);
        assert_eq!(names(&done), vec!["ConnectionAdded"]);
        assert_eq!(done.handoffs.len(), 1);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.establishing(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_check_in_hands_to_next_waiter() {
        let mut pool = inner(PoolOptions::new().max_pool_size(1));
        let mut servers = Vec::new();
        let now = Instant::now();

        let (tx1, _rx1) = oneshot::channel();
        let (_, effects) = pool.begin_check_out(None, now, tx1);
        let mut done = establish_all(&mut pool, effects, &mut servers);
        let (_, conn) = done.remove(0).handoffs.pop().unwrap();
        let first_id = conn.id();

        let (tx2, _rx2) = oneshot::channel();
        let (registration, effects) = pool.begin_check_out(None, now, tx2);
        assert!(matches!(registration, Registration::Queued(_)));
        assert!(effects.establish.is_empty());
        assert_eq!(pool.waiting(), 1);

        let effects = pool.check_in(conn, false, now);
        assert_eq!(names(&effects), vec!["CheckedIn"]);
        assert_eq!(effects.handoffs.len(), 1);
        assert_eq!(effects.handoffs[0].1.id(), first_id);
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn test_wait_queue_full() {
        let mut pool = inner(PoolOptions::new().max_pool_size(1).wait_queue_size(1));
        let now = Instant::now();

        let (tx1, _rx1) = oneshot::channel();
        let (_, _) = pool.begin_check_out(None, now, tx1);
        let (tx2, _rx2) = oneshot::channel();
        let (second, _) = pool.begin_check_out(None, now, tx2);
        assert!(matches!(second, Registration::Queued(_)));

        let (tx3, _rx3) = oneshot::channel();
        let (third, _) = pool.begin_check_out(None, now, tx3);
        match third {
            Registration::Failed(err) => {
                assert!(matches!(err, PoolError::WaitQueueFull { limit: 1, .. }))
            }
            _ => panic!("expected WaitQueueFull"),
        }
    }

    #[tokio::test]
    async fn test_max_connecting_bounds_attempts() {
        let mut pool = inner(PoolOptions::new().max_pool_size(10).max_connecting(2));
        let now = Instant::now();
        let mut receivers = Vec::new();
        let mut attempts = 0;

        for _ in 0..5 {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            let (_, effects) = pool.begin_check_out(None, now, tx);
            attempts += effects.establish.len();
        }
        assert_eq!(attempts, 2);
        assert_eq!(pool.establishing(), 2);
        assert_eq!(pool.waiting(), 5);
    }

    #[tokio::test]
    async fn test_failed_attempt_goes_to_its_requester() {
        let mut pool = inner(PoolOptions::new());
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let (_, effects) = pool.begin_check_out(None, now, tx);
        let attempt = effects.establish[0];

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let mut effects = pool.complete_attempt(attempt, Err(refused.into()), Duration::ZERO, now);
        assert_eq!(effects.failures.len(), 1);
        let (tx, err) = effects.failures.pop().unwrap();
        assert!(matches!(err, PoolError::Connection { .. }));
        let _ = tx.send(Err(err));
        assert!(matches!(rx.try_recv(), Ok(Err(PoolError::Connection { .. }))));
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_clear_retires_ready_and_fails_waiters() {
        let mut pool = inner(PoolOptions::new().max_pool_size(1));
        let mut servers = Vec::new();
        let now = Instant::now();

        let (tx, _rx) = oneshot::channel();
        let (_, effects) = pool.begin_check_out(None, now, tx);
        let mut done = establish_all(&mut pool, effects, &mut servers);
        let (_, conn) = done.remove(0).handoffs.pop().unwrap();
        let token = conn.interrupt_token();

        let (tx2, _rx2) = oneshot::channel();
        let _ = pool.begin_check_out(None, now, tx2);

        let (cleared, effects) = pool.clear(&ClearRequest::new().interrupt_in_use(true), now);
        assert!(cleared);
        assert_eq!(names(&effects), vec!["Clearing", "Cleared"]);
        assert_eq!(effects.failures.len(), 1);
        assert!(matches!(
            effects.failures[0].1,
            PoolError::PoolCleared { generation: 1, .. }
        ));
        assert!(token.is_cancelled());

        let effects = pool.check_in(conn, false, now);
        assert_eq!(effects.closes.len(), 1);
        assert_eq!(effects.closes[0].1, ConnectionRemovedReason::Stale);
    }

    #[tokio::test]
    async fn test_stale_check_in_is_closed_and_replaced() {
        let mut pool = inner(PoolOptions::new().min_pool_size(1));
        let mut servers = Vec::new();
        let now = Instant::now();
        let (_, effects) = pool.mark_ready(now);
        assert_eq!(effects.establish.len(), 1);
        establish_all(&mut pool, effects, &mut servers);
        assert_eq!(pool.available(), 1);

        let (tx, _rx) = oneshot::channel();
        let (registration, _) = pool.begin_check_out(None, now, tx);
        let Registration::Immediate(conn) = registration else {
            panic!("expected a ready connection");
        };

        let (_, effects) = pool.clear(&ClearRequest::new(), now);
        assert!(effects.establish.is_empty());

        let effects = pool.check_in(conn, false, now);
        assert_eq!(effects.closes.len(), 1);
        assert_eq!(effects.closes[0].1, ConnectionRemovedReason::Stale);
        assert_eq!(effects.establish.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_if_generation_deduplicates() {
        let mut pool = inner(PoolOptions::new());
        let now = Instant::now();

        assert!(pool.clear(&ClearRequest::new().if_generation(0), now).0);
        assert!(!pool.clear(&ClearRequest::new().if_generation(0), now).0);
        assert_eq!(pool.generation(None), 1);
    }

    #[tokio::test]
    async fn test_service_clear_leaves_other_services() {
        let s1 = ServiceId::from_bytes([1; 12]);
        let s2 = ServiceId::from_bytes([2; 12]);
        let mut pool = inner(PoolOptions::new());
        let now = Instant::now();
        let mut servers = Vec::new();

        for service in [s1, s2] {
            let (tx, _rx) = oneshot::channel();
            let (_, effects) = pool.begin_check_out(Some(service), now, tx);
            for attempt in effects.establish {
                let (est, server) = established();
                servers.push(server);
                let done = pool.complete_attempt(
                    attempt,
                    Ok(est.with_service_id(service)),
                    Duration::ZERO,
                    now,
                );
                let (_, conn) = done.handoffs.into_iter().next().unwrap();
                let _ = pool.check_in(conn, false, now);
            }
        }
        assert_eq!(pool.available(), 2);

        let (_, effects) = pool.clear(&ClearRequest::new().service(s1), now);
        assert_eq!(effects.closes.len(), 1);
        assert_eq!(effects.closes[0].0.service_id(), Some(&s1));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.generation(Some(&s1)), 1);
        assert_eq!(pool.generation(Some(&s2)), 0);
    }

    #[tokio::test]
    async fn test_establishment_straddling_clear_is_stale() {
        let mut pool = inner(PoolOptions::new());
        let now = Instant::now();

        let (tx, _rx) = oneshot::channel();
        let (_, effects) = pool.begin_check_out(None, now, tx);
        let attempt = effects.establish[0];
        let (_, cleared) = pool.clear(&ClearRequest::new(), now);
        assert_eq!(cleared.failures.len(), 1);

        let (est, _server) = established();
        let effects = pool.complete_attempt(attempt, Ok(est), Duration::ZERO, now);
        assert_eq!(effects.closes.len(), 1);
        assert_eq!(effects.closes[0].1, ConnectionRemovedReason::Stale);
        assert_eq!(pool.total(), 0);
    }

    #[tokio::test]
    async fn test_mark_paused_never_leaves_ready() {
        let mut pool = inner(PoolOptions::new());
        assert!(pool.mark_paused());
        assert!(pool.mark_ready(Instant::now()).0);
        assert!(!pool.mark_paused());
        assert_eq!(pool.state(), PoolState::Ready);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_drains_ready() {
        let mut pool = inner(PoolOptions::new().max_pool_size(1));
        let mut servers = Vec::new();
        let now = Instant::now();

        let (tx, _rx) = oneshot::channel();
        let (_, effects) = pool.begin_check_out(None, now, tx);
        let mut done = establish_all(&mut pool, effects, &mut servers);
        let (_, conn) = done.remove(0).handoffs.pop().unwrap();
        let _ = pool.check_in(conn, false, now);

        let (tx, _rx) = oneshot::channel();
        let (registration, _) = pool.begin_check_out(None, now, tx);
        let Registration::Immediate(conn) = registration else {
            panic!("expected a ready connection");
        };
        let (tx, _rx) = oneshot::channel();
        let _ = pool.begin_check_out(None, now, tx);

        let (closed, effects) = pool.close();
        assert!(closed);
        assert_eq!(effects.failures.len(), 1);
        assert!(!pool.close().0);

        let effects = pool.check_in(conn, false, now);
        assert_eq!(effects.closes[0].1, ConnectionRemovedReason::PoolClosed);
        assert_eq!(pool.total(), 0);

        let (tx, _rx) = oneshot::channel();
        let (registration, _) = pool.begin_check_out(None, now, tx);
        assert!(matches!(
            registration,
            Registration::Failed(PoolError::PoolClosed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintain_respects_min_pool_size() {
        let mut pool = inner(
            PoolOptions::new()
                .min_pool_size(1)
                .max_idle_time(Duration::from_secs(1)),
        );
        let mut servers = Vec::new();
        let now = Instant::now();
        let (_, effects) = pool.mark_ready(now);
        establish_all(&mut pool, effects, &mut servers);

        // Check out three connections, then return them all.
        let mut conns = Vec::new();
        for _ in 0..3 {
            let (tx, _rx) = oneshot::channel();
            let (registration, effects) = pool.begin_check_out(None, now, tx);
            if let Registration::Immediate(conn) = registration {
                conns.push(conn);
            }
            for done in establish_all(&mut pool, effects, &mut servers) {
                conns.extend(done.handoffs.into_iter().map(|(_, c)| c));
            }
        }
        for conn in conns {
            let _ = pool.check_in(conn, false, now);
        }
        let before = pool.available();
        assert!(before >= 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let effects = pool.maintain(Instant::now());
        assert_eq!(effects.closes.len(), before - 1);
        assert!(
            effects
                .closes
                .iter()
                .all(|(_, r)| *r == ConnectionRemovedReason::Idle)
        );
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_up_backs_off_after_failure() {
        let mut pool = inner(PoolOptions::new().min_pool_size(1));
        let now = Instant::now();
        let (_, effects) = pool.mark_ready(now);
        let attempt = effects.establish[0];
        assert!(!attempt.for_waiter);

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let effects = pool.complete_attempt(attempt, Err(refused.into()), Duration::ZERO, now);
        assert!(effects.establish.is_empty());
        assert_eq!(effects.resume_top_up_at, Some(now + TOP_UP_BACKOFF_BASE));
        assert!(pool.maintain(now).establish.is_empty());

        tokio::time::advance(TOP_UP_BACKOFF_BASE).await;
        assert_eq!(pool.maintain(Instant::now()).establish.len(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = TopUpBackoff::default();
        let now = Instant::now();
        assert!(backoff.allows(now));
        assert_eq!(backoff.record_failure(now), TOP_UP_BACKOFF_BASE);
        assert_eq!(backoff.record_failure(now), TOP_UP_BACKOFF_BASE * 2);
        for _ in 0..20 {
            backoff.record_failure(now);
        }
        assert_eq!(backoff.record_failure(now), TOP_UP_BACKOFF_MAX);
        assert!(!backoff.allows(now));
        backoff.record_success();
        assert!(backoff.allows(now));
    }
}
