//! FIFO queue of blocked checkout requests.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::address::ServiceId;
use crate::error::PoolError;
use crate::pool::PooledConnection;

pub(crate) type CheckoutResult = Result<PooledConnection, PoolError>;

/// A checkout request waiting for a connection.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) service_id: Option<ServiceId>,
    pub(crate) requested_at: Instant,
    /// Establishment started on behalf of this request, if any.
    pub(crate) attempt: Option<u64>,
    pub(crate) tx: oneshot::Sender<CheckoutResult>,
}

impl Waiter {
    /// The caller stopped listening (timed out, cancelled or dropped).
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    fn accepts(&self, service_id: Option<&ServiceId>) -> bool {
        match &self.service_id {
            Some(wanted) => service_id == Some(wanted),
            None => true,
        }
    }
}

/// Waiters in arrival order.
///
/// Requests with an establishment attempt of their own are kept in the same
/// order but do not count against the configured queue capacity: the queue
/// limit applies to requests blocked on capacity only.
#[derive(Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn push(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    /// Number of requests whose caller is still listening.
    pub(crate) fn len(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_abandoned()).count()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Number of live requests blocked on capacity.
    pub(crate) fn queued(&self) -> usize {
        self.waiters
            .iter()
            .filter(|w| w.attempt.is_none() && !w.is_abandoned())
            .count()
    }

    /// Remove a request by id. Returns `None` if it was already served.
    pub(crate) fn remove(&mut self, id: u64) -> Option<Waiter> {
        // Waiters that give up are usually near the front.
        let index = self.waiters.iter().position(|w| w.id == id)?;
        self.waiters.remove(index)
    }

    /// Drop requests whose caller is gone.
    pub(crate) fn prune_abandoned(&mut self) {
        self.waiters.retain(|w| !w.is_abandoned());
    }

    /// Take the longest-waiting request that accepts a connection of `service_id`.
    pub(crate) fn pop_eligible(&mut self, service_id: Option<&ServiceId>) -> Option<Waiter> {
        let index = self
            .waiters
            .iter()
            .position(|w| !w.is_abandoned() && w.accepts(service_id))?;
        self.waiters.remove(index)
    }

    /// Take the request an establishment attempt was started for.
    pub(crate) fn pop_attempt(&mut self, attempt: u64) -> Option<Waiter> {
        let index = self
            .waiters
            .iter()
            .position(|w| w.attempt == Some(attempt))?;
        self.waiters.remove(index)
    }

    /// Oldest request that has no establishment of its own.
    pub(crate) fn oldest_without_attempt(&self) -> Option<u64> {
        self.waiters
            .iter()
            .find(|w| w.attempt.is_none() && !w.is_abandoned())
            .map(|w| w.id)
    }

    /// Record that an establishment was started on behalf of a request.
    pub(crate) fn assign_attempt(&mut self, id: u64, attempt: u64) -> bool {
        match self.waiters.iter_mut().find(|w| w.id == id) {
            Some(waiter) => {
                waiter.attempt = Some(attempt);
                true
            }
            None => false,
        }
    }

    /// Give an attempt whose requester was served otherwise to the oldest
    /// request without one.
    pub(crate) fn adopt_attempt(&mut self, attempt: u64) {
        if let Some(waiter) = self
            .waiters
            .iter_mut()
            .find(|w| w.attempt.is_none() && !w.is_abandoned())
        {
            waiter.attempt = Some(attempt);
        }
    }

    /// Forget an attempt that finished or never started.
    pub(crate) fn unassign_attempt(&mut self, attempt: u64) {
        if let Some(waiter) = self.waiters.iter_mut().find(|w| w.attempt == Some(attempt)) {
            waiter.attempt = None;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Waiter> {
        self.waiters.iter()
    }

    /// Remove every request matching the predicate.
    pub(crate) fn drain_where(&mut self, mut pred: impl FnMut(&Waiter) -> bool) -> Vec<Waiter> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if pred(&waiter) {
                drained.push(waiter);
            } else {
                kept.push_back(waiter);
            }
        }
        self.waiters = kept;
        drained
    }
}
