//! Pooled physical connections.

use std::fmt;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::address::{ConnectionId, ServiceId};
use crate::connector::{Established, Transport};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Established but not yet placed in the pool or handed out.
    Pending,
    /// Owned by the pool and available for checkout.
    Ready,
    /// Owned by a caller.
    InUse,
    /// Closed; never reused.
    Closed,
}

/// One physical link to a server.
///
/// Not safe for concurrent use; ownership moves between the pool (while
/// ready) and exactly one caller (while in use).
pub struct Connection {
    id: ConnectionId,
    generation: u32,
    service_id: Option<ServiceId>,
    created_at: Instant,
    last_used_at: Instant,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    interrupt: CancellationToken,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, generation: u32, established: Established) -> Self {
        let now = Instant::now();
        Self {
            id,
            generation,
            service_id: established.service_id,
            created_at: now,
            last_used_at: now,
            state: ConnectionState::Pending,
            transport: established.transport,
            interrupt: CancellationToken::new(),
        }
    }

    /// Pool-local id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Generation the connection was created under. Never changes.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Service this connection is bound to, if load balanced.
    #[must_use]
    pub fn service_id(&self) -> Option<&ServiceId> {
        self.service_id.as_ref()
    }

    /// When the connection was established.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last returned to the pool.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The underlying stream.
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Check whether the pool asked users of this connection to abort.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Wait until the pool interrupts this connection.
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await;
    }

    pub(crate) fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub(crate) fn matches(&self, service_id: Option<&ServiceId>) -> bool {
        match service_id {
            Some(wanted) => self.service_id.as_ref() == Some(wanted),
            None => true,
        }
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub(crate) fn is_idle_expired(&self, now: Instant, max_idle: Option<Duration>) -> bool {
        max_idle.is_some_and(|max| self.idle_for(now) > max)
    }

    pub(crate) fn is_life_expired(&self, now: Instant, max_life: Option<Duration>) -> bool {
        max_life.is_some_and(|max| now.saturating_duration_since(self.created_at) > max)
    }

    pub(crate) fn mark_ready(&mut self, now: Instant) {
        self.state = ConnectionState::Ready;
        self.last_used_at = now;
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = ConnectionState::InUse;
    }

    /// Shut the stream down and mark the connection closed.
    ///
    /// Errors are logged; a connection being discarded has nothing left to report to.
    pub(crate) async fn close(mut self) {
        self.state = ConnectionState::Closed;
        self.interrupt.cancel();
        if let Err(e) = self.transport.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "error shutting down connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("service_id", &self.service_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    fn connection(service: Option<ServiceId>) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64);
        let mut established = Established::new(client);
        established.service_id = service;
        (Connection::new(ConnectionId(1), 0, established), server)
    }

    #[tokio::test]
    async fn test_service_matching() {
        let service = ServiceId::from_bytes([1; 12]);
        let (plain, _s1) = connection(None);
        let (bound, _s2) = connection(Some(service));

        assert!(plain.matches(None));
        assert!(!plain.matches(Some(&service)));
        assert!(bound.matches(None));
        assert!(bound.matches(Some(&service)));
        assert!(!bound.matches(Some(&ServiceId::from_bytes([2; 12]))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_and_life_expiry() {
        let (mut conn, _server) = connection(None);
        conn.mark_ready(Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        let now = Instant::now();
        assert!(conn.is_idle_expired(now, Some(Duration::from_secs(4))));
        assert!(!conn.is_idle_expired(now, Some(Duration::from_secs(6))));
        assert!(!conn.is_idle_expired(now, None));
        assert!(conn.is_life_expired(now, Some(Duration::from_secs(1))));

        conn.mark_ready(now);
        assert!(!conn.is_idle_expired(now, Some(Duration::from_secs(4))));
        assert!(conn.is_life_expired(now, Some(Duration::from_secs(1))));
    }

    #[tokio::test]
    async fn test_close_shuts_down_stream_and_interrupts() {
        let (conn, mut server) = connection(None);
        let token = conn.interrupt_token();
        assert_eq!(conn.state(), ConnectionState::Pending);

        conn.close().await;
        assert!(token.is_cancelled());

        let mut buf = Vec::new();
        let read = server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
