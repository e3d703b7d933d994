//! Pool monitoring events.
//!
//! The pool publishes a [`PoolEvent`] for every lifecycle step defined by CMAP.
//! Events go to an injected [`EventHandler`]; the pool never decides where they
//! end up. Handlers are invoked outside the pool lock, but on the caller's task,
//! so they must not block.
//!
//! The serialized form uses the field names `serverHost`, `serverPort`,
//! `connectionId`, `serviceId`, `durationMs`, `reason` and `event`.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::mpsc;

use crate::address::{ConnectionId, ServerAddress, ServiceId};

/// Why a checkout failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckOutFailedReason {
    /// Establishing the connection failed, or the pool was cleared.
    ConnectionError,
    /// The pool is closed.
    PoolClosed,
    /// The wait-queue deadline elapsed.
    Timeout,
    /// The wait queue was at capacity.
    WaitQueueFull,
}

/// Why a connection was closed by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionRemovedReason {
    /// Idle longer than `maxIdleTime`.
    Idle,
    /// Generation invalidated by a clear.
    Stale,
    /// Older than `maxLifeTime`.
    Expired,
    /// Reported broken by its user.
    Error,
    /// The pool was closed.
    PoolClosed,
}

/// The lifecycle step an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum PoolEventKind {
    /// Pool construction started.
    Opening,
    /// Pool constructed (state Paused).
    Opened,
    /// Pool transitioned to Ready.
    Ready,
    /// A checkout request entered the pool.
    CheckOutStarted,
    /// A checkout request received a connection.
    CheckedOut,
    /// A checkout request failed.
    CheckOutFailed {
        /// Failure reason.
        reason: CheckOutFailedReason,
    },
    /// A connection was returned to the pool.
    CheckedIn,
    /// A new connection finished establishment.
    ConnectionAdded,
    /// A connection was closed.
    ConnectionRemoved {
        /// Removal reason.
        reason: ConnectionRemovedReason,
    },
    /// A clear started.
    Clearing,
    /// A clear finished.
    Cleared {
        /// Whether stale in-use connections were signalled.
        #[serde(rename = "interruptInUseConnections")]
        interrupt_in_use: bool,
    },
    /// Pool shutdown started.
    Closing,
    /// Pool shutdown finished.
    Closed,
}

impl PoolEventKind {
    /// Short name of the event kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opening => "Opening",
            Self::Opened => "Opened",
            Self::Ready => "Ready",
            Self::CheckOutStarted => "CheckOutStarted",
            Self::CheckedOut => "CheckedOut",
            Self::CheckOutFailed { .. } => "CheckOutFailed",
            Self::CheckedIn => "CheckedIn",
            Self::ConnectionAdded => "ConnectionAdded",
            Self::ConnectionRemoved { .. } => "ConnectionRemoved",
            Self::Clearing => "Clearing",
            Self::Cleared { .. } => "Cleared",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for PoolEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable record of one pool lifecycle step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEvent {
    /// What happened.
    #[serde(flatten)]
    pub kind: PoolEventKind,
    /// Host of the server the pool belongs to.
    pub server_host: String,
    /// Port of the server the pool belongs to.
    pub server_port: u16,
    /// Connection concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
    /// Service scope, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    /// Elapsed time of the step, if it has one.
    #[serde(
        rename = "durationMs",
        serialize_with = "serialize_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
}

impl PoolEvent {
    pub(crate) fn new(address: &ServerAddress, kind: PoolEventKind) -> Self {
        Self {
            kind,
            server_host: address.host().to_string(),
            server_port: address.port(),
            connection_id: None,
            service_id: None,
            duration: None,
        }
    }

    pub(crate) fn with_connection(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub(crate) fn with_service(mut self, service_id: Option<ServiceId>) -> Self {
        self.service_id = service_id;
        self
    }

    pub(crate) fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Elapsed time in whole milliseconds, if the event carries one.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration.map(|d| d.as_millis() as u64)
    }

    /// Reason text for failure and removal events.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        match self.kind {
            PoolEventKind::CheckOutFailed { reason } => Some(match reason {
                CheckOutFailedReason::ConnectionError => "connectionError",
                CheckOutFailedReason::PoolClosed => "poolClosed",
                CheckOutFailedReason::Timeout => "timeout",
                CheckOutFailedReason::WaitQueueFull => "waitQueueFull",
            }),
            PoolEventKind::ConnectionRemoved { reason } => Some(match reason {
                ConnectionRemovedReason::Idle => "idle",
                ConnectionRemovedReason::Stale => "stale",
                ConnectionRemovedReason::Expired => "expired",
                ConnectionRemovedReason::Error => "error",
                ConnectionRemovedReason::PoolClosed => "poolClosed",
            }),
            _ => None,
        }
    }
}

fn serialize_millis<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_u64(d.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

/// Receiver of pool events.
///
/// Implementations must be cheap and non-blocking.
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    fn handle(&self, event: &PoolEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&PoolEvent) + Send + Sync,
{
    fn handle(&self, event: &PoolEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel.
///
/// Events are dropped once the receiving side is gone.
impl EventHandler for mpsc::UnboundedSender<PoolEvent> {
    fn handle(&self, event: &PoolEvent) {
        let _ = self.send(event.clone());
    }
}

/// Writes every event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventHandler;

impl EventHandler for TracingEventHandler {
    fn handle(&self, event: &PoolEvent) {
        tracing::debug!(
            target: "docdb_driver_pool::events",
            event = event.kind.name(),
            server_host = %event.server_host,
            server_port = event.server_port,
            connection_id = event.connection_id.map(ConnectionId::get),
            service_id = event.service_id.map(|id| id.to_string()),
            duration_ms = event.duration_ms(),
            reason = event.reason(),
            "connection pool event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ServerAddress {
        ServerAddress::new("db1", 27018)
    }

    #[test]
    fn test_event_schema_field_names() {
        let event = PoolEvent::new(
            &addr(),
            PoolEventKind::CheckOutFailed {
                reason: CheckOutFailedReason::Timeout,
            },
        )
        .with_duration(Duration::from_millis(52));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "CheckOutFailed");
        assert_eq!(json["reason"], "timeout");
        assert_eq!(json["serverHost"], "db1");
        assert_eq!(json["serverPort"], 27018);
        assert_eq!(json["durationMs"], 52);
        assert!(json.get("connectionId").is_none());
    }

    #[test]
    fn test_event_with_connection_and_service() {
        let service: ServiceId = "000000000000000000000001".parse().unwrap();
        let event = PoolEvent::new(
            &addr(),
            PoolEventKind::ConnectionRemoved {
                reason: ConnectionRemovedReason::Stale,
            },
        )
        .with_connection(ConnectionId(7))
        .with_service(Some(service));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["connectionId"], 7);
        assert_eq!(json["serviceId"], "000000000000000000000001");
        assert_eq!(json["reason"], "stale");
        assert_eq!(event.reason(), Some("stale"));
    }

    #[test]
    fn test_cleared_event_flag() {
        let event = PoolEvent::new(
            &addr(),
            PoolEventKind::Cleared {
                interrupt_in_use: true,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "Cleared");
        assert_eq!(json["interruptInUseConnections"], true);
    }

    #[test]
    fn test_channel_handler_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.handle(&PoolEvent::new(&addr(), PoolEventKind::Ready));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, PoolEventKind::Ready);
    }

    #[test]
    fn test_closure_handler() {
        let seen = std::sync::Mutex::new(Vec::new());
        let handler = |event: &PoolEvent| seen.lock().unwrap().push(event.kind);
        handler.handle(&PoolEvent::new(&addr(), PoolEventKind::Closing));
        assert_eq!(seen.lock().unwrap().as_slice(), &[PoolEventKind::Closing]);
    }
}
