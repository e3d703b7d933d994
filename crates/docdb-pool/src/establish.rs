//! Background connection establishment.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::error::ConnectError;
use crate::inner::Attempt;
use crate::pool::Shared;

/// Run an attempt on the current runtime.
///
/// Without a runtime (a connection dropped on a plain thread) the attempt is
/// rolled back and left to the next dispatch.
pub(crate) fn spawn(shared: &Arc<Shared>, attempt: Attempt) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(run(Arc::clone(shared), attempt));
        }
        Err(_) => {
            tracing::debug!(
                address = %shared.address(),
                connection_id = %attempt.connection_id,
                "no async runtime available, connection establishment deferred"
            );
            shared.inner.lock().cancel_attempt(&attempt);
        }
    }
}

async fn run(shared: Arc<Shared>, attempt: Attempt) {
    let started = Instant::now();
    let timeout = shared.options.connect_timeout;

    tracing::trace!(
        address = %shared.address(),
        connection_id = %attempt.connection_id,
        for_waiter = attempt.for_waiter,
        "establishing connection"
    );

    let connect = shared.connector.connect(shared.address());
    let result = match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::TimedOut(timeout)),
    };
    let elapsed = started.elapsed();

    match &result {
        Ok(established) => tracing::debug!(
            address = %shared.address(),
            connection_id = %attempt.connection_id,
            service_id = established.service_id.map(|id| id.to_string()),
            elapsed_ms = elapsed.as_millis() as u64,
            "connection established"
        ),
        Err(e) => {
            shared.record_establishment_failure();
            // Background failures are logged with their back-off by the pool.
            if attempt.for_waiter {
                tracing::warn!(
                    address = %shared.address(),
                    connection_id = %attempt.connection_id,
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "connection establishment failed"
                );
            }
        }
    }

    let effects = shared
        .inner
        .lock()
        .complete_attempt(attempt, result, elapsed, Instant::now());
    shared.apply(effects);
}
