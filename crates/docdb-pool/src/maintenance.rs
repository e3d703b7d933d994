//! Periodic pool maintenance.
//!
//! One task per Ready pool. Each tick reaps idle, expired and stale ready
//! connections and tops the pool up to `minPoolSize`. The task holds only a
//! weak reference so an abandoned pool is not kept alive by its own
//! housekeeping.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pool::Shared;

pub(crate) fn spawn(shared: &Arc<Shared>) {
    let Ok(handle) = Handle::try_current() else {
        tracing::warn!(
            address = %shared.address(),
            "no async runtime available, pool maintenance disabled"
        );
        return;
    };
    let weak = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    let interval = shared.options.maintenance_interval;
    handle.spawn(run(weak, shutdown, interval));
}

async fn run(pool: Weak<Shared>, shutdown: CancellationToken, interval: Duration) {
    let Some(first_tick) = Instant::now().checked_add(interval) else {
        // An interval that never elapses leaves only shutdown to wait for.
        shutdown.cancelled().await;
        return;
    };
    let mut ticker = tokio::time::interval_at(first_tick, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = pool.upgrade() else {
            break;
        };
        shared.maintain().await;
    }

    tracing::trace!("pool maintenance stopped");
}

/// Resume population once a failed background establishment's back-off
/// expires, instead of at the next tick.
pub(crate) fn schedule_top_up(shared: &Arc<Shared>, at: Instant) {
    let Ok(handle) = Handle::try_current() else {
        return;
    };
    let weak = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    handle.spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep_until(at) => {
                if let Some(shared) = weak.upgrade() {
                    shared.maintain().await;
                }
            }
        }
    });
}
