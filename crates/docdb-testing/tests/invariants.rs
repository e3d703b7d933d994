//! Property tests for pool accounting.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use docdb_driver_pool::{CheckoutOptions, ClearRequest, PoolError, PoolOptions, PooledConnection};
use docdb_testing::{EventRecorder, MockConnector, mock_pool};
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::task::JoinSet;

const MAX_POOL_SIZE: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Get,
    Release(usize),
    Discard(usize),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Get),
        3 => any::<usize>().prop_map(Op::Release),
        1 => any::<usize>().prop_map(Op::Discard),
        1 => Just(Op::Clear),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pool_accounting_holds(ops in proptest::collection::vec(op(), 1..40)) {
        let rt = paused_runtime();
        rt.block_on(async {
            let connector = MockConnector::new();
            let recorder = EventRecorder::new();
            let pool = mock_pool(
                PoolOptions::new().max_pool_size(MAX_POOL_SIZE),
                &connector,
                &recorder,
            )
            .unwrap();
            let mut held: Vec<PooledConnection> = Vec::new();

            for op in ops {
                match op {
                    Op::Get => {
                        let result = pool
                            .check_out(CheckoutOptions::new().timeout(Duration::from_millis(10)))
                            .await;
                        match result {
                            Ok(conn) => held.push(conn),
                            Err(err) => {
                                prop_assert!(err.is_timeout(), "{err}");
                                prop_assert_eq!(held.len(), MAX_POOL_SIZE);
                            }
                        }
                    }
                    Op::Release(n) if !held.is_empty() => {
                        let conn = held.remove(n % held.len());
                        drop(conn);
                    }
                    Op::Discard(n) if !held.is_empty() => {
                        held.remove(n % held.len()).discard();
                    }
                    Op::Clear => {
                        pool.clear(ClearRequest::new());
                    }
                    _ => {}
                }

                let status = pool.status();
                prop_assert!(status.total <= MAX_POOL_SIZE, "{status:?}");
                prop_assert_eq!(status.in_use, held.len());
                prop_assert_eq!(
                    status.total,
                    status.available + status.in_use + status.establishing
                );
                prop_assert_eq!(status.waiting, 0);
            }

            // Every connection handed out is distinct.
            let mut ids: Vec<_> = held.iter().map(|c| c.id()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), held.len());
            Ok(())
        })?;
    }

    #[test]
    fn prop_min_pool_size_bounded_by_max(max in 1usize..1000, min in 0usize..1000) {
        let uri = format!("docdb://db1/?maxPoolSize={max}&minPoolSize={min}");
        let result = PoolOptions::from_connection_string(&uri);
        prop_assert_eq!(result.is_ok(), min <= max);
        if let Ok(options) = result {
            prop_assert_eq!(options.max_pool_size, max);
            prop_assert_eq!(options.min_pool_size, min);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkouts_respect_capacity() {
    const WORKERS: usize = 16;
    const ROUNDS: usize = 50;

    let connector = MockConnector::new().with_delay(Duration::from_millis(1));
    let recorder = EventRecorder::new();
    let pool = mock_pool(
        PoolOptions::new()
            .max_pool_size(MAX_POOL_SIZE)
            .max_connecting(2),
        &connector,
        &recorder,
    )
    .unwrap();
    pool.mark_ready();

    let held = Arc::new(Mutex::new(HashSet::new()));
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let pool = pool.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut samples = 0usize;
            while !done.load(Ordering::Acquire) {
                let status = pool.status();
                assert!(status.total <= MAX_POOL_SIZE, "{status:?}");
                assert!(status.in_use <= MAX_POOL_SIZE, "{status:?}");
                assert!(status.establishing <= 2, "{status:?}");
                samples += 1;
                tokio::task::yield_now().await;
            }
            samples
        })
    };

    let mut workers = JoinSet::new();
    for worker in 0..WORKERS {
        let pool = pool.clone();
        let held = Arc::clone(&held);
        workers.spawn(async move {
            for round in 0..ROUNDS {
                let conn = match pool.get().await {
                    Ok(conn) => conn,
                    // A concurrent clear fails requests that were waiting.
                    Err(PoolError::PoolCleared { .. }) => continue,
                    Err(err) => panic!("unexpected checkout failure: {err}"),
                };
                let id = conn.id();
                assert!(held.lock().insert(id), "{id} handed to two callers");
                assert!(held.lock().len() <= MAX_POOL_SIZE);
                tokio::task::yield_now().await;

                if (worker + round) % 11 == 0 {
                    pool.clear(ClearRequest::new());
                }
                held.lock().remove(&id);
                if round % 5 == 0 {
                    conn.discard();
                } else {
                    drop(conn);
                }
            }
        });
    }
    while let Some(result) = workers.join_next().await {
        result.unwrap();
    }

    done.store(true, Ordering::Release);
    assert!(observer.await.unwrap() > 0);

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.waiting, 0);
    assert!(status.total <= MAX_POOL_SIZE);
    pool.close().await;
}
