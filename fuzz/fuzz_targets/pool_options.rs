#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use docdb_driver_pool::PoolOptions;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    max_pool_size: u16,
    min_pool_size: u16,
    max_connecting: u8,
    wait_queue_size: Option<u16>,
    connect_timeout_ms: u16,
    maintenance_interval_ms: u16,
}

fuzz_target!(|input: Input| {
    let mut options = PoolOptions::new()
        .max_pool_size(usize::from(input.max_pool_size))
        .min_pool_size(usize::from(input.min_pool_size))
        .max_connecting(usize::from(input.max_connecting))
        .connect_timeout(Duration::from_millis(u64::from(input.connect_timeout_ms)))
        .maintenance_interval(Duration::from_millis(u64::from(
            input.maintenance_interval_ms,
        )));
    if let Some(size) = input.wait_queue_size {
        options = options.wait_queue_size(usize::from(size));
    }

    let expected = input.max_pool_size > 0
        && input.min_pool_size <= input.max_pool_size
        && input.max_connecting > 0
        && input.wait_queue_size != Some(0)
        && input.connect_timeout_ms > 0
        && input.maintenance_interval_ms > 0;
    assert_eq!(options.validate().is_ok(), expected);
});
