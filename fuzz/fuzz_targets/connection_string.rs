#![no_main]

use docdb_driver_pool::PoolOptions;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    // Anything the parser accepts must already be valid.
    if let Ok(options) = PoolOptions::from_connection_string(input) {
        assert!(options.validate().is_ok());
        assert!(options.min_pool_size <= options.max_pool_size);
    }
});
