#![no_main]

use docdb_driver_pool::{ServerAddress, ServiceId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: &str| {
    // Brackets inside a host cannot be written back unambiguously.
    if let Ok(address) = ServerAddress::parse(input) {
        if !address.host().contains(['[', ']']) {
            let reparsed = ServerAddress::parse(&address.to_string());
            assert_eq!(reparsed.ok(), Some(address));
        }
    }

    if let Ok(service) = input.parse::<ServiceId>() {
        assert_eq!(service.to_string().parse::<ServiceId>().ok(), Some(service));
    }
});
