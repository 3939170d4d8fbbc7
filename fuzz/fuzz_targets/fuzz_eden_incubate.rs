//! Fuzz target for chunk incubation.
//!
//! Arbitrary chunk sizes and bounds must never panic, and the map must
//! respect every bound after each incubation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use livesync_replicator::{EdenConfig, EdenMap, EntryLeaf};

fuzz_target!(|data: (u8, u16, u8, Vec<Vec<u8>>)| {
    let (max_chunks, max_total_length, max_age, rounds) = data;
    let config = EdenConfig {
        enabled: true,
        max_chunks: usize::from(max_chunks),
        max_total_length: usize::from(max_total_length),
        max_age: u64::from(max_age),
    };

    let mut eden = EdenMap::new();
    for (epoch, sizes) in rounds.iter().enumerate() {
        let chunks = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| EntryLeaf::new(format!("h:{}-{}", epoch, i), "x".repeat(usize::from(*size))))
            .collect();
        let _ = eden.incubate(chunks, epoch as u64, &config);

        assert!(eden.len() <= config.max_chunks);
        assert!(eden.total_length() <= config.max_total_length);
    }
});
