//! Fuzz target for change-feed sequence parsing.
//!
//! This tests that `parse_seq` and `seq_of` never panic on arbitrary input
//! and that both forms of a sequence agree.

#![no_main]

use libfuzzer_sys::fuzz_target;
use livesync_replicator::model::{parse_seq, seq_of};
use serde_json::Value;

fuzz_target!(|data: &str| {
    // Should never panic
    let n = parse_seq(data);
    assert_eq!(seq_of(&Value::String(data.to_string())), n);

    // The numeric form round-trips through the string form
    assert_eq!(parse_seq(&format!("{}-{}", n, data)), n);
});
