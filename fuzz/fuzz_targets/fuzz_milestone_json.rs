//! Fuzz target for milestone documents written by other nodes.
//!
//! Any JSON either fails to parse or yields a milestone that evaluates
//! without panicking and keeps its accepted nodes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use livesync_replicator::compat::evaluate;
use livesync_replicator::model::CURRENT_VERSION_RANGE;
use livesync_replicator::{MilestoneInfo, TweakValues};

fuzz_target!(|data: &[u8]| {
    let Ok(mut milestone) = serde_json::from_slice::<MilestoneInfo>(data) else {
        return;
    };
    let before = milestone.accepted_nodes.clone();

    let _ = evaluate(&mut milestone, "fuzz-node", CURRENT_VERSION_RANGE, &TweakValues::default(), false);
    for node in &before {
        assert!(milestone.is_accepted(node));
    }

    // Unknown fields survive a write
    let written = serde_json::to_value(&milestone).unwrap();
    let reread: MilestoneInfo = serde_json::from_value(written).unwrap();
    assert_eq!(reread.extra, milestone.extra);
});
