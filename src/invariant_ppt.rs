//! PPT Invariant System: control-path invariant enforcement with contract tracking.

// Never call from the realtime path: the log takes a lock and allocates.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

// Invariant constants for contract tracking.
pub const CHAIN_ROUND_TRIP: u32 = 1;
pub const RANGE_CONTIGUOUS: u32 = 2;
pub const LINK_MUTUAL: u32 = 3;
pub const LINK_REJECTS_LOOP: u32 = 4;
pub const CONTEXT_NO_ORPHAN: u32 = 5;
pub const DUPLICATE_UNIQUE: u32 = 6;
pub const CANCEL_PRUNES: u32 = 7;
pub const PLAN_LEAF_TO_ROOT: u32 = 8;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = if let Some(ctx) = context {
            format!("Invariant {} failed: {} (context: {})", id, message, ctx)
        } else {
            format!("Invariant {} failed: {}", id, message)
        };
        tracing::error!("{full_message}");
        panic!("{}", full_message);
    }
    INVARIANT_LOG.lock().insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {}", message);
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG.lock();
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log);
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
