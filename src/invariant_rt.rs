//! RT-safe invariant signaling for the walker's realtime path.
//!
//! This module provides a two-tier invariant system:
//! - **Tier 1 (RT-safe)**: Lock-free signaling of invariant IDs from the play cycle
//! - **Tier 2 (Non-RT)**: Verification and contract testing on the control thread
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! Unlike `assert_invariant`, which locks, signaling here never allocates,
//! never locks and never panics; a full queue drops the signal.

use rtrb::{Consumer, Producer, RingBuffer};

// ============================================================================
// RT-Safe Invariant IDs (Tier 1)
// ============================================================================

/// A play cycle ran to completion without an uncontained panic.
pub const INV_PLAY_CYCLE_CLEAN: u8 = 1;

/// A failing or panicking behavior was contained at the instance boundary.
pub const INV_FAILURE_CONTAINED: u8 = 2;

/// Instances of a canceled group were pruned at a stage boundary.
pub const INV_CANCELED_PRUNED: u8 = 3;

/// A canceled top-level invocation was fully drained.
pub const INV_INVOCATION_DRAINED: u8 = 4;

/// A play callback was skipped because its state was locked elsewhere.
pub const INV_CONTENTION_SKIPPED: u8 = 5;

/// A device tick found at least one invocation to play.
pub const INV_TICK_DISPATCHED: u8 = 6;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Default capacity for the invariant signal queue.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair.
///
/// Returns (producer for RT, consumer for the control thread).
pub fn new_invariant_queue(capacity: usize) -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(capacity)
}

/// Signals an invariant was checked in the RT path.
///
/// If the queue is full the signal is dropped.
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Contract verification: asserts that required invariants were signaled.
///
/// # Panics
/// Panics if any required invariant was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: Vec<&str> = signals
            .iter()
            .map(|&id| invariant_name(id))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_PLAY_CYCLE_CLEAN => "PLAY_CYCLE_CLEAN",
        INV_FAILURE_CONTAINED => "FAILURE_CONTAINED",
        INV_CANCELED_PRUNED => "CANCELED_PRUNED",
        INV_INVOCATION_DRAINED => "INVOCATION_DRAINED",
        INV_CONTENTION_SKIPPED => "CONTENTION_SKIPPED",
        INV_TICK_DISPATCHED => "TICK_DISPATCHED",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_queue_roundtrip() {
        let (mut tx, mut rx) = new_invariant_queue(INVARIANT_QUEUE_CAPACITY);
        signal_invariant(&mut tx, INV_PLAY_CYCLE_CLEAN);
        signal_invariant(&mut tx, INV_CANCELED_PRUNED);
        signal_invariant(&mut tx, INV_PLAY_CYCLE_CLEAN);

        let signals = drain_invariant_signals(&mut rx);
        assert_eq!(
            signals,
            vec![INV_PLAY_CYCLE_CLEAN, INV_CANCELED_PRUNED, INV_PLAY_CYCLE_CLEAN]
        );
        let counts = count_invariant_signals(&signals);
        assert_eq!(counts[INV_PLAY_CYCLE_CLEAN as usize], 2);
        assert_eq!(counts[INV_FAILURE_CONTAINED as usize], 0);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn test_contract_fails_when_invariants_missing() {
        contract_test_rt(
            "incomplete contract",
            &[INV_PLAY_CYCLE_CLEAN],
            &[INV_PLAY_CYCLE_CLEAN, INV_INVOCATION_DRAINED],
        );
    }

    #[test]
    fn test_queue_handles_overflow_gracefully() {
        let (mut tx, mut rx) = new_invariant_queue(16);
        for _ in 0..40 {
            signal_invariant(&mut tx, INV_PLAY_CYCLE_CLEAN);
        }
        assert_eq!(drain_invariant_signals(&mut rx).len(), 16);
    }

    #[test]
    fn test_invariant_names() {
        assert_eq!(invariant_name(INV_FAILURE_CONTAINED), "FAILURE_CONTAINED");
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
