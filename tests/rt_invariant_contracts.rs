//! Contract tests for RT invariant signaling.
//!
//! Drive deterministic play cycles through the realtime side and check that
//! the walker signals the facts the control thread relies on.

use recall_graph::harness::TickHarness;
use recall_graph::invariant_rt::{
    contract_test_rt, INV_CANCELED_PRUNED, INV_CONTENTION_SKIPPED, INV_FAILURE_CONTAINED,
    INV_INVOCATION_DRAINED, INV_PLAY_CYCLE_CLEAN, INV_TICK_DISPATCHED,
};
use recall_graph::{
    Behavior, BehaviorDef, BehaviorError, DeviceFlags, DeviceId, EngineConfig, Purpose,
    PurposeSet, RecallScope, Stage, StageContext, StageOutcome,
};
use std::sync::Arc;

struct Idle;

impl BehaviorDef for Idle {
    type State = ();

    fn init_state(&self, _samplerate: u32, _buffer_size: usize) {}

    fn run_stage(&self, _state: &mut (), _cx: &StageContext<'_>) -> Result<StageOutcome, BehaviorError> {
        Ok(StageOutcome::Continue)
    }
}

struct Panicky;

impl BehaviorDef for Panicky {
    type State = ();

    fn init_state(&self, _samplerate: u32, _buffer_size: usize) {}

    fn run_stage(&self, _state: &mut (), cx: &StageContext<'_>) -> Result<StageOutcome, BehaviorError> {
        if cx.stage == Stage::Play {
            panic!("play callback exploded");
        }
        Ok(StageOutcome::Continue)
    }
}

fn harness(behavior: &str) -> (TickHarness, DeviceId) {
    let mut h = TickHarness::new(EngineConfig::default());
    h.engine
        .register_behavior_factory("idle", || Arc::new(Idle) as Arc<dyn Behavior>);
    h.engine
        .register_behavior_factory("panicky", || Arc::new(Panicky) as Arc<dyn Behavior>);
    let dev = h.engine.add_device(DeviceFlags::default(), 1, 1, 1).unwrap();
    h.engine
        .add_template(dev, behavior, RecallScope::Play, PurposeSet::ALL)
        .unwrap();
    (h, dev)
}

#[test]
fn contract_clean_cycles_are_signaled() {
    let (mut h, dev) = harness("idle");
    h.engine.start_device(dev, Purpose::Playback).unwrap();
    h.run_ticks(dev, 0, 10);

    let signals = h.signals();
    contract_test_rt(
        "clean play cycles",
        &signals,
        &[INV_PLAY_CYCLE_CLEAN, INV_TICK_DISPATCHED],
    );
    let clean = signals.iter().filter(|&&id| id == INV_PLAY_CYCLE_CLEAN).count();
    assert_eq!(clean, 10);
    assert!(!signals.contains(&INV_FAILURE_CONTAINED));
}

#[test]
fn contract_no_dispatch_without_invocations() {
    let (mut h, dev) = harness("idle");
    h.run_ticks(dev, 0, 3);
    let signals = h.signals();
    assert!(!signals.contains(&INV_TICK_DISPATCHED));
    assert!(!signals.contains(&INV_PLAY_CYCLE_CLEAN));
}

#[test]
fn contract_panic_is_contained() {
    let (mut h, dev) = harness("panicky");
    h.engine.start_device(dev, Purpose::Playback).unwrap();
    let first = h.run_ticks(dev, 0, 1);
    let second = h.run_ticks(dev, 0, 1);
    assert!(!first.aborted && !second.aborted);
    assert_eq!(first.stage.failed, 1);
    assert_eq!(second.stage.pruned, 1);

    contract_test_rt(
        "panic contained",
        &h.signals(),
        &[INV_FAILURE_CONTAINED, INV_PLAY_CYCLE_CLEAN],
    );
}

#[test]
fn contract_cancel_prunes_and_drains() {
    let (mut h, dev) = harness("idle");
    let groups = h.engine.start_device(dev, Purpose::Playback).unwrap();
    h.run_ticks(dev, 0, 1);
    h.engine.cancel(groups[0]).unwrap();
    h.run_ticks(dev, 0, 2);

    let signals = h.signals();
    contract_test_rt(
        "cancel drains",
        &signals,
        &[INV_CANCELED_PRUNED, INV_INVOCATION_DRAINED],
    );
    // Drained once, then skipped.
    let drained = signals.iter().filter(|&&id| id == INV_INVOCATION_DRAINED).count();
    assert_eq!(drained, 1);
}

#[test]
fn contract_signals_are_known_ids() {
    let (mut h, dev) = harness("idle");
    h.engine.start_device(dev, Purpose::Playback).unwrap();
    h.run_ticks(dev, 0, 1000);
    let signals = h.signals();
    assert!(!signals.is_empty());
    for &id in &signals {
        assert!(
            id == INV_PLAY_CYCLE_CLEAN || id == INV_TICK_DISPATCHED || id == INV_CONTENTION_SKIPPED,
            "unexpected invariant id {id}"
        );
    }
}
