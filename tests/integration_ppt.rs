//! Control-path invariants fire across a full link, start, cancel and
//! collect cycle.

use recall_graph::invariant_ppt::{
    contract_test, CANCEL_PRUNES, CHAIN_ROUND_TRIP, CONTEXT_NO_ORPHAN, DUPLICATE_UNIQUE,
    LINK_MUTUAL, LINK_REJECTS_LOOP, PLAN_LEAF_TO_ROOT, RANGE_CONTIGUOUS,
};
use recall_graph::{
    Behavior, BehaviorDef, BehaviorError, DeviceFlags, Engine, EngineConfig, Purpose, PurposeSet,
    RecallScope, RoutingError, StageContext, StageOutcome,
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

#[test]
fn full_lifecycle_enforces_every_control_invariant() {
    let (mut engine, mut rt) = Engine::new(EngineConfig::default());
    engine.register_behavior_factory("idle", || Arc::new(Idle) as Arc<dyn Behavior>);

    let source = engine
        .add_device(DeviceFlags::default().with_output_owns_recycling(true), 1, 1, 0)
        .unwrap();
    let mixer = engine
        .add_device(DeviceFlags::default().with_input_async(true), 1, 1, 2)
        .unwrap();
    let src_out = engine.graph().device(source).unwrap().outputs[0];
    let mix_in = engine.graph().device(mixer).unwrap().inputs.clone();
    let mix_out = engine.graph().device(mixer).unwrap().outputs[0];

    engine.set_link(mix_in[0], Some(src_out)).unwrap();

    // A second mixer fed by the first cannot feed it back.
    let tail = engine.add_device(DeviceFlags::default(), 1, 1, 1).unwrap();
    let tail_in = engine.graph().device(tail).unwrap().inputs[0];
    let tail_out = engine.graph().device(tail).unwrap().outputs[0];
    engine.set_link(tail_in, Some(mix_out)).unwrap();
    assert!(matches!(
        engine.set_link(mix_in[1], Some(tail_out)),
        Err(RoutingError::Loop { .. })
    ));

    engine
        .add_template(mixer, "idle", RecallScope::Play, PurposeSet::ALL)
        .unwrap();
    let group = engine.start(tail_out, Purpose::Playback).unwrap();
    rt.play_all();
    engine.cancel(group).unwrap();
    rt.play_all();
    assert_eq!(engine.collect_garbage().destroyed, vec![group]);

    contract_test(
        "full lifecycle",
        &[
            CHAIN_ROUND_TRIP,
            RANGE_CONTIGUOUS,
            LINK_MUTUAL,
            LINK_REJECTS_LOOP,
            CONTEXT_NO_ORPHAN,
            DUPLICATE_UNIQUE,
            CANCEL_PRUNES,
            PLAN_LEAF_TO_ROOT,
        ],
    );
}
