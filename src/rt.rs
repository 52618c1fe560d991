//! RT module: the realtime half of the engine.

// IMPORTANT: Do not call assert_invariant or any tracing macro in RT paths to avoid locks/allocs.

use crate::config::EngineConfig;
use crate::context::{GroupId, InvocationContext};
use crate::control::WalkerEvent;
use crate::error::Result;
use crate::graph::{DeviceId, Graph};
use crate::invariant_rt::{signal_invariant, INV_TICK_DISPATCHED};
use crate::states::{Phase, Stage};
use crate::walker::{StageReport, Walker};
use arc_swap::ArcSwap;
use rtrb::Producer;
use std::sync::Arc;

/// Outcome of one device tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Invocations that got a Play cycle.
    pub invocations: usize,
    /// Summed stage counters.
    pub stage: StageReport,
    /// A panic escaped the walker; the cycle was abandoned.
    pub aborted: bool,
}

/// Drives Play cycles from device ticks.
pub struct RtEngine {
    graph: Arc<ArcSwap<Graph>>,
    config: EngineConfig,
    events: Producer<WalkerEvent>,
    invariants: Producer<u8>,
}

impl RtEngine {
    pub(crate) fn new(
        graph: Arc<ArcSwap<Graph>>,
        config: EngineConfig,
        events: Producer<WalkerEvent>,
        invariants: Producer<u8>,
    ) -> Self {
        Self {
            graph,
            config,
            events,
            invariants,
        }
    }

    /// One Play cycle for every live invocation started at `device`'s
    /// output line `channel_index`.
    pub fn on_buffer_ready(&mut self, device: DeviceId, channel_index: usize) -> TickReport {
        self.tick(|graph, ctx| {
            graph
                .channel(ctx.origin)
                .is_ok_and(|ch| ch.device == device && ch.line == channel_index)
        })
    }

    /// One Play cycle for every live top-level invocation.
    pub fn play_all(&mut self) -> TickReport {
        self.tick(|_, _| true)
    }

    /// One Play cycle for `group`'s invocation.
    pub fn play(&mut self, group: GroupId) -> Result<StageReport> {
        let guard = self.graph.load();
        Walker::new(&guard, &self.config, &mut self.events)
            .with_signals(&mut self.invariants)
            .play(group)
    }

    fn tick(&mut self, wanted: impl Fn(&Graph, &InvocationContext) -> bool) -> TickReport {
        let guard = self.graph.load();
        let graph: &Graph = &guard;
        let mut report = TickReport::default();
        let (config, events, invariants) = (&self.config, &mut self.events, &mut self.invariants);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for ctx in graph.invocations() {
                let ctx: &InvocationContext = ctx;
                if !ctx.is_top_level() || ctx.is_drained() || !wanted(graph, ctx) {
                    continue;
                }
                // Not yet initialized: buffers may be missing.
                if !ctx.phase_reached(Stage::Init, Phase::Post) && !ctx.is_canceled() {
                    continue;
                }
                let mut walker = Walker::new(graph, config, &mut *events).with_signals(&mut *invariants);
                report.stage += walker.play_context(ctx);
                report.invocations += 1;
            }
        }));
        if result.is_err() {
            // Fail closed: this cycle produced nothing.
            report.aborted = true;
        } else if report.invocations > 0 {
            signal_invariant(&mut self.invariants, INV_TICK_DISPATCHED);
        }
        report
    }
}
