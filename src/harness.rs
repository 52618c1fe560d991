//! Tick Harness: drives device ticks for tests and benches.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::graph::{DeviceId, Graph};
use crate::rt::{RtEngine, TickReport};

/// Both halves of an engine on one thread, with tick helpers.
pub struct TickHarness {
    /// Control side.
    pub engine: Engine,
    /// Realtime side.
    pub rt: RtEngine,
}

impl TickHarness {
    /// Harness over an empty graph.
    pub fn new(config: EngineConfig) -> Self {
        Self::from_graph(Graph::new(), config)
    }

    /// Harness over `graph`.
    pub fn from_graph(graph: Graph, config: EngineConfig) -> Self {
        let (engine, rt) = Engine::from_graph(graph, config);
        Self { engine, rt }
    }

    /// Deliver `ticks` buffer-ready calls for one device line.
    pub fn run_ticks(&mut self, device: DeviceId, channel_index: usize, ticks: usize) -> TickReport {
        let mut total = TickReport::default();
        for _ in 0..ticks {
            accumulate(&mut total, self.rt.on_buffer_ready(device, channel_index));
        }
        total
    }

    /// Play every live invocation `ticks` times.
    pub fn play_all(&mut self, ticks: usize) -> TickReport {
        let mut total = TickReport::default();
        for _ in 0..ticks {
            accumulate(&mut total, self.rt.play_all());
        }
        total
    }

    /// Realtime invariant ids signaled so far.
    pub fn signals(&mut self) -> Vec<u8> {
        self.engine.drain_invariant_signals()
    }
}

fn accumulate(total: &mut TickReport, tick: TickReport) {
    total.invocations += tick.invocations;
    total.stage += tick.stage;
    total.aborted |= tick.aborted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DeviceFlags;
    use crate::states::Purpose;

    #[test]
    fn harness_basic() {
        let mut harness = TickHarness::new(EngineConfig::default());
        let dev = harness
            .engine
            .add_device(DeviceFlags::default(), 1, 1, 1)
            .unwrap();
        harness.engine.start_device(dev, Purpose::Playback).unwrap();
        let report = harness.run_ticks(dev, 0, 4);
        assert_eq!(report.invocations, 4);
        assert!(!report.aborted);
        assert_eq!(report.stage.ran, 0);
    }
}
