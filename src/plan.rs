//! Plan module: the leaf-to-root visit order an invocation executes.
//!
//! The allocator records every owner it visits in post-order: an input after
//! the subtree behind its link, a device after its inputs, an output after its
//! device, ascent steps last. The walker replays the plan instead of
//! re-traversing the graph, so the realtime path never allocates for it.

use crate::context::GroupId;
use crate::graph::{Graph, Owner};
use crate::recycling::{RecyclingId, SegmentBuffers};
use std::collections::HashSet;
use std::sync::Arc;

/// One owner visited under one group.
#[derive(Debug, Clone)]
pub struct WalkStep {
    /// Channel or device.
    pub owner: Owner,
    /// Group the owner's recalls run under.
    pub group: GroupId,
    /// Parent group; `None` selects the play lists.
    pub parent: Option<GroupId>,
    /// Segments the owner covered at allocation time.
    pub recycling: Vec<RecyclingId>,
    pub(crate) buffers: Vec<Arc<SegmentBuffers>>,
}

impl WalkStep {
    /// Sample buffers of the covered segments.
    pub fn buffers(&self) -> &[Arc<SegmentBuffers>] {
        &self.buffers
    }
}

/// Ordered steps of one top-level invocation.
#[derive(Debug, Clone, Default)]
pub struct WalkPlan {
    steps: Vec<WalkStep>,
}

impl WalkPlan {
    /// Steps in execution order.
    pub fn steps(&self) -> &[WalkStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step for `owner` under `group`.
    pub fn position(&self, owner: Owner, group: GroupId) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.owner == owner && s.group == group)
    }

    pub(crate) fn push(&mut self, step: WalkStep) {
        self.steps.push(step);
    }

    /// Collapse repeat visits of the same `(owner, group)`, keeping the last
    /// one so a device shared by several outputs runs after all its inputs.
    pub(crate) fn finish(mut self) -> Self {
        let mut seen = HashSet::new();
        self.steps.reverse();
        self.steps.retain(|s| seen.insert((s.owner, s.group)));
        self.steps.reverse();
        self
    }

    /// Whether every device step comes after the steps of its inputs that
    /// run under the same group.
    pub fn inputs_precede_devices(&self, graph: &Graph) -> bool {
        self.steps.iter().enumerate().all(|(i, step)| {
            let Owner::Device(dev) = step.owner else {
                return true;
            };
            let Ok(device) = graph.device(dev) else {
                return false;
            };
            device.inputs.iter().all(|&input| {
                self.position(Owner::Channel(input), step.group)
                    .map_or(true, |j| j < i)
            })
        })
    }
}
