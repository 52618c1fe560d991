//! Trait-based recall behaviors.

#![forbid(unsafe_code)]

use crate::context::GroupId;
use crate::error::BehaviorError;
use crate::graph::Owner;
use crate::recycling::SegmentBuffers;
use crate::states::{Phase, Stage};
use std::any::Any;
use std::sync::Arc;

/// What a stage callback asks of the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Keep receiving callbacks.
    Continue,
    /// Finished; flag the instance for removal.
    Done,
}

/// Everything a callback sees about the current step.
#[derive(Debug)]
pub struct StageContext<'a> {
    /// Current stage.
    pub stage: Stage,
    /// Current phase.
    pub phase: Phase,
    /// Group the instance runs under.
    pub group_id: GroupId,
    /// Top-level group of the invocation; owns the sample buffers.
    pub top: GroupId,
    /// Channel or device the instance is attached to.
    pub owner: Owner,
    /// Sample rate.
    pub samplerate: u32,
    /// Frames per buffer.
    pub buffer_size: usize,
    pub(crate) buffers: &'a [Arc<SegmentBuffers>],
}

impl StageContext<'_> {
    /// Number of segments the owner covers.
    pub fn segment_count(&self) -> usize {
        self.buffers.len()
    }

    /// Run `f` on this invocation's buffer for the `index`-th covered segment.
    ///
    /// Never blocks: `None` when the buffer is missing or momentarily busy.
    pub fn with_buffer<R>(&self, index: usize, f: impl FnOnce(&mut [f32]) -> R) -> Option<R> {
        self.buffers.get(index)?.try_with_signal(self.top, f)
    }
}

/// Object-safe behavior, as stored in templates and instances.
pub trait Behavior: Send + Sync {
    fn init_state(&self, samplerate: u32, buffer_size: usize) -> Box<dyn Any + Send>;
    fn run_stage(
        &self,
        state: &mut dyn Any,
        cx: &StageContext<'_>,
    ) -> Result<StageOutcome, BehaviorError>;
    fn cancel(&self, state: &mut dyn Any);
}

/// Typed behavior definition; implement this for your recalls.
pub trait BehaviorDef: Send + Sync + 'static {
    type State: Send + 'static;
    fn init_state(&self, samplerate: u32, buffer_size: usize) -> Self::State;
    fn run_stage(
        &self,
        state: &mut Self::State,
        cx: &StageContext<'_>,
    ) -> Result<StageOutcome, BehaviorError>;
    /// Called once when the instance's invocation is canceled.
    fn cancel(&self, _state: &mut Self::State) {}
}

impl<T: BehaviorDef> Behavior for T {
    fn init_state(&self, samplerate: u32, buffer_size: usize) -> Box<dyn Any + Send> {
        Box::new(<T as BehaviorDef>::init_state(self, samplerate, buffer_size))
    }

    fn run_stage(
        &self,
        state: &mut dyn Any,
        cx: &StageContext<'_>,
    ) -> Result<StageOutcome, BehaviorError> {
        match state.downcast_mut::<<T as BehaviorDef>::State>() {
            Some(typed) => <T as BehaviorDef>::run_stage(self, typed, cx),
            // A mismatch means the instance was built from another definition.
            None => Err(BehaviorError::failed("recall state type mismatch")),
        }
    }

    fn cancel(&self, state: &mut dyn Any) {
        if let Some(typed) = state.downcast_mut::<<T as BehaviorDef>::State>() {
            <T as BehaviorDef>::cancel(self, typed);
        }
    }
}
