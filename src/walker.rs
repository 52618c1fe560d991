//! Graph Walker: runs init/play stages of an invocation and observes
//! cancellation at stage boundaries.
//!
//! Steps come from the invocation's [`WalkPlan`](crate::plan::WalkPlan), so a
//! play cycle only loads snapshots and calls behaviors. Each callback runs
//! inside `catch_unwind`; an error or panic flags that one instance and the
//! walk carries on.

use crate::behavior::{StageContext, StageOutcome};
use crate::config::EngineConfig;
use crate::context::{GroupId, InvocationContext};
use crate::control::{EventSink, WalkerEvent};
use crate::error::{BehaviorError, Result};
use crate::graph::Graph;
use crate::invariant_rt::{
    signal_invariant, INV_CANCELED_PRUNED, INV_CONTENTION_SKIPPED, INV_FAILURE_CONTAINED,
    INV_INVOCATION_DRAINED, INV_PLAY_CYCLE_CLEAN,
};
use crate::plan::{WalkPlan, WalkStep};
use crate::recall::{RecallInstance, RecallScope};
use crate::states::{Phase, RecallState, Stage};
use rtrb::Producer;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Counters from one stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Callbacks invoked.
    pub ran: usize,
    /// Callbacks that failed or panicked.
    pub failed: usize,
    /// Instances that reported completion.
    pub done: usize,
    /// Play callbacks skipped on lock contention.
    pub skipped: usize,
    /// Instances removed from runtime lists before the stage.
    pub pruned: usize,
    /// The invocation was canceled and is now drained.
    pub drained: bool,
}

impl std::ops::AddAssign for StageReport {
    fn add_assign(&mut self, other: Self) {
        self.ran += other.ran;
        self.failed += other.failed;
        self.done += other.done;
        self.skipped += other.skipped;
        self.pruned += other.pruned;
        self.drained |= other.drained;
    }
}

/// Executes stages against one graph snapshot.
pub struct Walker<'a> {
    graph: &'a Graph,
    config: &'a EngineConfig,
    events: &'a mut dyn EventSink,
    signals: Option<&'a mut Producer<u8>>,
}

impl<'a> Walker<'a> {
    /// Walker reporting to `events`.
    pub fn new(graph: &'a Graph, config: &'a EngineConfig, events: &'a mut dyn EventSink) -> Self {
        Self {
            graph,
            config,
            events,
            signals: None,
        }
    }

    /// Also signal realtime invariants.
    pub fn with_signals(mut self, signals: &'a mut Producer<u8>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run the three Init phases; allocates the invocation's sample buffers.
    pub fn init(&mut self, group: GroupId) -> Result<StageReport> {
        let root = self.root(group)?;
        Ok(self.run(root, Stage::Init))
    }

    /// Run one Play cycle.
    pub fn play(&mut self, group: GroupId) -> Result<StageReport> {
        let root = self.root(group)?;
        Ok(self.play_context(root))
    }

    pub(crate) fn play_context(&mut self, root: &InvocationContext) -> StageReport {
        let report = self.run(root, Stage::Play);
        self.signal(INV_PLAY_CYCLE_CLEAN);
        report
    }

    fn root(&self, group: GroupId) -> Result<&'a InvocationContext> {
        let graph = self.graph;
        let ctx = graph.context(group)?;
        Ok(graph.context(ctx.top)?.as_ref())
    }

    fn signal(&mut self, id: u8) {
        if let Some(tx) = self.signals.as_deref_mut() {
            signal_invariant(tx, id);
        }
    }

    fn run(&mut self, root: &InvocationContext, stage: Stage) -> StageReport {
        let mut report = StageReport::default();
        let Some(plan) = root.plan() else {
            return report;
        };
        report.pruned = self.prune(plan);

        if root.is_canceled() {
            root.mark(Stage::Cancel, Phase::Inter);
            if root.mark_drained() {
                root.mark(Stage::Cancel, Phase::Post);
                self.events.emit(WalkerEvent::InvocationDrained {
                    group: root.group_id,
                });
                self.signal(INV_INVOCATION_DRAINED);
            }
            report.drained = true;
            return report;
        }

        if stage == Stage::Init {
            for step in plan.steps() {
                for buffers in step.buffers() {
                    buffers.ensure(root.group_id, self.config.buffer_size);
                }
            }
        }

        let graph = self.graph;
        for phase in Phase::ALL {
            root.mark(stage, phase);
            for step in plan.steps() {
                match graph.contexts.get(&step.group) {
                    Some(ctx) if !ctx.is_canceled() => ctx.mark(stage, phase),
                    _ => continue,
                }
                let Ok(slots) = graph.recalls(step.owner) else {
                    continue;
                };
                let list = slots.list(RecallScope::for_parent(step.parent)).load();
                for instance in list.iter() {
                    if instance.group_id() != Some(step.group)
                        || instance.state() != RecallState::Running
                    {
                        continue;
                    }
                    self.run_instance(instance, step, root, stage, phase, &mut report);
                }
            }
        }
        report
    }

    fn run_instance(
        &mut self,
        instance: &RecallInstance,
        step: &WalkStep,
        root: &InvocationContext,
        stage: Stage,
        phase: Phase,
        report: &mut StageReport,
    ) {
        let Some(runtime) = instance.runtime() else {
            return;
        };
        let mut state = if stage == Stage::Play {
            match runtime.try_lock() {
                Some(state) => state,
                None => {
                    report.skipped += 1;
                    self.signal(INV_CONTENTION_SKIPPED);
                    return;
                }
            }
        } else {
            runtime.lock()
        };
        let cx = StageContext {
            stage,
            phase,
            group_id: step.group,
            top: root.group_id,
            owner: step.owner,
            samplerate: self.config.samplerate,
            buffer_size: self.config.buffer_size,
            buffers: step.buffers(),
        };
        let def = instance.def();
        let result = catch_unwind(AssertUnwindSafe(|| def.run_stage(&mut **state, &cx)));
        drop(state);
        report.ran += 1;

        match result {
            Ok(Ok(StageOutcome::Continue)) => {}
            Ok(Ok(StageOutcome::Done)) => {
                instance.transition(RecallState::Running, RecallState::PendingRemoval);
                report.done += 1;
                self.events.emit(WalkerEvent::RecallDone {
                    recall: instance.id(),
                    group: step.group,
                });
            }
            Ok(Err(error)) => self.fail(instance, step, error, report),
            Err(_) => self.fail(instance, step, BehaviorError::Panicked, report),
        }
    }

    fn fail(
        &mut self,
        instance: &RecallInstance,
        step: &WalkStep,
        error: BehaviorError,
        report: &mut StageReport,
    ) {
        instance.set_state(RecallState::PendingRemoval);
        report.failed += 1;
        self.events.emit(WalkerEvent::BehaviorFailed {
            recall: instance.id(),
            owner: step.owner,
            group: step.group,
            error,
        });
        self.signal(INV_FAILURE_CONTAINED);
    }

    /// Remove pending instances and everything under canceled groups, leaf to
    /// root in plan order. Canceled instances get their cancel callback first.
    fn prune(&mut self, plan: &WalkPlan) -> usize {
        let graph = self.graph;
        let mut total = 0;
        for step in plan.steps() {
            let canceled = graph
                .contexts
                .get(&step.group)
                .map_or(true, |ctx| ctx.is_canceled());
            let Ok(slots) = graph.recalls(step.owner) else {
                continue;
            };
            let list = slots.list(RecallScope::for_parent(step.parent));
            let mut pending = false;
            for instance in list.load().iter() {
                if instance.group_id() != Some(step.group) {
                    continue;
                }
                if canceled && instance.transition(RecallState::Running, RecallState::PendingRemoval)
                {
                    cancel_instance(instance);
                }
                pending |= instance.state() == RecallState::PendingRemoval;
            }
            if !pending {
                continue;
            }
            let group = step.group;
            let count = list.remove_where(|r| {
                r.group_id() == Some(group) && r.state() == RecallState::PendingRemoval
            });
            if count > 0 {
                total += count;
                self.events.emit(WalkerEvent::Pruned { group, count });
                if canceled {
                    self.signal(INV_CANCELED_PRUNED);
                }
            }
        }
        total
    }
}

fn cancel_instance(instance: &RecallInstance) {
    let Some(runtime) = instance.runtime() else {
        return;
    };
    let mut state = runtime.lock();
    let def = instance.def();
    // A panicking cancel callback changes nothing: the instance is removed anyway.
    let _ = catch_unwind(AssertUnwindSafe(|| def.cancel(&mut **state)));
}

/// Flag `group` and every group below it as canceled.
///
/// Observed at the next Init or Play of the owning invocation.
pub fn cancel(graph: &Graph, group: GroupId) -> Result<Vec<GroupId>> {
    let ctx = graph.context(group)?;
    let mut canceled = Vec::new();
    let mut stack = vec![ctx.group_id];
    while let Some(g) = stack.pop() {
        if let Some(ctx) = graph.contexts.get(&g) {
            ctx.cancel();
            canceled.push(g);
            stack.extend(ctx.children.iter().copied());
        }
    }
    tracing::debug!("cancel: {group} ({} groups)", canceled.len());
    Ok(canceled)
}
