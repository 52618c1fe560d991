//! Invocation Context Allocator: group ids, the context tree, and the
//! traversal that records one invocation over the reachable subgraph.

use crate::error::Result;
use crate::graph::{ChannelId, ChannelKind, DeviceId, Graph, Owner};
use crate::invariant_ppt::{assert_invariant, CONTEXT_NO_ORPHAN, PLAN_LEAF_TO_ROOT};
use crate::plan::{WalkPlan, WalkStep};
use crate::recycling::RecyclingId;
use crate::states::{stage_bit, stage_mask, Phase, Purpose, Stage};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

/// Correlation id of an invocation or one of its nested sub-voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Monotonic group id source. Ids are never reused within a process.
#[derive(Debug)]
pub struct GroupIdAllocator {
    next: AtomicU64,
}

impl GroupIdAllocator {
    /// Start minting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Next unused id.
    pub fn mint(&self) -> GroupId {
        GroupId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GroupIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry pushed on a channel or device for each invocation touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    /// Enclosing group; `None` at top level.
    pub parent_group_id: Option<GroupId>,
    /// Group this owner runs under.
    pub group_id: GroupId,
    /// Group minted at the boundary reached through this owner, if any.
    pub child_group_id: Option<GroupId>,
    /// Segments the owner covered when the record was made.
    pub recycling: Vec<RecyclingId>,
}

/// Live state of one group.
#[derive(Debug)]
pub struct InvocationContext {
    /// This context's id.
    pub group_id: GroupId,
    /// Enclosing group; `None` for a top-level invocation.
    pub parent: Option<GroupId>,
    /// Top-level group of the tree.
    pub top: GroupId,
    /// Groups minted directly under this one.
    pub children: Vec<GroupId>,
    /// Channel the invocation was started from.
    pub origin: ChannelId,
    /// What the invocation is for.
    pub purpose: Purpose,
    /// Segments covered by owners running under this group.
    pub recycling: Vec<RecyclingId>,
    plan: Option<WalkPlan>,
    canceled: AtomicBool,
    stages: AtomicU16,
    drained: AtomicBool,
}

impl InvocationContext {
    /// Whether cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.mark(Stage::Cancel, Phase::Pre);
    }

    /// Whether any phase of `stage` was entered.
    pub fn stage_reached(&self, stage: Stage) -> bool {
        self.stages.load(Ordering::Acquire) & stage_mask(stage) != 0
    }

    /// Whether `phase` of `stage` was entered.
    pub fn phase_reached(&self, stage: Stage, phase: Phase) -> bool {
        self.stages.load(Ordering::Acquire) & stage_bit(stage, phase) != 0
    }

    pub(crate) fn mark(&self, stage: Stage, phase: Phase) {
        self.stages.fetch_or(stage_bit(stage, phase), Ordering::AcqRel);
    }

    /// Whether the walker has pruned everything after cancellation.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Returns true only for the call that flips the flag.
    pub(crate) fn mark_drained(&self) -> bool {
        !self.drained.swap(true, Ordering::AcqRel)
    }

    /// Whether this is a top-level invocation.
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Visit order, present on top-level contexts.
    pub fn plan(&self) -> Option<&WalkPlan> {
        self.plan.as_ref()
    }
}

/// One owner visit; repeats are kept for dependency counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    /// Channel or device.
    pub owner: Owner,
    /// Group it was visited under.
    pub group: GroupId,
    /// Parent of that group.
    pub parent: Option<GroupId>,
}

/// Outcome of [`allocate_invocation`].
#[derive(Debug, Clone)]
pub struct AllocationReport {
    /// The new top-level group.
    pub group_id: GroupId,
    /// `(group, parent)` in minting order.
    pub created: Vec<(GroupId, Option<GroupId>)>,
    /// Owner visits in traversal order.
    pub visits: Vec<Visit>,
}

impl AllocationReport {
    /// Every group was minted after its parent.
    pub fn has_no_orphans(&self) -> bool {
        let mut seen = HashSet::new();
        self.created.iter().all(|&(group, parent)| {
            let ok = parent.map_or(true, |p| seen.contains(&p));
            seen.insert(group);
            ok
        })
    }

    /// Groups minted below the top level.
    pub fn children(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.created
            .iter()
            .filter(|(_, parent)| parent.is_some())
            .map(|&(group, _)| group)
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    parent: Option<GroupId>,
    group: GroupId,
}

struct PendingContext {
    group: GroupId,
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    recycling: BTreeSet<RecyclingId>,
}

struct AllocCx<'a> {
    ids: &'a GroupIdAllocator,
    contexts: Vec<PendingContext>,
    boundaries: HashMap<(DeviceId, ChannelKind, GroupId), GroupId>,
    visits: Vec<Visit>,
    plan: WalkPlan,
}

impl AllocCx<'_> {
    /// Child group at a device boundary; one per device side and parent group.
    fn child(&mut self, device: DeviceId, side: ChannelKind, level: Level) -> Level {
        let key = (device, side, level.group);
        let group = match self.boundaries.get(&key) {
            Some(&group) => group,
            None => {
                let group = self.ids.mint();
                self.boundaries.insert(key, group);
                self.contexts.push(PendingContext {
                    group,
                    parent: Some(level.group),
                    children: Vec::new(),
                    recycling: BTreeSet::new(),
                });
                if let Some(parent) = self.contexts.iter_mut().find(|c| c.group == level.group) {
                    parent.children.push(group);
                }
                tracing::debug!("allocate: {device} {side:?} boundary mints {group} under {}", level.group);
                group
            }
        };
        Level {
            parent: Some(level.group),
            group,
        }
    }

    fn record(
        &mut self,
        graph: &mut Graph,
        owner: Owner,
        level: Level,
        child: Option<GroupId>,
    ) -> Result<()> {
        let recycling = match owner {
            Owner::Channel(id) => graph.segments_of(id)?,
            Owner::Device(_) => Vec::new(),
        };
        let records = graph.contexts_of_mut(owner)?;
        match records.iter_mut().find(|r| r.group_id == level.group) {
            Some(existing) => {
                if existing.child_group_id.is_none() {
                    existing.child_group_id = child;
                }
            }
            None => records.push(ContextRecord {
                parent_group_id: level.parent,
                group_id: level.group,
                child_group_id: child,
                recycling: recycling.clone(),
            }),
        }
        if let Some(ctx) = self.contexts.iter_mut().find(|c| c.group == level.group) {
            ctx.recycling.extend(recycling.iter().copied());
        }
        let buffers = recycling
            .iter()
            .filter_map(|&r| graph.chain.get(r).map(|s| s.buffers().clone()))
            .collect();
        self.visits.push(Visit {
            owner,
            group: level.group,
            parent: level.parent,
        });
        self.plan.push(WalkStep {
            owner,
            group: level.group,
            parent: level.parent,
            recycling,
            buffers,
        });
        Ok(())
    }
}

/// Record a fresh top-level invocation starting at `channel`.
///
/// Descends from an output into its device's inputs and on through their
/// links; a device whose input side owns its recycling mints one child group
/// per pass and is a base case. Ascends through the start channel's link
/// toward the roots; a device whose output side owns its recycling mints a
/// child group for everything above it.
pub fn allocate_invocation(
    graph: &mut Graph,
    ids: &GroupIdAllocator,
    channel: ChannelId,
    purpose: Purpose,
) -> Result<AllocationReport> {
    let start = graph.channel(channel)?;
    let (is_input, device) = (start.is_input(), start.device);
    let flags = graph.device(device)?.flags;

    let top = ids.mint();
    let mut cx = AllocCx {
        ids,
        contexts: vec![PendingContext {
            group: top,
            parent: None,
            children: Vec::new(),
            recycling: BTreeSet::new(),
        }],
        boundaries: HashMap::new(),
        visits: Vec::new(),
        plan: WalkPlan::default(),
    };
    let level = Level {
        parent: None,
        group: top,
    };

    if is_input {
        let (inner, child) = if flags.input_owns_recycling {
            let inner = cx.child(device, ChannelKind::Input, level);
            (inner, Some(inner.group))
        } else {
            (level, None)
        };
        descend_input(graph, &mut cx, channel, inner, true)?;
        ascend_through(graph, &mut cx, channel, level, child)?;
    } else {
        descend_output(graph, &mut cx, channel, level)?;
        ascend_from_output(graph, &mut cx, channel, level)?;
    }

    let plan = cx.plan.finish();
    assert_invariant(
        PLAN_LEAF_TO_ROOT,
        plan.inputs_precede_devices(graph),
        "Devices run after their inputs",
        Some("allocate_invocation"),
    );
    let report = AllocationReport {
        group_id: top,
        created: cx.contexts.iter().map(|c| (c.group, c.parent)).collect(),
        visits: cx.visits,
    };
    assert_invariant(
        CONTEXT_NO_ORPHAN,
        report.has_no_orphans(),
        "Every child group is minted below an existing parent",
        Some("allocate_invocation"),
    );

    let mut plan = Some(plan);
    for pending in cx.contexts {
        let ctx = InvocationContext {
            group_id: pending.group,
            parent: pending.parent,
            top,
            children: pending.children,
            origin: channel,
            purpose,
            recycling: pending.recycling.into_iter().collect(),
            plan: if pending.parent.is_none() { plan.take() } else { None },
            canceled: AtomicBool::new(false),
            stages: AtomicU16::new(0),
            drained: AtomicBool::new(false),
        };
        graph.contexts.insert(pending.group, Arc::new(ctx));
    }
    tracing::debug!(
        "allocate_invocation: {top} from {channel} ({} groups, {} visits)",
        report.created.len(),
        report.visits.len()
    );
    Ok(report)
}

fn descend_output(
    graph: &mut Graph,
    cx: &mut AllocCx<'_>,
    output: ChannelId,
    level: Level,
) -> Result<Option<GroupId>> {
    let device = graph.channel(output)?.device;
    let flags = graph.device(device)?.flags;
    let inputs = graph.mapped_inputs(output)?;
    let (below, device_child) = if flags.input_owns_recycling {
        let inner = cx.child(device, ChannelKind::Input, level);
        for input in inputs {
            descend_input(graph, cx, input, inner, false)?;
        }
        (Some(inner.group), Some(inner.group))
    } else {
        let mut below = None;
        for input in inputs {
            let found = descend_input(graph, cx, input, level, true)?;
            below = below.or(found);
        }
        (below, None)
    };
    cx.record(graph, Owner::Device(device), level, device_child)?;
    cx.record(graph, Owner::Channel(output), level, below)?;
    Ok(below)
}

fn descend_input(
    graph: &mut Graph,
    cx: &mut AllocCx<'_>,
    input: ChannelId,
    level: Level,
    follow: bool,
) -> Result<Option<GroupId>> {
    let link = graph.channel(input)?.link;
    let below = match link {
        Some(producer) if follow => descend_output(graph, cx, producer, level)?,
        _ => None,
    };
    cx.record(graph, Owner::Channel(input), level, below)?;
    Ok(below)
}

fn ascend_from_output(
    graph: &mut Graph,
    cx: &mut AllocCx<'_>,
    output: ChannelId,
    level: Level,
) -> Result<()> {
    let mut output = output;
    let mut level = level;
    loop {
        let Some(up) = graph.channel(output)?.link else {
            return Ok(());
        };
        cx.record(graph, Owner::Channel(up), level, None)?;
        if graph.flags_of(up)?.input_owns_recycling {
            return Ok(());
        }
        match cross_device(graph, cx, up, level, None)? {
            Some((next, next_level)) => {
                output = next;
                level = next_level;
            }
            None => return Ok(()),
        }
    }
}

fn ascend_through(
    graph: &mut Graph,
    cx: &mut AllocCx<'_>,
    input: ChannelId,
    level: Level,
    inner: Option<GroupId>,
) -> Result<()> {
    match cross_device(graph, cx, input, level, inner)? {
        Some((output, out_level)) => ascend_from_output(graph, cx, output, out_level),
        None => Ok(()),
    }
}

/// Record an input's device and paired output; returns the output and the
/// level everything above it runs under.
fn cross_device(
    graph: &mut Graph,
    cx: &mut AllocCx<'_>,
    input: ChannelId,
    level: Level,
    inner: Option<GroupId>,
) -> Result<Option<(ChannelId, Level)>> {
    let device = graph.channel(input)?.device;
    let flags = graph.device(device)?.flags;
    let Some(output) = graph.paired_output(input)? else {
        cx.record(graph, Owner::Device(device), level, inner)?;
        return Ok(None);
    };
    let out_level = if flags.output_owns_recycling {
        cx.child(device, ChannelKind::Output, level)
    } else {
        level
    };
    let minted = flags.output_owns_recycling.then_some(out_level.group);
    cx.record(graph, Owner::Device(device), level, minted.or(inner))?;
    cx.record(graph, Owner::Channel(output), out_level, None)?;
    Ok(Some((output, out_level)))
}

/// Remove a drained top-level invocation and its descendants: contexts,
/// per-owner records and sample buffers. Returns the removed groups.
pub(crate) fn destroy_invocation(graph: &mut Graph, top: GroupId) -> Vec<GroupId> {
    let mut removed = Vec::new();
    let mut stack = vec![top];
    while let Some(group) = stack.pop() {
        if let Some(ctx) = graph.contexts.remove(&group) {
            stack.extend(ctx.children.iter().copied());
            removed.push(group);
        }
    }
    let gone: HashSet<GroupId> = removed.iter().copied().collect();
    for ch in 0..graph.channels().len() {
        if let Ok(records) = graph.contexts_of_mut(Owner::Channel(ChannelId(ch))) {
            records.retain(|r| !gone.contains(&r.group_id));
        }
    }
    for dev in 0..graph.devices().len() {
        if let Ok(records) = graph.contexts_of_mut(Owner::Device(DeviceId(dev))) {
            records.retain(|r| !gone.contains(&r.group_id));
        }
    }
    for (_, seg) in graph.chain.iter() {
        seg.buffers().remove(top);
    }
    removed
}
