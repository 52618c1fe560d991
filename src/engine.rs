//! Control-thread facade.
//!
//! `Engine` owns the mutable [`Graph`]. Every topology change is applied to
//! that private copy and then published as a fresh snapshot, so the
//! [`RtEngine`] on the realtime thread always loads a fully spliced graph.
//! Contexts, runtime lists and sample buffers are shared between snapshots,
//! which is how cancellation and pruning cross the thread boundary.

use crate::behavior::Behavior;
use crate::config::EngineConfig;
use crate::context::{allocate_invocation, destroy_invocation, AllocationReport, GroupId, GroupIdAllocator};
use crate::control::{drain_events, new_event_queue, WalkerEvent};
use crate::duplicate::{duplicate, DuplicateReport};
use crate::error::Result;
use crate::graph::{ChannelId, DeviceFlags, DeviceId, Graph, Owner};
use crate::invariant_ppt::{assert_invariant, CANCEL_PRUNES};
use crate::invariant_rt::{self, new_invariant_queue};
use crate::link::set_link;
use crate::recall::{BehaviorRegistry, RecallId, RecallInstance, RecallScope};
use crate::recycling::RecyclingId;
use crate::rt::RtEngine;
use crate::splice::{set_recycling, RecyclingChange};
use crate::states::{Purpose, PurposeSet, Stage};
use crate::walker::{self, StageReport, Walker};
use arc_swap::ArcSwap;
use rtrb::Consumer;
use std::sync::Arc;

/// Observer of recycling changes, called once per splice hop.
pub type ChangeListener = Box<dyn FnMut(&RecyclingChange) + Send>;

/// What [`Engine::collect_garbage`] cleaned up.
#[derive(Debug, Clone, Default)]
pub struct GarbageReport {
    /// Top-level invocations destroyed, with all their descendants.
    pub destroyed: Vec<GroupId>,
    /// Parked segments finally released.
    pub released: Vec<RecyclingId>,
    /// Walker events drained along the way.
    pub events: Vec<WalkerEvent>,
}

/// Control-thread side of the routing core.
pub struct Engine {
    graph: Graph,
    published: Arc<ArcSwap<Graph>>,
    ids: GroupIdAllocator,
    registry: BehaviorRegistry,
    config: EngineConfig,
    events: Consumer<WalkerEvent>,
    local_events: Vec<WalkerEvent>,
    invariants: Consumer<u8>,
    listeners: Vec<ChangeListener>,
    /// Replaced snapshots, dropped here once the realtime side lets go.
    retired: Vec<Arc<Graph>>,
}

impl Engine {
    /// Empty engine and its realtime counterpart.
    pub fn new(config: EngineConfig) -> (Engine, RtEngine) {
        Self::from_graph(Graph::new(), config)
    }

    /// Engine over an existing graph, e.g. one built with the DSL.
    pub fn from_graph(graph: Graph, config: EngineConfig) -> (Engine, RtEngine) {
        let published = Arc::new(ArcSwap::from_pointee(graph.clone()));
        let (event_tx, event_rx) = new_event_queue(config.event_queue_capacity);
        let (inv_tx, inv_rx) = new_invariant_queue(config.invariant_queue_capacity);
        let rt = RtEngine::new(published.clone(), config.clone(), event_tx, inv_tx);
        let engine = Engine {
            graph,
            published,
            ids: GroupIdAllocator::new(),
            registry: BehaviorRegistry::default(),
            config,
            events: event_rx,
            local_events: Vec::new(),
            invariants: inv_rx,
            listeners: Vec::new(),
            retired: Vec::new(),
        };
        (engine, rt)
    }

    /// Current configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The control thread's graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The snapshot the realtime thread currently sees.
    pub fn snapshot(&self) -> Arc<Graph> {
        self.published.load_full()
    }

    fn publish(&mut self) {
        let old = self.published.swap(Arc::new(self.graph.clone()));
        self.retired.push(old);
        self.reclaim_snapshots();
    }

    /// Drop retired snapshots no realtime guard still holds, so a graph is
    /// never freed on the realtime thread.
    fn reclaim_snapshots(&mut self) {
        self.retired.retain(|g| Arc::strong_count(g) > 1);
    }

    fn notify(&mut self, changes: &[RecyclingChange]) {
        for change in changes {
            tracing::trace!(
                "recycling change at {}: {:?}..{:?} -> {:?}..{:?}",
                change.owner,
                change.old_first,
                change.old_last,
                change.new_first,
                change.new_last
            );
            for listener in &mut self.listeners {
                listener(change);
            }
        }
    }

    /// Register an observer for recycling changes.
    pub fn subscribe(&mut self, listener: impl FnMut(&RecyclingChange) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Add a device; see [`Graph::add_device`].
    pub fn add_device(
        &mut self,
        flags: DeviceFlags,
        audio_channels: usize,
        output_pads: usize,
        input_pads: usize,
    ) -> Result<DeviceId> {
        let (id, changes) = self.graph.add_device(flags, audio_channels, output_pads, input_pads)?;
        self.notify(&changes);
        self.publish();
        Ok(id)
    }

    /// Make `name` available to [`Engine::add_template`].
    pub fn register_behavior_factory(
        &mut self,
        name: &str,
        factory: impl Fn() -> Arc<dyn Behavior> + Send + Sync + 'static,
    ) {
        tracing::debug!("register_behavior_factory: {name}");
        self.registry.register(name, Arc::new(factory));
    }

    /// Attach a template of behavior `name` to `owner`.
    pub fn add_template(
        &mut self,
        owner: impl Into<Owner>,
        name: &str,
        scope: RecallScope,
        purposes: PurposeSet,
    ) -> Result<RecallId> {
        let owner = owner.into();
        let def = self.registry.create(name)?;
        let template = Arc::new(RecallInstance::template(name, owner, def, purposes));
        let id = template.id();
        self.graph.recalls_mut(owner)?.add_template(scope, template);
        tracing::debug!("add_template: {name} on {owner} ({scope:?}) as {id}");
        self.publish();
        Ok(id)
    }

    /// Link `channel` with `peer`, or unlink it with `None`.
    pub fn set_link(&mut self, channel: ChannelId, peer: Option<ChannelId>) -> Result<Vec<RecyclingChange>> {
        let changes = set_link(&mut self.graph, channel, peer)?;
        self.notify(&changes);
        self.publish();
        Ok(changes)
    }

    /// Create a detached segment on the control graph.
    pub fn alloc_recycling(&mut self, parent: Option<ChannelId>) -> RecyclingId {
        self.graph.alloc_recycling(parent)
    }

    /// Splice a new range into `channel`.
    pub fn set_recycling(
        &mut self,
        channel: ChannelId,
        first: Option<RecyclingId>,
        last: Option<RecyclingId>,
        update: bool,
        destroy_old: bool,
    ) -> Result<Vec<RecyclingChange>> {
        let changes = set_recycling(&mut self.graph, channel, first, last, update, destroy_old)?;
        self.notify(&changes);
        self.publish();
        Ok(changes)
    }

    /// Record a new top-level invocation at `channel`; no recalls yet.
    pub fn allocate_invocation(&mut self, channel: ChannelId, purpose: Purpose) -> Result<AllocationReport> {
        let report = allocate_invocation(&mut self.graph, &self.ids, channel, purpose)?;
        self.publish();
        Ok(report)
    }

    /// Instantiate `owner`'s templates under an allocated `group`.
    pub fn duplicate(&mut self, owner: impl Into<Owner>, group: GroupId) -> Result<DuplicateReport> {
        let ctx = self.graph.context(group)?;
        let (parent, purpose) = (ctx.parent, ctx.purpose);
        duplicate(&self.graph, owner.into(), group, parent, purpose, &self.config)
    }

    /// Allocate, duplicate along every visit, and run Init.
    pub fn start(&mut self, channel: ChannelId, purpose: Purpose) -> Result<GroupId> {
        let report = allocate_invocation(&mut self.graph, &self.ids, channel, purpose)?;
        let mut totals = DuplicateReport::default();
        for visit in &report.visits {
            let r = duplicate(&self.graph, visit.owner, visit.group, visit.parent, purpose, &self.config)?;
            totals.created += r.created;
            totals.reused += r.reused;
            totals.skipped += r.skipped;
        }
        tracing::debug!(
            "start: {} at {channel} for {purpose:?}, {} created, {} reused",
            report.group_id,
            totals.created,
            totals.reused
        );
        self.init(report.group_id)?;
        self.publish();
        Ok(report.group_id)
    }

    /// [`Engine::start`] once per output channel of `device`.
    pub fn start_device(&mut self, device: DeviceId, purpose: Purpose) -> Result<Vec<GroupId>> {
        let outputs = self.graph.device(device)?.outputs.clone();
        outputs
            .into_iter()
            .map(|output| self.start(output, purpose))
            .collect()
    }

    /// Run the three Init phases for `group`'s invocation.
    pub fn init(&mut self, group: GroupId) -> Result<StageReport> {
        Walker::new(&self.graph, &self.config, &mut self.local_events).init(group)
    }

    /// Request cancellation of `group` and its descendants.
    pub fn cancel(&mut self, group: GroupId) -> Result<Vec<GroupId>> {
        walker::cancel(&self.graph, group)
    }

    /// Whether `group` was canceled.
    pub fn is_canceled(&self, group: GroupId) -> Result<bool> {
        Ok(self.graph.context(group)?.is_canceled())
    }

    /// Whether any phase of `stage` ran for `group`.
    pub fn stage_reached(&self, group: GroupId, stage: Stage) -> Result<bool> {
        Ok(self.graph.context(group)?.stage_reached(stage))
    }

    /// Runtime instance of `name` under `group` on `owner`.
    pub fn find_recall(
        &self,
        owner: impl Into<Owner>,
        name: &str,
        group: GroupId,
    ) -> Result<Option<Arc<RecallInstance>>> {
        let slots = self.graph.recalls(owner.into())?;
        Ok(slots
            .play
            .find(name, group)
            .or_else(|| slots.recall.find(name, group)))
    }

    /// Copy of the invocation's samples on `channel`'s first segment.
    pub fn read_signal(&self, channel: ChannelId, group: GroupId) -> Result<Option<Vec<f32>>> {
        let top = self.graph.context(group)?.top;
        let segments = self.graph.segments_of(channel)?;
        Ok(segments
            .first()
            .and_then(|&seg| self.graph.chain.get(seg))
            .and_then(|seg| seg.buffers().with_signal(top, |samples| samples.to_vec())))
    }

    /// Pending walker events from both threads. Failures are logged.
    pub fn drain_events(&mut self) -> Vec<WalkerEvent> {
        let mut events = std::mem::take(&mut self.local_events);
        events.extend(drain_events(&mut self.events));
        for event in &events {
            match event {
                WalkerEvent::BehaviorFailed { recall, owner, group, error } => {
                    tracing::warn!("{recall} on {owner} under {group}: {error}");
                }
                other => tracing::debug!("walker: {} for {}", other.description(), other.group()),
            }
        }
        events
    }

    /// Invariant ids signaled by the realtime path since the last call.
    pub fn drain_invariant_signals(&mut self) -> Vec<u8> {
        invariant_rt::drain_invariant_signals(&mut self.invariants)
    }

    /// Destroy drained invocations and release parked segments nothing
    /// covers anymore.
    pub fn collect_garbage(&mut self) -> GarbageReport {
        let events = self.drain_events();
        let drained: Vec<GroupId> = self
            .graph
            .invocations()
            .filter(|ctx| ctx.is_top_level() && ctx.is_drained())
            .map(|ctx| ctx.group_id)
            .collect();

        let mut destroyed = Vec::new();
        for top in drained {
            let removed = destroy_invocation(&mut self.graph, top);
            let leftover = self.purge_instances(&removed);
            if leftover > 0 {
                tracing::warn!("collect_garbage: {leftover} instances outside {top}'s plan purged");
            }
            assert_invariant(
                CANCEL_PRUNES,
                self.count_instances(&removed) == 0,
                "No instance outlives its canceled invocation",
                Some("collect_garbage"),
            );
            tracing::debug!("collect_garbage: destroyed {top} ({} groups)", removed.len());
            destroyed.push(top);
        }

        let mut released = Vec::new();
        let pending = std::mem::take(&mut self.graph.pending_release);
        for seg in pending {
            if self.graph.is_covered(seg) || self.graph.is_referenced(seg) {
                self.graph.pending_release.push(seg);
            } else if self.graph.chain.release(seg) {
                released.push(seg);
            }
        }
        if !destroyed.is_empty() || !released.is_empty() {
            self.publish();
        } else {
            self.reclaim_snapshots();
        }
        GarbageReport {
            destroyed,
            released,
            events,
        }
    }

    fn owners(&self) -> impl Iterator<Item = Owner> + '_ {
        let channels = self.graph.channels().iter().map(|ch| Owner::Channel(ch.id));
        let devices = self.graph.devices().iter().map(|dev| Owner::Device(dev.id));
        channels.chain(devices)
    }

    fn count_instances(&self, groups: &[GroupId]) -> usize {
        self.owners()
            .filter_map(|owner| self.graph.recalls(owner).ok())
            .flat_map(|slots| [slots.play.snapshot(), slots.recall.snapshot()])
            .map(|list| {
                list.iter()
                    .filter(|r| r.group_id().is_some_and(|g| groups.contains(&g)))
                    .count()
            })
            .sum()
    }

    fn purge_instances(&self, groups: &[GroupId]) -> usize {
        self.owners()
            .filter_map(|owner| self.graph.recalls(owner).ok())
            .map(|slots| {
                let gone = |r: &RecallInstance| r.group_id().is_some_and(|g| groups.contains(&g));
                slots.play.remove_where(gone) + slots.recall.remove_where(gone)
            })
            .sum()
    }
}
