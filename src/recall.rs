//! Recall templates, runtime instances and the lists that hold them.
//!
//! Runtime lists are copy-on-write snapshots: the realtime thread loads the
//! current `Vec` without locking and iterates it, while duplication and
//! pruning publish a new `Vec` with `rcu`. Changes only show up in the next
//! snapshot.

use crate::behavior::Behavior;
use crate::context::GroupId;
use crate::error::{Result, RoutingError};
use crate::graph::Owner;
use crate::states::{PurposeSet, RecallState};
use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

static NEXT_RECALL_ID: AtomicU64 = AtomicU64::new(1);

/// Unique id of a template or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecallId(pub u64);

impl fmt::Display for RecallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recall{}", self.0)
    }
}

/// Which template/runtime list pair a recall lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecallScope {
    /// Runs for top-level invocations.
    Play,
    /// Runs for nested (child) invocations.
    Recall,
}

impl RecallScope {
    /// Play lists serve top-level groups, recall lists everything nested.
    pub fn for_parent(parent: Option<GroupId>) -> Self {
        match parent {
            None => RecallScope::Play,
            Some(_) => RecallScope::Recall,
        }
    }
}

/// A recall template or one of its per-invocation copies.
pub struct RecallInstance {
    id: RecallId,
    name: Arc<str>,
    owner: Owner,
    group_id: Option<GroupId>,
    purposes: PurposeSet,
    def: Arc<dyn Behavior>,
    template: Option<Weak<RecallInstance>>,
    state: AtomicU8,
    dependencies: AtomicU32,
    runtime: Option<Mutex<Box<dyn Any + Send>>>,
}

impl fmt::Debug for RecallInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecallInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("group_id", &self.group_id)
            .field("state", &self.state())
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

impl RecallInstance {
    pub(crate) fn template(
        name: &str,
        owner: Owner,
        def: Arc<dyn Behavior>,
        purposes: PurposeSet,
    ) -> Self {
        Self {
            id: RecallId(NEXT_RECALL_ID.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(name),
            owner,
            group_id: None,
            purposes,
            def,
            template: None,
            state: AtomicU8::new(RecallState::Template as u8),
            dependencies: AtomicU32::new(0),
            runtime: None,
        }
    }

    /// Fresh running copy of a template bound to `group_id`.
    pub(crate) fn instantiate(
        template: &Arc<RecallInstance>,
        group_id: GroupId,
        samplerate: u32,
        buffer_size: usize,
    ) -> Self {
        Self {
            id: RecallId(NEXT_RECALL_ID.fetch_add(1, Ordering::Relaxed)),
            name: template.name.clone(),
            owner: template.owner,
            group_id: Some(group_id),
            purposes: template.purposes,
            def: template.def.clone(),
            template: Some(Arc::downgrade(template)),
            state: AtomicU8::new(RecallState::Running as u8),
            dependencies: AtomicU32::new(1),
            runtime: Some(Mutex::new(template.def.init_state(samplerate, buffer_size))),
        }
    }

    /// Unique id.
    pub fn id(&self) -> RecallId {
        self.id
    }

    /// Behavior name the template was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel or device the recall is attached to.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Owning group; `None` for templates.
    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    /// Purposes served.
    pub fn purposes(&self) -> PurposeSet {
        self.purposes
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecallState {
        RecallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RecallState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if the state was something else.
    pub(crate) fn transition(&self, from: RecallState, to: RecallState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// How many times duplication reached this instance.
    pub fn dependencies(&self) -> u32 {
        self.dependencies.load(Ordering::Acquire)
    }

    pub(crate) fn add_dependency(&self) -> u32 {
        self.dependencies.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Template this instance was copied from, while it still exists.
    pub fn template_of(&self) -> Option<Arc<RecallInstance>> {
        self.template.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn def(&self) -> &Arc<dyn Behavior> {
        &self.def
    }

    pub(crate) fn runtime(&self) -> Option<&Mutex<Box<dyn Any + Send>>> {
        self.runtime.as_ref()
    }

    /// Whether this is a running instance of `name` under `group`.
    pub fn matches(&self, name: &str, group: GroupId) -> bool {
        self.group_id == Some(group) && &*self.name == name
    }
}

/// Snapshot-swapped runtime list of an owner.
#[derive(Clone, Default)]
pub struct RecallList(Arc<ArcSwap<Vec<Arc<RecallInstance>>>>);

impl fmt::Debug for RecallList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.load().iter()).finish()
    }
}

impl RecallList {
    /// Lock-free view of the current list.
    pub fn load(&self) -> Guard<Arc<Vec<Arc<RecallInstance>>>> {
        self.0.load()
    }

    /// Owned snapshot of the current list.
    pub fn snapshot(&self) -> Arc<Vec<Arc<RecallInstance>>> {
        self.0.load_full()
    }

    /// Publish a list with `instance` appended.
    pub(crate) fn push(&self, instance: Arc<RecallInstance>) {
        self.0.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(instance.clone());
            next
        });
    }

    /// Publish a list without the instances `remove` selects. Returns how many
    /// were dropped.
    pub(crate) fn remove_where(&self, remove: impl Fn(&RecallInstance) -> bool) -> usize {
        let mut removed = 0;
        self.0.rcu(|current| {
            let next: Vec<_> = current.iter().filter(|r| !remove(r)).cloned().collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    /// Running or pending instance of `name` under `group`.
    pub fn find(&self, name: &str, group: GroupId) -> Option<Arc<RecallInstance>> {
        self.0.load().iter().find(|r| r.matches(name, group)).cloned()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.0.load().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Templates and runtime lists attached to one channel or device.
#[derive(Debug, Clone, Default)]
pub struct RecallSlots {
    /// Templates for top-level invocations.
    pub play_templates: Vec<Arc<RecallInstance>>,
    /// Templates for nested invocations.
    pub recall_templates: Vec<Arc<RecallInstance>>,
    /// Running instances for top-level invocations.
    pub play: RecallList,
    /// Running instances for nested invocations.
    pub recall: RecallList,
}

impl RecallSlots {
    /// Templates of a scope.
    pub fn templates(&self, scope: RecallScope) -> &[Arc<RecallInstance>] {
        match scope {
            RecallScope::Play => &self.play_templates,
            RecallScope::Recall => &self.recall_templates,
        }
    }

    /// Runtime list of a scope.
    pub fn list(&self, scope: RecallScope) -> &RecallList {
        match scope {
            RecallScope::Play => &self.play,
            RecallScope::Recall => &self.recall,
        }
    }

    pub(crate) fn add_template(&mut self, scope: RecallScope, template: Arc<RecallInstance>) {
        match scope {
            RecallScope::Play => self.play_templates.push(template),
            RecallScope::Recall => self.recall_templates.push(template),
        }
    }
}

/// Constructor registered by a plugin bridge.
pub type BehaviorFactory = Arc<dyn Fn() -> Arc<dyn Behavior> + Send + Sync>;

/// Named behavior constructors.
#[derive(Clone, Default)]
pub struct BehaviorRegistry {
    factories: HashMap<String, BehaviorFactory>,
}

impl fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("BehaviorRegistry").field("names", &names).finish()
    }
}

impl BehaviorRegistry {
    /// Register or replace the factory for `name`.
    pub fn register(&mut self, name: &str, factory: BehaviorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Construct a behavior by name.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Behavior>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RoutingError::UnknownBehavior(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{BehaviorDef, StageContext, StageOutcome};
    use crate::error::BehaviorError;
    use crate::graph::DeviceId;

    struct Silent;

    impl BehaviorDef for Silent {
        type State = ();

        fn init_state(&self, _samplerate: u32, _buffer_size: usize) {}

        fn run_stage(&self, _state: &mut (), _cx: &StageContext<'_>) -> std::result::Result<StageOutcome, BehaviorError> {
            Ok(StageOutcome::Continue)
        }
    }

    fn template() -> Arc<RecallInstance> {
        Arc::new(RecallInstance::template(
            "silent",
            Owner::Device(DeviceId(0)),
            Arc::new(Silent),
            PurposeSet::ALL,
        ))
    }

    #[test]
    fn instantiate_links_back_to_template() {
        let t = template();
        let inst = RecallInstance::instantiate(&t, GroupId(3), 44100, 64);
        assert_eq!(inst.state(), RecallState::Running);
        assert_eq!(inst.dependencies(), 1);
        assert!(inst.matches("silent", GroupId(3)));
        assert_eq!(inst.template_of().map(|t| t.id()), Some(t.id()));
        assert_ne!(inst.id(), t.id());
    }

    #[test]
    fn list_push_and_remove_publish_new_snapshots() {
        let t = template();
        let list = RecallList::default();
        let before = list.snapshot();
        list.push(Arc::new(RecallInstance::instantiate(&t, GroupId(1), 44100, 64)));
        list.push(Arc::new(RecallInstance::instantiate(&t, GroupId(2), 44100, 64)));
        assert!(before.is_empty());
        assert_eq!(list.len(), 2);
        assert!(list.find("silent", GroupId(2)).is_some());
        assert_eq!(list.remove_where(|r| r.group_id() == Some(GroupId(1))), 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn registry_reports_unknown_names() {
        let mut registry = BehaviorRegistry::default();
        registry.register("silent", Arc::new(|| Arc::new(Silent) as Arc<dyn Behavior>));
        assert!(registry.create("silent").is_ok());
        assert_eq!(
            registry.create("missing").err(),
            Some(RoutingError::UnknownBehavior("missing".into()))
        );
    }
}
