//! Recycling chain: the ordered, doubly linked buffer segments that channels
//! reference by `[first, last]` sub-ranges.
//!
//! Segments live in an arena addressed by stable [`RecyclingId`]s. Released
//! slots are never reused, so a stale id held by an invocation context can be
//! detected instead of silently aliasing a newer segment.

use crate::context::GroupId;
use crate::graph::ChannelId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Stable index of a segment in the [`RecyclingChain`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecyclingId(pub usize);

impl fmt::Display for RecyclingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// One invocation's sample buffer on a segment.
#[derive(Debug)]
pub struct AudioSignal {
    /// Top-level invocation owning the buffer.
    pub group_id: GroupId,
    /// Sample data, `buffer_size` frames.
    pub samples: Vec<f32>,
}

/// Per-invocation queue of sample buffers attached to a segment.
///
/// Shared between graph snapshots, so the buffers survive topology publishes.
/// Only the Play stage of the owning invocation writes sample content.
#[derive(Debug, Default)]
pub struct SegmentBuffers {
    signals: Mutex<Vec<AudioSignal>>,
}

impl SegmentBuffers {
    /// Allocate a zeroed buffer for `group_id` unless one exists.
    pub fn ensure(&self, group_id: GroupId, frames: usize) {
        let mut signals = self.signals.lock();
        if !signals.iter().any(|s| s.group_id == group_id) {
            signals.push(AudioSignal {
                group_id,
                samples: vec![0.0; frames],
            });
        }
    }

    /// Drop the buffer owned by `group_id`. Returns whether one existed.
    pub fn remove(&self, group_id: GroupId) -> bool {
        let mut signals = self.signals.lock();
        let before = signals.len();
        signals.retain(|s| s.group_id != group_id);
        signals.len() != before
    }

    /// Run `f` on the buffer of `group_id`, blocking for the lock.
    pub fn with_signal<R>(&self, group_id: GroupId, f: impl FnOnce(&mut [f32]) -> R) -> Option<R> {
        let mut signals = self.signals.lock();
        signals
            .iter_mut()
            .find(|s| s.group_id == group_id)
            .map(|s| f(&mut s.samples))
    }

    /// Like [`with_signal`](Self::with_signal) but gives up if the lock is held.
    pub fn try_with_signal<R>(
        &self,
        group_id: GroupId,
        f: impl FnOnce(&mut [f32]) -> R,
    ) -> Option<R> {
        let mut signals = self.signals.try_lock()?;
        signals
            .iter_mut()
            .find(|s| s.group_id == group_id)
            .map(|s| f(&mut s.samples))
    }

    /// Number of invocations holding a buffer here.
    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    /// Whether no invocation holds a buffer here.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A buffer segment in the global chain.
#[derive(Debug, Clone)]
pub struct Recycling {
    /// Previous segment in chain order.
    pub prev: Option<RecyclingId>,
    /// Next segment in chain order.
    pub next: Option<RecyclingId>,
    /// Channel exclusively owning this segment; `None` when an output-side
    /// aggregator summarizes it.
    pub parent: Option<ChannelId>,
    buffers: Arc<SegmentBuffers>,
}

impl Recycling {
    /// Sample buffers attached to this segment.
    pub fn buffers(&self) -> &Arc<SegmentBuffers> {
        &self.buffers
    }
}

/// Arena of all segments plus their chain pointers.
#[derive(Debug, Clone, Default)]
pub struct RecyclingChain {
    slots: Vec<Option<Recycling>>,
}

impl RecyclingChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached segment.
    pub fn alloc(&mut self, parent: Option<ChannelId>) -> RecyclingId {
        let id = RecyclingId(self.slots.len());
        self.slots.push(Some(Recycling {
            prev: None,
            next: None,
            parent,
            buffers: Arc::new(SegmentBuffers::default()),
        }));
        id
    }

    /// Release a segment, unhooking any neighbor that still points at it.
    pub fn release(&mut self, id: RecyclingId) -> bool {
        let Some(seg) = self.slots.get_mut(id.0).and_then(Option::take) else {
            return false;
        };
        if let Some(p) = seg.prev.and_then(|p| self.get_mut(p)) {
            if p.next == Some(id) {
                p.next = None;
            }
        }
        if let Some(n) = seg.next.and_then(|n| self.get_mut(n)) {
            if n.prev == Some(id) {
                n.prev = None;
            }
        }
        true
    }

    /// Look up a live segment.
    pub fn get(&self, id: RecyclingId) -> Option<&Recycling> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Mutable lookup of a live segment.
    pub fn get_mut(&mut self, id: RecyclingId) -> Option<&mut Recycling> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Whether `id` names a live segment.
    pub fn contains(&self, id: RecyclingId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the chain holds no live segments.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live segments in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (RecyclingId, &Recycling)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (RecyclingId(i), s)))
    }

    /// Successor of `id`.
    pub fn next(&self, id: RecyclingId) -> Option<RecyclingId> {
        self.get(id).and_then(|s| s.next)
    }

    /// Predecessor of `id`.
    pub fn prev(&self, id: RecyclingId) -> Option<RecyclingId> {
        self.get(id).and_then(|s| s.prev)
    }

    pub(crate) fn set_next(&mut self, id: RecyclingId, next: Option<RecyclingId>) {
        if let Some(seg) = self.get_mut(id) {
            seg.next = next;
        }
    }

    pub(crate) fn set_prev(&mut self, id: RecyclingId, prev: Option<RecyclingId>) {
        if let Some(seg) = self.get_mut(id) {
            seg.prev = prev;
        }
    }

    pub(crate) fn set_parent(&mut self, id: RecyclingId, parent: Option<ChannelId>) {
        if let Some(seg) = self.get_mut(id) {
            seg.parent = parent;
        }
    }

    /// Collect `[first, last]` by walking `next` pointers.
    ///
    /// `None` when either end is dead or `last` is not reachable from `first`.
    pub fn range(&self, first: RecyclingId, last: RecyclingId) -> Option<Vec<RecyclingId>> {
        if !self.contains(first) || !self.contains(last) {
            return None;
        }
        let limit = self.slots.len();
        let mut out = Vec::new();
        let mut cur = Some(first);
        while let Some(id) = cur {
            if out.len() > limit {
                return None;
            }
            out.push(id);
            if id == last {
                return Some(out);
            }
            cur = self.next(id);
        }
        None
    }

    /// Segments without a predecessor.
    pub fn heads(&self) -> Vec<RecyclingId> {
        self.iter()
            .filter(|(_, s)| s.prev.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    /// Follow `next` from `head` to the chain end.
    pub fn walk_forward(&self, head: RecyclingId) -> Vec<RecyclingId> {
        self.walk(head, |s| s.next)
    }

    /// Follow `prev` from `tail` to the chain start.
    pub fn walk_backward(&self, tail: RecyclingId) -> Vec<RecyclingId> {
        self.walk(tail, |s| s.prev)
    }

    fn walk(&self, start: RecyclingId, step: impl Fn(&Recycling) -> Option<RecyclingId>) -> Vec<RecyclingId> {
        let limit = self.slots.len();
        let mut out = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let Some(seg) = self.get(id) else { break };
            if out.len() > limit {
                break;
            }
            out.push(id);
            cur = step(seg);
        }
        out
    }

    /// Check that every pointer is reciprocated, no chain loops, and every
    /// segment is reachable from a head.
    pub fn verify(&self) -> bool {
        for (id, seg) in self.iter() {
            if let Some(n) = seg.next {
                if self.prev(n) != Some(id) {
                    return false;
                }
            }
            if let Some(p) = seg.prev {
                if self.next(p) != Some(id) {
                    return false;
                }
            }
        }
        let mut seen = HashSet::new();
        for head in self.heads() {
            let forward = self.walk_forward(head);
            let Some(&tail) = forward.last() else { continue };
            if self.next(tail).is_some() {
                return false;
            }
            let mut backward = self.walk_backward(tail);
            backward.reverse();
            if backward != forward {
                return false;
            }
            seen.extend(forward);
        }
        seen.len() == self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(n: usize) -> (RecyclingChain, Vec<RecyclingId>) {
        let mut chain = RecyclingChain::new();
        let ids: Vec<_> = (0..n).map(|_| chain.alloc(None)).collect();
        for pair in ids.windows(2) {
            chain.set_next(pair[0], Some(pair[1]));
            chain.set_prev(pair[1], Some(pair[0]));
        }
        (chain, ids)
    }

    #[test]
    fn range_walks_next_pointers() {
        let (chain, ids) = chain_of(4);
        assert_eq!(chain.range(ids[1], ids[3]), Some(ids[1..].to_vec()));
        assert_eq!(chain.range(ids[3], ids[1]), None);
        assert!(chain.verify());
    }

    #[test]
    fn release_unhooks_neighbors() {
        let (mut chain, ids) = chain_of(3);
        assert!(chain.release(ids[2]));
        assert_eq!(chain.next(ids[1]), None);
        assert!(!chain.contains(ids[2]));
        assert!(!chain.release(ids[2]));
        assert!(chain.verify());
    }

    #[test]
    fn verify_catches_one_sided_pointer() {
        let (mut chain, ids) = chain_of(2);
        chain.set_prev(ids[1], None);
        assert!(!chain.verify());
    }

    #[test]
    fn verify_catches_loop() {
        let (mut chain, ids) = chain_of(3);
        chain.set_next(ids[2], Some(ids[0]));
        chain.set_prev(ids[0], Some(ids[2]));
        assert!(!chain.verify());
    }

    #[test]
    fn buffers_are_per_invocation() {
        let buffers = SegmentBuffers::default();
        buffers.ensure(GroupId(1), 8);
        buffers.ensure(GroupId(1), 8);
        buffers.ensure(GroupId(2), 8);
        assert_eq!(buffers.len(), 2);
        buffers.with_signal(GroupId(2), |s| s[0] = 0.5);
        assert_eq!(buffers.with_signal(GroupId(2), |s| s[0]), Some(0.5));
        assert!(buffers.remove(GroupId(1)));
        assert_eq!(buffers.with_signal(GroupId(1), |s| s.len()), None);
    }
}
