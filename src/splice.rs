//! Recycling splice: assign a channel's `[first, last]` range, propagate it
//! upward through non-owning devices and relink the global chain around it.

use crate::error::{Result, RoutingError};
use crate::graph::{ChannelId, ChannelKind, Graph, Owner};
use crate::invariant_ppt::{assert_invariant, CHAIN_ROUND_TRIP, RANGE_CONTIGUOUS};
use crate::recycling::RecyclingId;
use std::collections::BTreeSet;

type Range = (Option<RecyclingId>, Option<RecyclingId>);

/// One hop of a splice, reported leaf to root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecyclingChange {
    /// Channel or device whose range changed.
    pub owner: Owner,
    /// Previous head.
    pub old_first: Option<RecyclingId>,
    /// Previous tail.
    pub old_last: Option<RecyclingId>,
    /// New head.
    pub new_first: Option<RecyclingId>,
    /// New tail.
    pub new_last: Option<RecyclingId>,
}

/// Where upward propagation ended.
#[derive(Debug, Clone, Copy)]
enum Stop {
    /// An input at a closure boundary keeps the range for itself.
    Owner(ChannelId),
    /// An unchanged aggregate above already summarizes the range.
    Summarized,
    /// An output with nothing further to propagate into.
    Root(ChannelId),
}

struct SpliceCx {
    update: bool,
    find_prev: bool,
    find_next: bool,
    prev_anchor: Option<ChannelId>,
    next_anchor: Option<ChannelId>,
    changes: Vec<RecyclingChange>,
}

impl SpliceCx {
    fn new(update: bool) -> Self {
        Self {
            update,
            find_prev: true,
            find_next: true,
            prev_anchor: None,
            next_anchor: None,
            changes: Vec::new(),
        }
    }

    fn changed(&mut self, owner: Owner, old: Range, new: Range) {
        tracing::trace!(
            "recycling_changed: {owner} {:?}..{:?} -> {:?}..{:?}",
            old.0,
            old.1,
            new.0,
            new.1
        );
        self.changes.push(RecyclingChange {
            owner,
            old_first: old.0,
            old_last: old.1,
            new_first: new.0,
            new_last: new.1,
        });
    }

    /// Nearest non-null ranges on neighbor pads; each side is searched until
    /// its anchor is found.
    fn search_neighbors(&mut self, graph: &Graph, input: ChannelId) -> Result<()> {
        let ch = graph.channel(input)?;
        if self.find_prev {
            let mut cur = ch.prev_pad;
            while let Some(id) = cur {
                let n = graph.channel(id)?;
                if n.last_recycling.is_some() {
                    self.prev_anchor = Some(id);
                    self.find_prev = false;
                    break;
                }
                cur = n.prev_pad;
            }
        }
        if self.find_next {
            let mut cur = ch.next_pad;
            while let Some(id) = cur {
                let n = graph.channel(id)?;
                if n.first_recycling.is_some() {
                    self.next_anchor = Some(id);
                    self.find_next = false;
                    break;
                }
                cur = n.next_pad;
            }
        }
        Ok(())
    }
}

/// Assign `[first, last]` to `channel` and splice the chain.
///
/// A single null end is normalized to the other end. With `update` unset an
/// unchanged range is a no-op. With `destroy_old` set, segments dropped from
/// the channel that no other channel references are released, or parked until
/// the invocations covering them are gone.
pub fn set_recycling(
    graph: &mut Graph,
    channel: ChannelId,
    first: Option<RecyclingId>,
    last: Option<RecyclingId>,
    update: bool,
    destroy_old: bool,
) -> Result<Vec<RecyclingChange>> {
    let (first, last) = match (first, last) {
        (None, Some(l)) => (Some(l), Some(l)),
        (Some(f), None) => (Some(f), Some(f)),
        other => other,
    };
    let new_segments = match (first, last) {
        (Some(f), Some(l)) => graph
            .chain
            .range(f, l)
            .ok_or(RoutingError::InvalidRange { first, last })?,
        _ => Vec::new(),
    };
    let start = graph.channel(channel)?;
    let old = start.range();
    if old == (first, last) && !update {
        return Ok(Vec::new());
    }
    let is_input = start.is_input();
    let old_segments = graph.segments_of(channel).unwrap_or_default();

    let mut cx = SpliceCx::new(update);
    let stop = if is_input {
        walk_input(graph, &mut cx, channel, (first, last))?
    } else {
        walk_output(graph, &mut cx, channel, (first, last))?
    };

    let new_set: BTreeSet<RecyclingId> = new_segments.iter().copied().collect();
    join(
        graph,
        &cx,
        &new_set,
        (first, last),
        (update || old.0 != first, update || old.1 != last),
        &old_segments,
    )?;

    let parent = match owning_origin(graph, channel, is_input)? {
        Some(origin) => Some(origin),
        None => match stop {
            Stop::Owner(ch) => Some(adopted_from(graph, ch)?.unwrap_or(ch)),
            Stop::Summarized => None,
            Stop::Root(out) => graph.flags_of(out)?.output_owns_recycling.then_some(out),
        },
    };
    for &seg in &new_segments {
        graph.chain.set_parent(seg, parent);
    }

    if destroy_old {
        for &seg in old_segments.iter().filter(|s| !new_set.contains(s)) {
            if graph.is_referenced(seg) {
                continue;
            }
            if graph.is_covered(seg) {
                graph.pending_release.push(seg);
            } else {
                graph.chain.release(seg);
            }
        }
    }

    assert_invariant(
        CHAIN_ROUND_TRIP,
        graph.chain.verify(),
        "Chain walks forward and backward over the same segments",
        Some("set_recycling"),
    );
    assert_invariant(
        RANGE_CONTIGUOUS,
        graph.ranges_contiguous(),
        "Every channel range is contiguous",
        Some("set_recycling"),
    );
    tracing::debug!(
        "set_recycling: {channel} {:?}..{:?} -> {first:?}..{last:?} ({} hops)",
        old.0,
        old.1,
        cx.changes.len()
    );
    Ok(cx.changes)
}

fn walk_input(graph: &mut Graph, cx: &mut SpliceCx, input: ChannelId, range: Range) -> Result<Stop> {
    let (mut input, mut range) = (input, range);
    loop {
        let ch = graph.channel_mut(input)?;
        let old = ch.range();
        ch.first_recycling = range.0;
        ch.last_recycling = range.1;
        let device = ch.device;
        cx.changed(Owner::Channel(input), old, range);

        let flags = graph.device(device)?.flags;
        if flags.input_is_async {
            cx.search_neighbors(graph, input)?;
        }
        if flags.output_owns_recycling {
            return Ok(Stop::Owner(input));
        }
        let Some(output) = graph.paired_output(input)? else {
            return Ok(Stop::Owner(input));
        };
        let aggregate = aggregate(graph, output)?;
        let old_out = graph.channel(output)?.range();
        if aggregate == old_out && !cx.update {
            return Ok(Stop::Summarized);
        }
        cx.changed(Owner::Device(device), old_out, aggregate);
        match assign_output(graph, cx, output, aggregate)? {
            Some(up) => {
                input = up;
                range = aggregate;
            }
            None => return Ok(Stop::Root(output)),
        }
    }
}

fn walk_output(graph: &mut Graph, cx: &mut SpliceCx, output: ChannelId, range: Range) -> Result<Stop> {
    match assign_output(graph, cx, output, range)? {
        Some(up) => walk_input(graph, cx, up, range),
        None => Ok(Stop::Root(output)),
    }
}

/// Set an output's range; returns the linked input to continue into unless
/// that input's device owns its own recycling.
fn assign_output(
    graph: &mut Graph,
    cx: &mut SpliceCx,
    output: ChannelId,
    range: Range,
) -> Result<Option<ChannelId>> {
    let ch = graph.channel_mut(output)?;
    let old = ch.range();
    ch.first_recycling = range.0;
    ch.last_recycling = range.1;
    let link = ch.link;
    cx.changed(Owner::Channel(output), old, range);
    let Some(up) = link else { return Ok(None) };
    if graph.flags_of(up)?.input_owns_recycling {
        return Ok(None);
    }
    Ok(Some(up))
}

/// The channel that owns the range handed to `set_recycling`: the start
/// itself on an owning side, or the owning output an input adopted it from.
fn owning_origin(graph: &Graph, channel: ChannelId, is_input: bool) -> Result<Option<ChannelId>> {
    let flags = graph.flags_of(channel)?;
    let side = if is_input { ChannelKind::Input } else { ChannelKind::Output };
    if flags.owns(side) {
        return Ok(Some(channel));
    }
    if is_input {
        return adopted_from(graph, channel);
    }
    Ok(None)
}

/// The owning output an input took its whole range from, if any.
fn adopted_from(graph: &Graph, input: ChannelId) -> Result<Option<ChannelId>> {
    let ch = graph.channel(input)?;
    let Some(producer) = ch.link else {
        return Ok(None);
    };
    let owns = graph.flags_of(producer)?.output_owns_recycling;
    let same = graph.channel(producer)?.range() == ch.range();
    Ok((owns && same).then_some(producer))
}

/// First non-null head to last non-null tail over the inputs an output maps.
fn aggregate(graph: &Graph, output: ChannelId) -> Result<Range> {
    let inputs = graph.mapped_inputs(output)?;
    let mut first = None;
    let mut last = None;
    for id in inputs {
        let ch = graph.channel(id)?;
        if first.is_none() {
            first = ch.first_recycling;
        }
        if ch.last_recycling.is_some() {
            last = ch.last_recycling;
        }
    }
    Ok((first, last))
}

fn join(
    graph: &mut Graph,
    cx: &SpliceCx,
    new_set: &BTreeSet<RecyclingId>,
    (first, last): Range,
    (rewrite_head, rewrite_tail): (bool, bool),
    old_segments: &[RecyclingId],
) -> Result<()> {
    let outside = |seg: &RecyclingId| !new_set.contains(seg);
    let prev_tail = match cx.prev_anchor {
        Some(c) => graph.channel(c)?.last_recycling.filter(outside),
        None => None,
    };
    let next_head = match cx.next_anchor {
        Some(c) => graph.channel(c)?.first_recycling.filter(outside),
        None => None,
    };

    let chain = &mut graph.chain;
    let mut touched: Vec<RecyclingId> = old_segments.to_vec();
    touched.extend(first.and_then(|f| chain.prev(f)));
    touched.extend(last.and_then(|l| chain.next(l)));
    touched.extend(prev_tail.and_then(|p| chain.next(p)));
    touched.extend(next_head.and_then(|n| chain.prev(n)));

    match (first, last) {
        (Some(f), Some(l)) => {
            if rewrite_head {
                chain.set_prev(f, prev_tail);
                if let Some(p) = prev_tail {
                    chain.set_next(p, Some(f));
                }
            }
            if rewrite_tail {
                chain.set_next(l, next_head);
                if let Some(n) = next_head {
                    chain.set_prev(n, Some(l));
                }
            }
        }
        _ => {
            if let Some(p) = prev_tail {
                chain.set_next(p, next_head);
            }
            if let Some(n) = next_head {
                chain.set_prev(n, prev_tail);
            }
        }
    }

    // Drop pointers the join left one-sided.
    for seg in touched.into_iter().filter(|s| outside(s)) {
        if let Some(p) = chain.prev(seg) {
            if chain.next(p) != Some(seg) {
                chain.set_prev(seg, None);
            }
        }
        if let Some(n) = chain.next(seg) {
            if chain.prev(n) != Some(seg) {
                chain.set_next(seg, None);
            }
        }
    }
    Ok(())
}
