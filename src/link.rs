//! Link Manager: the single mutual connection between an output and an input.

use crate::error::{Result, RoutingError};
use crate::graph::{ChannelId, ChannelKind, DeviceId, Graph};
use crate::invariant_ppt::{assert_invariant, LINK_MUTUAL, LINK_REJECTS_LOOP};
use crate::splice::{set_recycling, RecyclingChange};
use std::collections::{HashSet, VecDeque};

/// Link `channel` with `peer`, or unlink it when `peer` is `None`.
///
/// Existing links on either end are broken first; inputs left without a
/// producer drop the range they had adopted. The input of the new pair then
/// adopts the output's range unless its device owns its own recycling.
/// A link that would close a cycle is rejected and leaves the graph untouched.
pub fn set_link(
    graph: &mut Graph,
    channel: ChannelId,
    peer: Option<ChannelId>,
) -> Result<Vec<RecyclingChange>> {
    let ch = graph.channel(channel)?;
    let (kind, current) = (ch.kind, ch.link);
    if let Some(peer) = peer {
        if graph.channel(peer)?.kind == kind {
            return Err(RoutingError::KindMismatch { channel, peer });
        }
    }
    if current == peer {
        return Ok(Vec::new());
    }

    let pair = peer.map(|peer| match kind {
        ChannelKind::Output => (channel, peer),
        ChannelKind::Input => (peer, channel),
    });
    if let (Some(peer), Some((output, input))) = (peer, pair) {
        if would_loop(graph, output, input)? {
            tracing::warn!("set_link: {channel} -> {peer} rejected, would create a loop");
            assert_invariant(
                LINK_REJECTS_LOOP,
                graph.channel(channel)?.link == current,
                "Rejected link leaves the old link in place",
                Some("set_link"),
            );
            return Err(RoutingError::Loop { channel, peer });
        }
    }

    let mut changes = Vec::new();
    if let Some(old) = current {
        changes.extend(break_link(graph, channel, old)?);
    }
    if let Some(peer) = peer {
        if let Some(old) = graph.channel(peer)?.link {
            changes.extend(break_link(graph, peer, old)?);
        }
        graph.channel_mut(peer)?.link = Some(channel);
        graph.channel_mut(channel)?.link = Some(peer);
    }
    if let Some((output, input)) = pair {
        if !graph.flags_of(input)?.input_owns_recycling {
            let (first, last) = graph.channel(output)?.range();
            changes.extend(set_recycling(graph, input, first, last, true, true)?);
        }
    }

    assert_invariant(
        LINK_MUTUAL,
        graph.links_mutual(),
        "Every link is reciprocated",
        Some("set_link"),
    );
    tracing::debug!("set_link: {channel} -> {peer:?} ({} changes)", changes.len());
    Ok(changes)
}

/// Unlink `a` from `b` and drop the range the input side had adopted.
///
/// Runs one pair at a time, while every other link still stands, so the
/// cleared range propagates through the same devices that carried it.
fn break_link(graph: &mut Graph, a: ChannelId, b: ChannelId) -> Result<Vec<RecyclingChange>> {
    graph.channel_mut(a)?.link = None;
    graph.channel_mut(b)?.link = None;
    let input = if graph.channel(a)?.is_input() { a } else { b };
    let ch = graph.channel(input)?;
    if ch.range() == (None, None) || graph.flags_of(input)?.input_owns_recycling {
        return Ok(Vec::new());
    }
    set_recycling(graph, input, None, None, true, true)
}

/// Whether linking `output` into `input` closes a cycle: the input's device
/// already feeds, through further links, the output's device.
pub fn would_loop(graph: &Graph, output: ChannelId, input: ChannelId) -> Result<bool> {
    let producer = graph.channel(output)?.device;
    let consumer = graph.channel(input)?.device;
    reaches(graph, consumer, producer)
}

/// Breadth-first over output links from `from`; true if `target` is reached.
fn reaches(graph: &Graph, from: DeviceId, target: DeviceId) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(dev) = queue.pop_front() {
        if dev == target {
            return Ok(true);
        }
        if !seen.insert(dev) {
            continue;
        }
        for &out in &graph.device(dev)?.outputs {
            if let Some(up) = graph.channel(out)?.link {
                queue.push_back(graph.channel(up)?.device);
            }
        }
    }
    Ok(false)
}
