//! Link Manager and recycling splice behavior across devices.

use recall_graph::graph::{ChannelId, DeviceFlags, DeviceId, Graph, Owner};
use recall_graph::link::{set_link, would_loop};
use recall_graph::splice::set_recycling;
use recall_graph::RoutingError;

fn source(graph: &mut Graph) -> (DeviceId, ChannelId) {
    let flags = DeviceFlags::default().with_output_owns_recycling(true);
    let (dev, _) = graph.add_device(flags, 1, 1, 0).unwrap();
    (dev, graph.device(dev).unwrap().outputs[0])
}

fn mixer(graph: &mut Graph, pads: usize) -> DeviceId {
    let flags = DeviceFlags::default().with_input_async(true);
    graph.add_device(flags, 1, 1, pads).unwrap().0
}

fn assert_round_trip(graph: &Graph) {
    let chain = graph.chain();
    assert!(chain.verify());
    for head in chain.heads() {
        let forward = chain.walk_forward(head);
        let tail = *forward.last().unwrap();
        let mut backward = chain.walk_backward(tail);
        backward.reverse();
        assert_eq!(forward, backward);
    }
}

#[test]
fn link_is_mutual_and_adopts_range() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let mix = mixer(&mut graph, 2);
    let input = graph.device(mix).unwrap().inputs[0];

    set_link(&mut graph, input, Some(out)).unwrap();

    assert_eq!(graph.channel(input).unwrap().link, Some(out));
    assert_eq!(graph.channel(out).unwrap().link, Some(input));
    assert_eq!(graph.channel(input).unwrap().range(), graph.channel(out).unwrap().range());
    assert!(graph.links_mutual());
}

#[test]
fn loop_is_rejected_and_graph_unchanged() {
    let mut graph = Graph::new();
    let a = graph.add_device(DeviceFlags::default(), 1, 1, 1).unwrap().0;
    let b = graph.add_device(DeviceFlags::default(), 1, 1, 1).unwrap().0;
    let (a_out, a_in) = {
        let d = graph.device(a).unwrap();
        (d.outputs[0], d.inputs[0])
    };
    let (b_out, b_in) = {
        let d = graph.device(b).unwrap();
        (d.outputs[0], d.inputs[0])
    };
    set_link(&mut graph, b_in, Some(a_out)).unwrap();
    assert!(would_loop(&graph, b_out, a_in).unwrap());

    let before: Vec<_> = graph.channels().iter().map(|c| (c.link, c.range())).collect();
    let err = set_link(&mut graph, a_in, Some(b_out)).unwrap_err();
    assert_eq!(err, RoutingError::Loop { channel: a_in, peer: b_out });
    let after: Vec<_> = graph.channels().iter().map(|c| (c.link, c.range())).collect();
    assert_eq!(before, after);
}

#[test]
fn linking_a_device_to_itself_is_a_loop() {
    let mut graph = Graph::new();
    let a = graph.add_device(DeviceFlags::default(), 1, 1, 1).unwrap().0;
    let (out, input) = {
        let d = graph.device(a).unwrap();
        (d.outputs[0], d.inputs[0])
    };
    assert!(matches!(
        set_link(&mut graph, out, Some(input)),
        Err(RoutingError::Loop { .. })
    ));
    assert_eq!(graph.channel(out).unwrap().link, None);
}

#[test]
fn same_kind_link_is_rejected() {
    let mut graph = Graph::new();
    let (_, a) = source(&mut graph);
    let (_, b) = source(&mut graph);
    assert_eq!(
        set_link(&mut graph, a, Some(b)),
        Err(RoutingError::KindMismatch { channel: a, peer: b })
    );
}

#[test]
fn relinking_breaks_the_old_link_first() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let mix = mixer(&mut graph, 2);
    let inputs = graph.device(mix).unwrap().inputs.clone();

    set_link(&mut graph, inputs[0], Some(out)).unwrap();
    set_link(&mut graph, inputs[1], Some(out)).unwrap();

    assert_eq!(graph.channel(inputs[0]).unwrap().link, None);
    assert_eq!(graph.channel(inputs[0]).unwrap().range(), (None, None));
    assert_eq!(graph.channel(inputs[1]).unwrap().link, Some(out));
    assert!(graph.links_mutual());
    assert_round_trip(&graph);
}

#[test]
fn unlink_clears_adopted_range_upward() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let mix = mixer(&mut graph, 1);
    let input = graph.device(mix).unwrap().inputs[0];
    let mix_out = graph.device(mix).unwrap().outputs[0];

    set_link(&mut graph, input, Some(out)).unwrap();
    assert!(graph.channel(mix_out).unwrap().first_recycling.is_some());

    let changes = set_link(&mut graph, input, None).unwrap();
    assert_eq!(graph.channel(input).unwrap().range(), (None, None));
    assert_eq!(graph.channel(mix_out).unwrap().range(), (None, None));
    assert_eq!(changes[0].owner, Owner::Channel(input));
    assert!(changes.iter().any(|c| c.owner == Owner::Device(mix)));
    // The source keeps its own segment.
    assert!(graph.channel(out).unwrap().first_recycling.is_some());
}

#[test]
fn mixer_pads_are_spliced_in_pad_order() {
    let mut graph = Graph::new();
    let sources: Vec<_> = (0..3).map(|_| source(&mut graph).1).collect();
    let mix = mixer(&mut graph, 3);
    let inputs = graph.device(mix).unwrap().inputs.clone();
    let mix_out = graph.device(mix).unwrap().outputs[0];

    // Link out of order so both neighbor searches are exercised.
    set_link(&mut graph, inputs[2], Some(sources[2])).unwrap();
    set_link(&mut graph, inputs[0], Some(sources[0])).unwrap();
    set_link(&mut graph, inputs[1], Some(sources[1])).unwrap();

    let segs: Vec<_> = sources
        .iter()
        .map(|&s| graph.channel(s).unwrap().first_recycling.unwrap())
        .collect();
    assert_eq!(graph.segments_of(mix_out).unwrap(), segs);
    assert!(graph.ranges_contiguous());
    assert_round_trip(&graph);

    // Pull the middle pad: the outer pads close the gap.
    set_link(&mut graph, inputs[1], None).unwrap();
    assert_eq!(graph.segments_of(mix_out).unwrap(), vec![segs[0], segs[2]]);
    assert_round_trip(&graph);
}

#[test]
fn nested_mixers_splice_against_outer_neighbors() {
    let mut graph = Graph::new();
    let a = source(&mut graph).1;
    let b = source(&mut graph).1;
    let x = source(&mut graph).1;
    let inner = mixer(&mut graph, 2);
    let outer = mixer(&mut graph, 2);
    let inner_in = graph.device(inner).unwrap().inputs.clone();
    let inner_out = graph.device(inner).unwrap().outputs[0];
    let outer_in = graph.device(outer).unwrap().inputs.clone();
    let outer_out = graph.device(outer).unwrap().outputs[0];

    set_link(&mut graph, inner_in[0], Some(a)).unwrap();
    set_link(&mut graph, outer_in[0], Some(inner_out)).unwrap();
    set_link(&mut graph, outer_in[1], Some(x)).unwrap();
    set_link(&mut graph, inner_in[1], Some(b)).unwrap();

    let seg = |ch| graph.channel(ch).unwrap().first_recycling.unwrap();
    let (sa, sb, sx) = (seg(a), seg(b), seg(x));
    assert_eq!(graph.segments_of(outer_out).unwrap(), vec![sa, sb, sx]);
    assert_round_trip(&graph);
}

#[test]
fn input_owning_device_keeps_its_range_on_link() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let owning = DeviceFlags::default().with_input_owns_recycling(true);
    let (voice, _) = graph.add_device(owning, 1, 1, 1).unwrap();
    let input = graph.device(voice).unwrap().inputs[0];
    let own = graph.channel(input).unwrap().range();

    set_link(&mut graph, input, Some(out)).unwrap();
    assert_eq!(graph.channel(input).unwrap().range(), own);
    assert_ne!(graph.channel(out).unwrap().range(), own);
}

#[test]
fn splice_sets_parent_at_owning_boundary() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let mix = mixer(&mut graph, 1);
    let input = graph.device(mix).unwrap().inputs[0];
    set_link(&mut graph, input, Some(out)).unwrap();

    let seg = graph.channel(out).unwrap().first_recycling.unwrap();
    // Adopting through a non-owning mixer leaves the source as owner.
    assert_eq!(graph.chain().get(seg).unwrap().parent, Some(out));

    let fresh = graph.alloc_recycling(None);
    set_recycling(&mut graph, out, Some(fresh), Some(fresh), false, true).unwrap();
    assert!(!graph.chain().contains(seg));
    assert_eq!(graph.channel(input).unwrap().range(), (Some(fresh), Some(fresh)));
    assert_eq!(graph.chain().get(fresh).unwrap().parent, Some(out));
}

#[test]
fn invalid_range_leaves_graph_untouched() {
    let mut graph = Graph::new();
    let (_, out) = source(&mut graph);
    let a = graph.alloc_recycling(None);
    let b = graph.alloc_recycling(None);
    let before = graph.channel(out).unwrap().range();
    assert_eq!(
        set_recycling(&mut graph, out, Some(a), Some(b), true, false),
        Err(RoutingError::InvalidRange { first: Some(a), last: Some(b) })
    );
    assert_eq!(graph.channel(out).unwrap().range(), before);
}

/// Two sources feeding an inner two-pad mixer nested in a one-pad outer mixer.
fn nested_rig(graph: &mut Graph) -> (ChannelId, ChannelId, Vec<ChannelId>, ChannelId, ChannelId) {
    let s0 = source(graph).1;
    let s1 = source(graph).1;
    let inner = mixer(graph, 2);
    let outer = mixer(graph, 1);
    let inner_in = graph.device(inner).unwrap().inputs.clone();
    let inner_out = graph.device(inner).unwrap().outputs[0];
    let outer_in = graph.device(outer).unwrap().inputs[0];
    set_link(graph, outer_in, Some(inner_out)).unwrap();
    set_link(graph, inner_in[1], Some(s1)).unwrap();
    set_link(graph, inner_in[0], Some(s0)).unwrap();
    (s0, s1, inner_in, inner_out, outer_in)
}

fn assert_relinked(
    graph: &Graph,
    (s0, s1): (ChannelId, ChannelId),
    inner_in: &[ChannelId],
    inner_out: ChannelId,
    outer_in: ChannelId,
) {
    assert_eq!(graph.channel(outer_in).unwrap().link, Some(s0));
    assert_eq!(graph.channel(s0).unwrap().link, Some(outer_in));
    assert_eq!(graph.channel(inner_in[0]).unwrap().link, None);
    assert_eq!(graph.channel(inner_out).unwrap().link, None);
    assert_eq!(graph.channel(outer_in).unwrap().range(), graph.channel(s0).unwrap().range());
    assert_eq!(graph.channel(inner_in[0]).unwrap().range(), (None, None));
    assert_eq!(graph.channel(inner_out).unwrap().range(), graph.channel(s1).unwrap().range());
    assert!(graph.links_mutual());
    assert!(graph.ranges_contiguous());
    assert_round_trip(graph);
}

#[test]
fn moving_a_nested_producer_up_a_level_keeps_ranges_contiguous() {
    let mut graph = Graph::new();
    let (s0, s1, inner_in, inner_out, outer_in) = nested_rig(&mut graph);
    assert_eq!(graph.segments_of(outer_in).unwrap().len(), 2);

    set_link(&mut graph, outer_in, Some(s0)).unwrap();
    assert_relinked(&graph, (s0, s1), &inner_in, inner_out, outer_in);
}

#[test]
fn moving_a_nested_producer_from_the_output_side() {
    let mut graph = Graph::new();
    let (s0, s1, inner_in, inner_out, outer_in) = nested_rig(&mut graph);

    set_link(&mut graph, s0, Some(outer_in)).unwrap();
    assert_relinked(&graph, (s0, s1), &inner_in, inner_out, outer_in);
}
