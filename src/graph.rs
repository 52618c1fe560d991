//! Graph module: devices, channels and the arena that owns them.
//!
//! Channels and devices are addressed by stable indices. The `link`, sibling
//! and pad pointers are plain ids, so no node owns another and breaking a link
//! is just clearing two fields.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::context::{ContextRecord, GroupId, InvocationContext};
use crate::error::{Result, RoutingError};
use crate::recall::RecallSlots;
use crate::recycling::{RecyclingChain, RecyclingId};
use crate::splice::{set_recycling, RecyclingChange};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Unique identifier for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Direction of a channel, also used to name a device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChannelKind {
    /// Receives signal from the device it links to.
    Input,
    /// Delivers signal to the device it links to.
    Output,
}

/// Something recalls can be attached to and contexts recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
    /// A single channel.
    Channel(ChannelId),
    /// A whole device.
    Device(DeviceId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Channel(id) => id.fmt(f),
            Owner::Device(id) => id.fmt(f),
        }
    }
}

impl From<ChannelId> for Owner {
    fn from(id: ChannelId) -> Self {
        Owner::Channel(id)
    }
}

impl From<DeviceId> for Owner {
    fn from(id: DeviceId) -> Self {
        Owner::Device(id)
    }
}

/// Ability flags of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFlags {
    /// Output channels own fresh segments instead of aggregating the inputs.
    pub output_owns_recycling: bool,
    /// Input channels own fresh segments instead of adopting their links'.
    pub input_owns_recycling: bool,
    /// Inputs fan out per pad and map to outputs by audio channel.
    pub input_is_async: bool,
}

impl DeviceFlags {
    /// Set whether the output side owns its recycling.
    pub fn with_output_owns_recycling(mut self, owns: bool) -> Self {
        self.output_owns_recycling = owns;
        self
    }

    /// Set whether the input side owns its recycling.
    pub fn with_input_owns_recycling(mut self, owns: bool) -> Self {
        self.input_owns_recycling = owns;
        self
    }

    /// Set asynchronous input fan-out.
    pub fn with_input_async(mut self, async_: bool) -> Self {
        self.input_is_async = async_;
        self
    }

    /// Whether the given side owns its recycling.
    pub fn owns(&self, side: ChannelKind) -> bool {
        match side {
            ChannelKind::Input => self.input_owns_recycling,
            ChannelKind::Output => self.output_owns_recycling,
        }
    }
}

/// A single input or output port.
#[derive(Debug, Clone)]
pub struct Channel {
    /// This channel's id.
    pub id: ChannelId,
    /// Input or output.
    pub kind: ChannelKind,
    /// Containing device.
    pub device: DeviceId,
    /// Pad index within its side.
    pub pad: usize,
    /// Audio-channel index within its pad.
    pub audio_channel: usize,
    /// `pad * audio_channels + audio_channel`.
    pub line: usize,
    /// Peer channel in another device.
    pub link: Option<ChannelId>,
    /// Previous sibling on the same pad.
    pub prev: Option<ChannelId>,
    /// Next sibling on the same pad.
    pub next: Option<ChannelId>,
    /// Same audio channel on the previous pad.
    pub prev_pad: Option<ChannelId>,
    /// Same audio channel on the next pad.
    pub next_pad: Option<ChannelId>,
    /// Head of the referenced sub-range.
    pub first_recycling: Option<RecyclingId>,
    /// Tail of the referenced sub-range.
    pub last_recycling: Option<RecyclingId>,
    /// Invocations this channel participates in.
    pub contexts: Vec<ContextRecord>,
    /// Attached recall templates and instances.
    pub recalls: RecallSlots,
}

impl Channel {
    /// The `[first, last]` pair.
    pub fn range(&self) -> (Option<RecyclingId>, Option<RecyclingId>) {
        (self.first_recycling, self.last_recycling)
    }

    /// Whether this channel is an input.
    pub fn is_input(&self) -> bool {
        self.kind == ChannelKind::Input
    }
}

/// A container of output and input channels.
#[derive(Debug, Clone)]
pub struct Device {
    /// This device's id.
    pub id: DeviceId,
    /// Ability flags.
    pub flags: DeviceFlags,
    /// Channels per pad.
    pub audio_channels: usize,
    /// Output channels ordered by line.
    pub outputs: Vec<ChannelId>,
    /// Input channels ordered by line.
    pub inputs: Vec<ChannelId>,
    /// Invocations touching this device.
    pub contexts: Vec<ContextRecord>,
    /// Device-level recall templates and instances.
    pub recalls: RecallSlots,
}

/// The routing graph plus the recycling chain and live invocations.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    channels: Vec<Channel>,
    devices: Vec<Device>,
    pub(crate) chain: RecyclingChain,
    pub(crate) contexts: BTreeMap<GroupId, Arc<InvocationContext>>,
    pub(crate) pending_release: Vec<RecyclingId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device with `audio_channels` lines per pad.
    ///
    /// Owning sides get one fresh segment per channel, spliced into the chain
    /// the same way a later `set_recycling` would.
    pub fn add_device(
        &mut self,
        flags: DeviceFlags,
        audio_channels: usize,
        output_pads: usize,
        input_pads: usize,
    ) -> Result<(DeviceId, Vec<RecyclingChange>)> {
        let id = DeviceId(self.devices.len());
        let outputs = self.add_side(id, ChannelKind::Output, audio_channels, output_pads);
        let inputs = self.add_side(id, ChannelKind::Input, audio_channels, input_pads);
        self.devices.push(Device {
            id,
            flags,
            audio_channels,
            outputs: outputs.clone(),
            inputs: inputs.clone(),
            contexts: Vec::new(),
            recalls: RecallSlots::default(),
        });

        let mut changes = Vec::new();
        if flags.output_owns_recycling {
            for &ch in &outputs {
                let seg = self.chain.alloc(Some(ch));
                changes.extend(set_recycling(self, ch, Some(seg), Some(seg), true, false)?);
            }
        }
        if flags.input_owns_recycling {
            for &ch in &inputs {
                let seg = self.chain.alloc(Some(ch));
                changes.extend(set_recycling(self, ch, Some(seg), Some(seg), true, false)?);
            }
        }
        tracing::debug!(
            "add_device: {id} outputs={} inputs={} flags={flags:?}",
            outputs.len(),
            inputs.len()
        );
        Ok((id, changes))
    }

    fn add_side(
        &mut self,
        device: DeviceId,
        kind: ChannelKind,
        audio_channels: usize,
        pads: usize,
    ) -> Vec<ChannelId> {
        let base = self.channels.len();
        let total = pads * audio_channels;
        let at = |line: usize| ChannelId(base + line);
        for line in 0..total {
            let pad = line / audio_channels;
            let audio_channel = line % audio_channels;
            self.channels.push(Channel {
                id: at(line),
                kind,
                device,
                pad,
                audio_channel,
                line,
                link: None,
                prev: (audio_channel > 0).then(|| at(line - 1)),
                next: (audio_channel + 1 < audio_channels).then(|| at(line + 1)),
                prev_pad: (pad > 0).then(|| at(line - audio_channels)),
                next_pad: (pad + 1 < pads).then(|| at(line + audio_channels)),
                first_recycling: None,
                last_recycling: None,
                contexts: Vec::new(),
                recalls: RecallSlots::default(),
            });
        }
        (0..total).map(at).collect()
    }

    /// Look up a channel.
    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels.get(id.0).ok_or(RoutingError::UnknownChannel(id))
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels.get_mut(id.0).ok_or(RoutingError::UnknownChannel(id))
    }

    /// Look up a device.
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices.get(id.0).ok_or(RoutingError::UnknownDevice(id))
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.devices.get_mut(id.0).ok_or(RoutingError::UnknownDevice(id))
    }

    /// All channels in id order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// All devices in id order.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The global recycling chain.
    pub fn chain(&self) -> &RecyclingChain {
        &self.chain
    }

    /// Create a detached segment, e.g. to hand to `set_recycling`.
    pub fn alloc_recycling(&mut self, parent: Option<ChannelId>) -> RecyclingId {
        self.chain.alloc(parent)
    }

    /// Flags of the device containing `channel`.
    pub fn flags_of(&self, channel: ChannelId) -> Result<DeviceFlags> {
        let device = self.channel(channel)?.device;
        Ok(self.device(device)?.flags)
    }

    /// Output channel an input feeds: by audio channel if async, else by line.
    pub fn paired_output(&self, input: ChannelId) -> Result<Option<ChannelId>> {
        let ch = self.channel(input)?;
        let dev = self.device(ch.device)?;
        let line = if dev.flags.input_is_async {
            ch.audio_channel
        } else {
            ch.line
        };
        Ok(dev.outputs.get(line).copied())
    }

    /// Input channels an output aggregates, in pad order.
    pub fn mapped_inputs(&self, output: ChannelId) -> Result<Vec<ChannelId>> {
        let ch = self.channel(output)?;
        let dev = self.device(ch.device)?;
        if !dev.flags.input_is_async {
            return Ok(dev.inputs.get(ch.line).copied().into_iter().collect());
        }
        if ch.pad != 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut cur = dev.inputs.get(ch.audio_channel).copied();
        while let Some(id) = cur {
            out.push(id);
            cur = self.channel(id)?.next_pad;
        }
        Ok(out)
    }

    /// Recall slots of a channel or device.
    pub fn recalls(&self, owner: Owner) -> Result<&RecallSlots> {
        match owner {
            Owner::Channel(id) => Ok(&self.channel(id)?.recalls),
            Owner::Device(id) => Ok(&self.device(id)?.recalls),
        }
    }

    pub(crate) fn recalls_mut(&mut self, owner: Owner) -> Result<&mut RecallSlots> {
        match owner {
            Owner::Channel(id) => Ok(&mut self.channel_mut(id)?.recalls),
            Owner::Device(id) => Ok(&mut self.device_mut(id)?.recalls),
        }
    }

    /// Context records of a channel or device.
    pub fn contexts_of(&self, owner: Owner) -> Result<&[ContextRecord]> {
        match owner {
            Owner::Channel(id) => Ok(&self.channel(id)?.contexts),
            Owner::Device(id) => Ok(&self.device(id)?.contexts),
        }
    }

    pub(crate) fn contexts_of_mut(&mut self, owner: Owner) -> Result<&mut Vec<ContextRecord>> {
        match owner {
            Owner::Channel(id) => Ok(&mut self.channel_mut(id)?.contexts),
            Owner::Device(id) => Ok(&mut self.device_mut(id)?.contexts),
        }
    }

    /// Live invocation context for `group`.
    pub fn context(&self, group: GroupId) -> Result<&Arc<InvocationContext>> {
        self.contexts
            .get(&group)
            .ok_or(RoutingError::UnknownInvocation(group))
    }

    /// All live invocation contexts.
    pub fn invocations(&self) -> impl Iterator<Item = &Arc<InvocationContext>> {
        self.contexts.values()
    }

    /// Segments of a channel's range, empty when null.
    pub fn segments_of(&self, channel: ChannelId) -> Result<Vec<RecyclingId>> {
        let ch = self.channel(channel)?;
        match ch.range() {
            (Some(first), Some(last)) => {
                self.chain
                    .range(first, last)
                    .ok_or(RoutingError::InvalidRange {
                        first: Some(first),
                        last: Some(last),
                    })
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Whether any channel's range still contains `seg`.
    pub fn is_referenced(&self, seg: RecyclingId) -> bool {
        self.channels.iter().any(|ch| match ch.range() {
            (Some(first), Some(last)) => self
                .chain
                .range(first, last)
                .is_some_and(|r| r.contains(&seg)),
            _ => false,
        })
    }

    /// Whether a live invocation still covers `seg`.
    pub fn is_covered(&self, seg: RecyclingId) -> bool {
        self.contexts.values().any(|c| c.recycling.contains(&seg))
    }

    /// Whether every channel range is contiguous in the chain.
    pub fn ranges_contiguous(&self) -> bool {
        self.channels.iter().all(|ch| match ch.range() {
            (Some(first), Some(last)) => self.chain.range(first, last).is_some(),
            (None, None) => true,
            _ => false,
        })
    }

    /// Whether every link is reciprocated and joins an output with an input.
    pub fn links_mutual(&self) -> bool {
        self.channels.iter().all(|ch| match ch.link {
            None => true,
            Some(peer) => self
                .channels
                .get(peer.0)
                .is_some_and(|p| p.link == Some(ch.id) && p.kind != ch.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_layout_follows_pads_and_lines() {
        let mut graph = Graph::new();
        let (dev, _) = graph
            .add_device(DeviceFlags::default().with_input_async(true), 2, 1, 3)
            .unwrap();
        let device = graph.device(dev).unwrap();
        assert_eq!(device.outputs.len(), 2);
        assert_eq!(device.inputs.len(), 6);

        let in3 = graph.channel(device.inputs[3]).unwrap();
        assert_eq!((in3.pad, in3.audio_channel, in3.line), (1, 1, 3));
        assert_eq!(in3.prev, Some(device.inputs[2]));
        assert_eq!(in3.next, None);
        assert_eq!(in3.prev_pad, Some(device.inputs[1]));
        assert_eq!(in3.next_pad, Some(device.inputs[5]));
    }

    #[test]
    fn async_maps_by_audio_channel() {
        let mut graph = Graph::new();
        let (dev, _) = graph
            .add_device(DeviceFlags::default().with_input_async(true), 2, 1, 3)
            .unwrap();
        let device = graph.device(dev).unwrap().clone();
        assert_eq!(
            graph.paired_output(device.inputs[5]).unwrap(),
            Some(device.outputs[1])
        );
        assert_eq!(
            graph.mapped_inputs(device.outputs[1]).unwrap(),
            vec![device.inputs[1], device.inputs[3], device.inputs[5]]
        );
    }

    #[test]
    fn sync_maps_by_line() {
        let mut graph = Graph::new();
        let (dev, _) = graph.add_device(DeviceFlags::default(), 2, 1, 1).unwrap();
        let device = graph.device(dev).unwrap().clone();
        assert_eq!(
            graph.paired_output(device.inputs[1]).unwrap(),
            Some(device.outputs[1])
        );
        assert_eq!(
            graph.mapped_inputs(device.outputs[0]).unwrap(),
            vec![device.inputs[0]]
        );
    }

    #[test]
    fn owning_sides_get_segments() {
        let mut graph = Graph::new();
        let flags = DeviceFlags::default()
            .with_input_owns_recycling(true)
            .with_output_owns_recycling(true)
            .with_input_async(true);
        let (dev, _) = graph.add_device(flags, 1, 1, 3).unwrap();
        let device = graph.device(dev).unwrap().clone();
        for &ch in device.inputs.iter().chain(&device.outputs) {
            let channel = graph.channel(ch).unwrap();
            assert!(channel.first_recycling.is_some());
            assert_eq!(channel.first_recycling, channel.last_recycling);
        }
        // Input pads chain together; the owning output stays standalone.
        let head = graph.channel(device.inputs[0]).unwrap().first_recycling.unwrap();
        assert_eq!(graph.chain().walk_forward(head).len(), 3);
        assert!(graph.chain().verify());
        assert!(graph.ranges_contiguous());
    }

    #[test]
    fn unknown_ids_are_errors() {
        let graph = Graph::new();
        assert_eq!(
            graph.channel(ChannelId(9)).err(),
            Some(RoutingError::UnknownChannel(ChannelId(9)))
        );
        assert_eq!(
            graph.device(DeviceId(1)).err(),
            Some(RoutingError::UnknownDevice(DeviceId(1)))
        );
    }
}
