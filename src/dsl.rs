//! DSL module: builder API for routing graphs.

use crate::error::RoutingError;
use crate::graph::{ChannelId, DeviceFlags, DeviceId, Graph};
use crate::link::set_link;
use std::collections::HashMap;
use thiserror::Error;

/// Handle to a device in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(pub DeviceId);

/// The graph builder.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    device_names: HashMap<String, DeviceId>,
}

impl GraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device.
    pub fn device(
        &mut self,
        flags: DeviceFlags,
        audio_channels: usize,
        output_pads: usize,
        input_pads: usize,
    ) -> Result<DeviceHandle, DslError> {
        let (id, _) = self
            .graph
            .add_device(flags, audio_channels, output_pads, input_pads)?;
        Ok(DeviceHandle(id))
    }

    /// Add a named device.
    pub fn device_named(
        &mut self,
        name: &str,
        flags: DeviceFlags,
        audio_channels: usize,
        output_pads: usize,
        input_pads: usize,
    ) -> Result<DeviceHandle, DslError> {
        if self.device_names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        let handle = self.device(flags, audio_channels, output_pads, input_pads)?;
        self.device_names.insert(name.to_string(), handle.0);
        Ok(handle)
    }

    /// Look up a named device.
    pub fn handle(&self, name: &str) -> Result<DeviceHandle, DslError> {
        self.device_names
            .get(name)
            .map(|&id| DeviceHandle(id))
            .ok_or_else(|| DslError::MissingDevice(name.to_string()))
    }

    /// Output channel on `line`.
    pub fn output(&self, device: DeviceHandle, line: usize) -> Result<ChannelId, DslError> {
        let dev = self.graph.device(device.0)?;
        dev.outputs
            .get(line)
            .copied()
            .ok_or(DslError::UnboundLine { device: device.0, line })
    }

    /// Input channel on `line`.
    pub fn input(&self, device: DeviceHandle, line: usize) -> Result<ChannelId, DslError> {
        let dev = self.graph.device(device.0)?;
        dev.inputs
            .get(line)
            .copied()
            .ok_or(DslError::UnboundLine { device: device.0, line })
    }

    /// Link `from`'s output line into `to`'s input line.
    pub fn link(
        &mut self,
        from: DeviceHandle,
        output_line: usize,
        to: DeviceHandle,
        input_line: usize,
    ) -> Result<(), DslError> {
        let output = self.output(from, output_line)?;
        let input = self.input(to, input_line)?;
        set_link(&mut self.graph, input, Some(output))?;
        Ok(())
    }

    /// [`GraphBuilder::link`] by device names.
    pub fn link_named(
        &mut self,
        from: &str,
        output_line: usize,
        to: &str,
        input_line: usize,
    ) -> Result<(), DslError> {
        let (from, to) = (self.handle(from)?, self.handle(to)?);
        self.link(from, output_line, to, input_line)
    }

    /// Build the graph.
    pub fn build(self) -> Graph {
        self.graph
    }
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    /// The graph rejected the operation.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// No device was registered under this name.
    #[error("no device named {0:?}")]
    MissingDevice(String),
    /// A device with this name already exists.
    #[error("device name {0:?} already taken")]
    DuplicateName(String),
    /// The device has no channel on that line.
    #[error("{device} has no channel on line {line}")]
    UnboundLine {
        /// Device addressed.
        device: DeviceId,
        /// Requested line.
        line: usize,
    },
}
