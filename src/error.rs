//! Error types for control-thread operations and behavior callbacks.

use crate::context::GroupId;
use crate::graph::{ChannelId, DeviceId};
use crate::recycling::RecyclingId;
use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced synchronously to the control-thread caller.
///
/// Every variant aborts only the requested operation; the graph stays in its
/// last consistent state.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Linking would close a cycle through the device graph.
    #[error("linking {channel} with {peer} would create a loop")]
    Loop {
        /// The channel the link was requested on.
        channel: ChannelId,
        /// The requested peer.
        peer: ChannelId,
    },
    /// The range endpoints are not part of the same chain, or one was released.
    #[error("invalid recycling range {first:?}..={last:?}")]
    InvalidRange {
        /// Requested head of the range.
        first: Option<RecyclingId>,
        /// Requested tail of the range.
        last: Option<RecyclingId>,
    },
    /// No context has been allocated under this group id.
    #[error("unknown invocation {0}")]
    UnknownInvocation(GroupId),
    /// Channel id out of range.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// Device id out of range.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    /// No factory is registered under this behavior name.
    #[error("no behavior factory registered as {0:?}")]
    UnknownBehavior(String),
    /// Links join exactly one output with one input.
    #[error("cannot link {channel} with {peer}: both are the same kind")]
    KindMismatch {
        /// The channel the link was requested on.
        channel: ChannelId,
        /// The requested peer.
        peer: ChannelId,
    },
}

/// Failure raised inside a single recall instance's stage callback.
///
/// Never aborts a traversal: the walker flags the instance for removal and
/// carries on with the remaining instances.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BehaviorError {
    /// The callback reported an error.
    #[error("behavior failed: {0}")]
    Failed(Cow<'static, str>),
    /// The callback panicked; the panic was contained at the instance boundary.
    #[error("behavior panicked")]
    Panicked,
}

impl BehaviorError {
    /// Shorthand for a static failure message.
    pub fn failed(msg: &'static str) -> Self {
        BehaviorError::Failed(Cow::Borrowed(msg))
    }
}

/// Result alias for control-thread operations.
pub type Result<T> = std::result::Result<T, RoutingError>;
