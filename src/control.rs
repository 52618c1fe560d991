//! Walker event types for realtime → control communication.
//!
//! The walker pushes these through a lock-free SPSC queue when a behavior
//! fails or a canceled invocation has been drained. The control thread drains
//! the queue, logs failures and destroys drained invocations.
//!
//! Events are hints: a full queue drops them instead of blocking, and the
//! control thread falls back to the contexts' drained flags.

use crate::context::GroupId;
use crate::error::BehaviorError;
use crate::graph::Owner;
use crate::recall::RecallId;
use rtrb::{Consumer, Producer, RingBuffer};

/// Default capacity for the walker event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Creates a new walker event queue pair.
///
/// Returns (producer for the walker, consumer for the control thread).
pub fn new_event_queue(capacity: usize) -> (Producer<WalkerEvent>, Consumer<WalkerEvent>) {
    RingBuffer::new(capacity)
}

/// Facts the walker reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum WalkerEvent {
    /// A stage callback failed or panicked; the instance is pending removal.
    BehaviorFailed {
        /// Failing instance.
        recall: RecallId,
        /// Where it is attached.
        owner: Owner,
        /// Group it ran under.
        group: GroupId,
        /// What went wrong.
        error: BehaviorError,
    },

    /// A recall reported completion.
    RecallDone {
        /// Finished instance.
        recall: RecallId,
        /// Group it ran under.
        group: GroupId,
    },

    /// Instances were pruned from runtime lists.
    Pruned {
        /// Group whose instances were removed.
        group: GroupId,
        /// How many.
        count: usize,
    },

    /// A canceled top-level invocation has no instances left anywhere.
    InvocationDrained {
        /// Top-level group.
        group: GroupId,
    },
}

impl WalkerEvent {
    /// Group the event concerns.
    pub fn group(&self) -> GroupId {
        match self {
            WalkerEvent::BehaviorFailed { group, .. } => *group,
            WalkerEvent::RecallDone { group, .. } => *group,
            WalkerEvent::Pruned { group, .. } => *group,
            WalkerEvent::InvocationDrained { group } => *group,
        }
    }

    /// Returns a human-readable description (for debugging).
    pub fn description(&self) -> &'static str {
        match self {
            WalkerEvent::BehaviorFailed { .. } => "BehaviorFailed",
            WalkerEvent::RecallDone { .. } => "RecallDone",
            WalkerEvent::Pruned { .. } => "Pruned",
            WalkerEvent::InvocationDrained { .. } => "InvocationDrained",
        }
    }
}

/// Where the walker sends events.
pub trait EventSink {
    /// Deliver an event; may drop it.
    fn emit(&mut self, event: WalkerEvent);
}

impl EventSink for Producer<WalkerEvent> {
    #[inline]
    fn emit(&mut self, event: WalkerEvent) {
        // Full queue: drop rather than block.
        let _ = self.push(event);
    }
}

impl EventSink for Vec<WalkerEvent> {
    fn emit(&mut self, event: WalkerEvent) {
        self.push(event);
    }
}

/// Drains all pending events from the queue.
pub fn drain_events(rx: &mut Consumer<WalkerEvent>) -> Vec<WalkerEvent> {
    let mut events = Vec::with_capacity(rx.slots());
    while let Ok(event) = rx.pop() {
        events.push(event);
    }
    events
}
