//! Engine configuration.

/// Parameters shared by the control and realtime halves of an engine.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Frames per sample buffer allocated for each covered segment at Init.
    pub buffer_size: usize,
    /// Sample rate handed to behaviors through the stage context.
    pub samplerate: u32,
    /// Capacity of the walker → control event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the realtime invariant signal queue.
    pub invariant_queue_capacity: usize,
}

impl EngineConfig {
    /// Set the per-segment buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the sample rate.
    pub fn with_samplerate(mut self, samplerate: u32) -> Self {
        self.samplerate = samplerate;
        self
    }

    /// Set the walker event queue capacity.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the invariant signal queue capacity.
    pub fn with_invariant_queue_capacity(mut self, capacity: usize) -> Self {
        self.invariant_queue_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512,
            samplerate: 44100,
            event_queue_capacity: 256,
            invariant_queue_capacity: 256,
        }
    }
}
