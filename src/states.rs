//! Small state enums shared by the walker, recalls and contexts.

// Everything here is Copy and fits in an atomic; the realtime path reads and
// writes these without locking.

/// Lifecycle of a recall instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecallState {
    /// Attached to an owner as a blueprint; never runs.
    Template = 0,
    /// Duplicated for an invocation and receiving stage callbacks.
    Running = 1,
    /// Finished, failed or canceled; removed at the next stage boundary.
    PendingRemoval = 2,
}

impl RecallState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RecallState::Template,
            1 => RecallState::Running,
            _ => RecallState::PendingRemoval,
        }
    }
}

/// Walker stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Runs once after duplication; may allocate.
    Init = 0,
    /// Runs once per device tick; must not block or allocate.
    Play = 1,
    /// Cancellation observed and drained.
    Cancel = 2,
}

/// Sub-phase of a stage. Order is fixed: pre, inter, post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// First pass.
    Pre = 0,
    /// Second pass.
    Inter = 1,
    /// Final pass.
    Post = 2,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Pre, Phase::Inter, Phase::Post];
}

/// Bit of the per-context "reached" mask for a stage/phase pair.
pub(crate) fn stage_bit(stage: Stage, phase: Phase) -> u16 {
    1 << (stage as u16 * 3 + phase as u16)
}

/// Mask covering every phase of a stage.
pub(crate) fn stage_mask(stage: Stage) -> u16 {
    0b111 << (stage as u16 * 3)
}

/// What an invocation is for; templates opt into the purposes they serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Purpose {
    /// Plain audio playback.
    Playback,
    /// Pattern sequencer playback.
    Sequencer,
    /// Notation playback.
    Notation,
}

/// Set of purposes a template serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PurposeSet(u8);

impl PurposeSet {
    /// Serves every purpose.
    pub const ALL: PurposeSet = PurposeSet(0b111);
    /// Serves nothing.
    pub const NONE: PurposeSet = PurposeSet(0);

    /// Set containing only `purpose`.
    pub fn only(purpose: Purpose) -> Self {
        PurposeSet(1 << purpose as u8)
    }

    /// Add a purpose.
    pub fn with(self, purpose: Purpose) -> Self {
        PurposeSet(self.0 | 1 << purpose as u8)
    }

    /// Whether `purpose` is in the set.
    pub fn contains(self, purpose: Purpose) -> bool {
        self.0 & (1 << purpose as u8) != 0
    }
}

impl Default for PurposeSet {
    fn default() -> Self {
        PurposeSet::ALL
    }
}

impl From<Purpose> for PurposeSet {
    fn from(purpose: Purpose) -> Self {
        PurposeSet::only(purpose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bits_do_not_overlap() {
        let mut seen = 0u16;
        for stage in [Stage::Init, Stage::Play, Stage::Cancel] {
            for phase in Phase::ALL {
                let bit = stage_bit(stage, phase);
                assert_eq!(seen & bit, 0);
                assert_ne!(stage_mask(stage) & bit, 0);
                seen |= bit;
            }
        }
    }

    #[test]
    fn purpose_set_membership() {
        let set = PurposeSet::only(Purpose::Sequencer).with(Purpose::Notation);
        assert!(set.contains(Purpose::Sequencer));
        assert!(set.contains(Purpose::Notation));
        assert!(!set.contains(Purpose::Playback));
        assert!(PurposeSet::ALL.contains(Purpose::Playback));
        assert!(!PurposeSet::NONE.contains(Purpose::Playback));
    }

    #[test]
    fn recall_state_round_trips_through_u8() {
        for state in [RecallState::Template, RecallState::Running, RecallState::PendingRemoval] {
            assert_eq!(RecallState::from_u8(state as u8), state);
        }
    }
}
