use crate::primitives::{Attestation, ValidatorIndex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlashingKind {
    /// Two votes for the same target with different signing roots.
    DoubleVote,
    /// The incoming attestation surrounds a previously recorded one.
    Surrounding,
    /// The incoming attestation is surrounded by a previously recorded one.
    Surrounded,
}

impl SlashingKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoubleVote => "double_vote",
            Self::Surrounding => "surrounding",
            Self::Surrounded => "surrounded",
        }
    }
}

/// Evidence of a slashable offense: two conflicting attestations by the same
/// validator. `attestation_a` is the previously recorded (or batch-earlier)
/// vote, `attestation_b` the one that conflicted with it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlashingEvent {
    pub kind: SlashingKind,
    pub validator_index: ValidatorIndex,
    pub attestation_a: Attestation,
    pub attestation_b: Attestation,
}
