pub use ethereum_types::H256;

pub type Epoch = u64;
pub type ValidatorIndex = u64;

/// A single validator's vote, flattened out of an aggregate attestation.
///
/// Expanding committee bitfields into per-validator records is the ingest
/// collaborator's job. The field order matters: the derived `Ord` gives the
/// deterministic processing order within a batch, grouping by validator
/// (and therefore by validator chunk) first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Attestation {
    pub validator_index: ValidatorIndex,
    pub source: Epoch,
    pub target: Epoch,
    pub signing_root: H256,
}

impl Attestation {
    /// `self` strictly surrounds `other`: an earlier source and a later target.
    #[must_use]
    pub const fn surrounds(&self, other: &Self) -> bool {
        self.source < other.source && other.target < self.target
    }
}
