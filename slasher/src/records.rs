use core::ops::Range;
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{ensure, Context as _, Result};
use database::Database;

use crate::{
    error::Error,
    primitives::{Attestation, Epoch, ValidatorIndex, H256},
    spans::RECORD_KEY_PREFIX,
};

const EPOCH_SIZE: usize = size_of::<Epoch>();
const VALIDATOR_INDEX_SIZE: usize = size_of::<ValidatorIndex>();
const ROOT_SIZE: usize = size_of::<H256>();

const RECORD_KEY_LENGTH: usize = 1 + VALIDATOR_INDEX_SIZE + EPOCH_SIZE;
const RECORD_VALUE_LENGTH: usize = EPOCH_SIZE + ROOT_SIZE;

type RecordKey = [u8; RECORD_KEY_LENGTH];
type RecordValue = [u8; RECORD_VALUE_LENGTH];

// Big-endian so one validator's records sort by target epoch.
fn record_key(validator_index: ValidatorIndex, target: Epoch) -> RecordKey {
    let mut key = [0; RECORD_KEY_LENGTH];
    key[0] = RECORD_KEY_PREFIX;
    key[1..9].copy_from_slice(&validator_index.to_be_bytes());
    key[9..17].copy_from_slice(&target.to_be_bytes());
    key
}

fn encode_record(attestation: &Attestation) -> RecordValue {
    let mut value = [0; RECORD_VALUE_LENGTH];
    value[..EPOCH_SIZE].copy_from_slice(&attestation.source.to_le_bytes());
    value[EPOCH_SIZE..].copy_from_slice(attestation.signing_root.as_bytes());
    value
}

fn decode_record(validator_index: ValidatorIndex, target: Epoch, bytes: &[u8]) -> Result<Attestation> {
    ensure!(
        bytes.len() == RECORD_VALUE_LENGTH,
        Error::Corruption {
            expected: RECORD_VALUE_LENGTH,
            found: bytes.len(),
        },
    );

    let source = Epoch::from_le_bytes(bytes[..EPOCH_SIZE].try_into()?);
    let signing_root = H256::from_slice(&bytes[EPOCH_SIZE..]);

    Ok(Attestation {
        validator_index,
        source,
        target,
        signing_root,
    })
}

/// `(validator, target) → (source, signing root)`, the source of truth the
/// span arrays accelerate. One record is retained per key; a conflicting
/// second write never lands, because a conflict is itself the slashing
/// evidence and slashable attestations are not committed.
///
/// Inserts accumulate in a pending overlay so attestations later in a batch
/// see earlier ones, and flush atomically with the span chunks.
pub struct RecordIndex {
    db: Arc<Database>,
    pending: BTreeMap<(ValidatorIndex, Epoch), Attestation>,
}

impl RecordIndex {
    #[must_use]
    pub const fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pending: BTreeMap::new(),
        }
    }

    pub fn find(
        &self,
        validator_index: ValidatorIndex,
        target: Epoch,
    ) -> Result<Option<Attestation>> {
        if let Some(attestation) = self.pending.get(&(validator_index, target)) {
            return Ok(Some(*attestation));
        }

        self.db
            .get(record_key(validator_index, target))
            .context(Error::StoreUnavailable)?
            .map(|bytes| decode_record(validator_index, target, &bytes))
            .transpose()
    }

    pub fn insert_pending(&mut self, attestation: Attestation) {
        self.pending
            .entry((attestation.validator_index, attestation.target))
            .or_insert(attestation);
    }

    /// One validator's records with `target` in the given range, ascending.
    pub fn scan_targets(
        &self,
        validator_index: ValidatorIndex,
        targets: Range<Epoch>,
    ) -> Result<Vec<Attestation>> {
        if targets.is_empty() {
            return Ok(vec![]);
        }

        let mut found = BTreeMap::new();
        let start = record_key(validator_index, targets.start);

        for result in self.db.iterator_ascending(start..)? {
            let (key, value) = result?;

            if key.len() != RECORD_KEY_LENGTH || key[0] != RECORD_KEY_PREFIX {
                break;
            }

            let found_validator = ValidatorIndex::from_be_bytes(key[1..9].try_into()?);
            let target = Epoch::from_be_bytes(key[9..17].try_into()?);

            if found_validator != validator_index || target >= targets.end {
                break;
            }

            found.insert(target, decode_record(validator_index, target, &value)?);
        }

        let pending_range =
            (validator_index, targets.start)..(validator_index, targets.end);

        for ((_, target), attestation) in self.pending.range(pending_range) {
            found.insert(*target, *attestation);
        }

        Ok(found.into_values().collect())
    }

    pub fn flush_pairs(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.pending
            .iter()
            .map(|((validator_index, target), attestation)| {
                (
                    record_key(*validator_index, *target).to_vec(),
                    encode_record(attestation).to_vec(),
                )
            })
            .collect()
    }

    pub fn commit_flush(&mut self) {
        self.pending.clear();
    }

    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Keys of all persisted records with `target < cutoff`, for the pruner.
    pub fn stale_record_keys(&self, cutoff: Epoch) -> Result<Vec<RecordKey>> {
        let mut keys = vec![];

        for result in self.db.iterator_ascending([RECORD_KEY_PREFIX]..)? {
            let (key, _) = result?;

            if key.len() != RECORD_KEY_LENGTH || key[0] != RECORD_KEY_PREFIX {
                break;
            }

            let target = Epoch::from_be_bytes(key[9..17].try_into()?);

            if target < cutoff {
                keys.push(<RecordKey>::try_from(key.as_ref())?);
            }
        }

        Ok(keys)
    }
}
