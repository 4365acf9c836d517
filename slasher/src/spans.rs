use std::sync::Arc;

use anyhow::{Context as _, Result};
use database::Database;
use serde::{Deserialize, Serialize};

use crate::{
    chunks::{SpanChunk, SpanKind},
    config::{SlasherConfig, CELL_BYTES},
    error::Error,
    primitives::{Epoch, ValidatorIndex},
};

pub const CHUNK_KEY_PREFIX: u8 = 0x01;
pub const RECORD_KEY_PREFIX: u8 = 0x02;
pub const META_KEY_PREFIX: u8 = 0x03;

const SPAN_KIND_SIZE: usize = size_of::<u8>();
const CHUNK_COORDINATE_SIZE: usize = size_of::<u32>();
const CHUNK_KEY_LENGTH: usize = 1 + SPAN_KIND_SIZE + 2 * CHUNK_COORDINATE_SIZE;

pub type ChunkKeyBytes = [u8; CHUNK_KEY_LENGTH];

const META_KEY: [u8; 5] = [META_KEY_PREFIX, b'm', b'e', b't', b'a'];
const SCHEMA_VERSION: u16 = 1;

/// Identity of one chunk: span kind, validator-chunk row, circular epoch slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkKey {
    pub kind: SpanKind,
    pub validator_chunk: u32,
    pub epoch_chunk: u32,
}

impl ChunkKey {
    pub fn new(
        config: &SlasherConfig,
        kind: SpanKind,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<Self> {
        let validator_chunk = u32::try_from(config.validator_chunk_index(validator_index))?;
        let epoch_chunk = u32::try_from(config.epoch_chunk_index(epoch))?;

        Ok(Self {
            kind,
            validator_chunk,
            epoch_chunk,
        })
    }

    // Big-endian coordinates keep keys ordered by (kind, validator chunk, slot).
    #[must_use]
    pub fn to_bytes(self) -> ChunkKeyBytes {
        let mut key = [0; CHUNK_KEY_LENGTH];
        key[0] = CHUNK_KEY_PREFIX;
        key[1] = self.kind.tag();
        key[2..6].copy_from_slice(&self.validator_chunk.to_be_bytes());
        key[6..10].copy_from_slice(&self.epoch_chunk.to_be_bytes());
        key
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CHUNK_KEY_LENGTH || bytes[0] != CHUNK_KEY_PREFIX {
            return None;
        }

        let kind = SpanKind::from_tag(bytes[1])?;
        let validator_chunk = u32::from_be_bytes(bytes[2..6].try_into().ok()?);
        let epoch_chunk = u32::from_be_bytes(bytes[6..10].try_into().ok()?);

        Some(Self {
            kind,
            validator_chunk,
            epoch_chunk,
        })
    }
}

/// Parameters the store was created with, persisted so that reopening with a
/// different configuration fails instead of silently misreading chunks.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct StoredMeta {
    pub schema_version: u16,
    pub history_length: u64,
    pub chunk_size: u64,
    pub validator_chunk_size: u64,
    pub cell_width: u8,
    pub highest_processed_epoch: Option<Epoch>,
}

impl StoredMeta {
    fn new(config: &SlasherConfig, highest_processed_epoch: Option<Epoch>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            history_length: config.history_length,
            chunk_size: config.chunk_size,
            validator_chunk_size: config.validator_chunk_size,
            cell_width: CELL_BYTES as u8,
            highest_processed_epoch,
        }
    }

    fn matches(&self, config: &SlasherConfig) -> bool {
        let Self {
            schema_version,
            history_length,
            chunk_size,
            validator_chunk_size,
            cell_width,
            highest_processed_epoch: _,
        } = *self;

        schema_version == SCHEMA_VERSION
            && history_length == config.history_length
            && chunk_size == config.chunk_size
            && validator_chunk_size == config.validator_chunk_size
            && usize::from(cell_width) == CELL_BYTES
    }
}

/// The persistent side of the span history: a single key-value namespace
/// holding compressed chunks, attestation records and the meta record, told
/// apart by one-byte key prefixes.
pub struct SpanStore {
    config: SlasherConfig,
    db: Arc<Database>,
}

impl SpanStore {
    pub const fn new(config: SlasherConfig, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    pub fn load_chunk(&self, key: ChunkKey) -> Result<Option<SpanChunk>> {
        let bytes = self
            .db
            .get(key.to_bytes())
            .context(Error::StoreUnavailable)?;

        bytes
            .map(|bytes| SpanChunk::decode(&self.config, key.kind, &bytes))
            .transpose()
    }

    /// Commits all pairs atomically; chunks, records and meta from one batch
    /// must go through a single call so a crash cannot split them.
    pub fn write_batch(
        &self,
        pairs: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        self.db.put_batch(pairs).context(Error::StoreUnavailable)
    }

    pub fn meta_pair(&self, highest_processed_epoch: Option<Epoch>) -> Result<(Vec<u8>, Vec<u8>)> {
        let meta = StoredMeta::new(&self.config, highest_processed_epoch);
        Ok((META_KEY.to_vec(), bincode::serialize(&meta)?))
    }

    pub fn load_meta(&self) -> Result<Option<StoredMeta>> {
        let Some(bytes) = self.db.get(META_KEY).context(Error::StoreUnavailable)? else {
            return Ok(None);
        };

        let meta = bincode::deserialize(&bytes).map_err(|_| Error::Corruption {
            expected: size_of::<StoredMeta>(),
            found: bytes.len(),
        })?;

        Ok(Some(meta))
    }

    /// Checks the persisted parameters against the configured ones, writing
    /// the meta record on first open. Returns the recovery point.
    pub fn verify_or_init_meta(&self) -> Result<Option<Epoch>> {
        match self.load_meta()? {
            Some(meta) => {
                anyhow::ensure!(
                    meta.matches(&self.config),
                    Error::SchemaMismatch {
                        expected: format!("{:?}", StoredMeta::new(&self.config, None)),
                        found: format!("{meta:?}"),
                    },
                );

                Ok(meta.highest_processed_epoch)
            }
            None => {
                self.write_batch([self.meta_pair(None)?])?;
                Ok(None)
            }
        }
    }

    /// All chunk keys currently present, in key order.
    pub fn chunk_keys(&self) -> Result<Vec<ChunkKey>> {
        let mut keys = vec![];

        for result in self.db.iterator_ascending([CHUNK_KEY_PREFIX]..)? {
            let (key, _) = result?;

            let Some(key) = ChunkKey::from_bytes(&key) else {
                break;
            };

            keys.push(key);
        }

        Ok(keys)
    }
}
