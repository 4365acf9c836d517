use anyhow::{ensure, Result};
use snap::raw::{Decoder, Encoder};

use crate::{
    config::{SlasherConfig, CELL_BYTES},
    error::Error,
    primitives::{Epoch, ValidatorIndex},
};

/// Cell value meaning "no attestation with a later source recorded".
pub const MIN_SPAN_IDENTITY: u16 = u16::MAX;
/// Cell value meaning "no attestation with an earlier source recorded".
pub const MAX_SPAN_IDENTITY: u16 = 0;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum SpanKind {
    Min,
    Max,
}

impl SpanKind {
    #[must_use]
    pub const fn identity(self) -> u16 {
        match self {
            Self::Min => MIN_SPAN_IDENTITY,
            Self::Max => MAX_SPAN_IDENTITY,
        }
    }

    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Min => 0,
            Self::Max => 1,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Min),
            1 => Some(Self::Max),
            _ => None,
        }
    }
}

/// Result of walking one chunk's worth of a span update.
///
/// `next_epoch` is the epoch the walk continues from in the neighbouring
/// chunk, or `None` when the walk is finished, either because it reached its
/// bound or because a cell already carried a value the candidate cannot
/// improve. The early exit is total: the candidate and the stored reduction
/// both change by exactly one per epoch step, so once a single cell wins,
/// every remaining cell in the walk wins too.
#[derive(Clone, Copy, Debug)]
pub struct WalkOutcome {
    pub changed: bool,
    pub next_epoch: Option<Epoch>,
}

/// A `K × C` block of span cells for one validator chunk and one epoch-chunk
/// slot, row-major by validator.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SpanChunk {
    kind: SpanKind,
    cells: Box<[u16]>,
}

impl SpanChunk {
    #[must_use]
    pub fn blank(config: &SlasherConfig, kind: SpanKind) -> Self {
        Self {
            kind,
            cells: vec![kind.identity(); config.chunk_cells()].into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SpanKind {
        self.kind
    }

    /// Serializes the chunk: cells packed little-endian, then snappy.
    ///
    /// Chunks of mostly-identity cells compress to a few dozen bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(self.cells.len() * CELL_BYTES);

        for cell in &self.cells {
            raw.extend_from_slice(&cell.to_le_bytes());
        }

        Encoder::new().compress_vec(&raw).map_err(Into::into)
    }

    /// Inverse of [`Self::encode`]. Any decompression failure or decompressed
    /// length other than exactly `K · C · 2` bytes is a corruption error.
    pub fn decode(config: &SlasherConfig, kind: SpanKind, bytes: &[u8]) -> Result<Self> {
        let expected = config.chunk_bytes();

        let raw = Decoder::new()
            .decompress_vec(bytes)
            .map_err(|_| Error::Corruption {
                expected,
                found: bytes.len(),
            })?;

        ensure!(
            raw.len() == expected,
            Error::Corruption {
                expected,
                found: raw.len(),
            },
        );

        let cells = raw
            .chunks_exact(CELL_BYTES)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self { kind, cells })
    }

    #[must_use]
    pub fn span_at(
        &self,
        config: &SlasherConfig,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> u16 {
        self.cells[Self::cell_index(config, validator_index, epoch)]
    }

    /// Applies `target`'s span update to this chunk's cells for one validator,
    /// starting at `start_epoch` and walking away from the attestation source:
    /// downward for min spans, upward for max spans. `limit_epoch` is the
    /// furthest epoch the whole walk may touch, inclusive.
    pub fn update(
        &mut self,
        config: &SlasherConfig,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        limit_epoch: Epoch,
        target: Epoch,
    ) -> Result<WalkOutcome> {
        match self.kind {
            SpanKind::Min => {
                self.update_downward(config, validator_index, start_epoch, limit_epoch, target)
            }
            SpanKind::Max => {
                self.update_upward(config, validator_index, start_epoch, limit_epoch, target)
            }
        }
    }

    fn update_downward(
        &mut self,
        config: &SlasherConfig,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        lowest_epoch: Epoch,
        target: Epoch,
    ) -> Result<WalkOutcome> {
        debug_assert!(lowest_epoch <= start_epoch && start_epoch < target);

        let chunk_first = config.chunk_first_epoch(start_epoch);
        let stop_epoch = chunk_first.max(lowest_epoch);
        let mut changed = false;
        let mut epoch = start_epoch;

        loop {
            let candidate = u16::try_from(target - epoch)?;
            let index = Self::cell_index(config, validator_index, epoch);

            if candidate < self.cells[index] {
                self.cells[index] = candidate;
                changed = true;
            } else {
                return Ok(WalkOutcome {
                    changed,
                    next_epoch: None,
                });
            }

            if epoch == stop_epoch {
                break;
            }

            epoch -= 1;
        }

        let next_epoch = (chunk_first > lowest_epoch).then(|| chunk_first - 1);

        Ok(WalkOutcome {
            changed,
            next_epoch,
        })
    }

    fn update_upward(
        &mut self,
        config: &SlasherConfig,
        validator_index: ValidatorIndex,
        start_epoch: Epoch,
        highest_epoch: Epoch,
        target: Epoch,
    ) -> Result<WalkOutcome> {
        debug_assert!(start_epoch <= highest_epoch && highest_epoch < target);

        let chunk_last = config.chunk_last_epoch(start_epoch);
        let stop_epoch = chunk_last.min(highest_epoch);
        let mut changed = false;
        let mut epoch = start_epoch;

        loop {
            let candidate = u16::try_from(target - epoch)?;
            let index = Self::cell_index(config, validator_index, epoch);

            if candidate > self.cells[index] {
                self.cells[index] = candidate;
                changed = true;
            } else {
                return Ok(WalkOutcome {
                    changed,
                    next_epoch: None,
                });
            }

            if epoch == stop_epoch {
                break;
            }

            epoch += 1;
        }

        let next_epoch = (chunk_last < highest_epoch).then(|| chunk_last + 1);

        Ok(WalkOutcome {
            changed,
            next_epoch,
        })
    }

    fn cell_index(
        config: &SlasherConfig,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> usize {
        let row = validator_index % config.validator_chunk_size;
        let column = epoch % config.chunk_size;

        usize::try_from(row * config.chunk_size + column)
            .expect("validated chunk dimensions fit in usize")
    }
}
