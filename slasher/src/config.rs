use core::time::Duration;

use anyhow::{ensure, Result};
use derivative::Derivative;

use crate::primitives::{Epoch, ValidatorIndex};

pub const CELL_BYTES: usize = size_of::<u16>();

/// Parameters of the chunked span store.
///
/// The defaults are sized for mainnet: 4096 epochs of history for up to
/// 2^20 validators, split into 256 validator × 16 epoch chunks.
#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct SlasherConfig {
    /// Epochs of attesting history retained per validator.
    /// Must be a power of two and a multiple of `chunk_size`.
    #[derivative(Default(value = "4096"))]
    pub history_length: u64,
    /// Epochs per chunk.
    #[derivative(Default(value = "16"))]
    pub chunk_size: u64,
    /// Validators per chunk.
    #[derivative(Default(value = "256"))]
    pub validator_chunk_size: u64,
    /// Upper bound on validator indices the store is sized for.
    #[derivative(Default(value = "1 << 20"))]
    pub max_validators: u64,
    /// Capacity of the writer's chunk cache, in chunks.
    #[derivative(Default(value = "65_536"))]
    pub chunk_cache_capacity: usize,
    /// Buffered attestation count that triggers a mid-epoch batch.
    #[derivative(Default(value = "16_384"))]
    pub batch_threshold: usize,
    /// How far past the current epoch an attestation target may point
    /// before it is rejected outright instead of deferred.
    #[derivative(Default(value = "1"))]
    pub future_epoch_tolerance: u64,
    #[derivative(Default(value = "4"))]
    pub max_flush_attempts: u32,
    #[derivative(Default(value = "Duration::from_millis(100)"))]
    pub flush_retry_delay: Duration,
}

impl SlasherConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.history_length.is_power_of_two(),
            "history length must be a power of two",
        );

        ensure!(
            self.chunk_size > 0 && self.history_length % self.chunk_size == 0,
            "chunk size must divide history length",
        );

        ensure!(
            self.validator_chunk_size > 0,
            "validator chunk size must be nonzero",
        );

        // Span cells hold `target - epoch` distances in a u16 and reserve
        // `u16::MAX` as the min-span identity.
        ensure!(
            self.history_length + self.future_epoch_tolerance < u64::from(u16::MAX),
            "span distances must fit in a cell",
        );

        ensure!(
            u32::try_from(self.validator_chunk_count()).is_ok()
                && u32::try_from(self.epoch_chunk_count()).is_ok(),
            "chunk coordinates must fit in 32 bits",
        );

        ensure!(
            self.chunk_cache_capacity > 0,
            "chunk cache capacity must be nonzero",
        );

        Ok(())
    }

    /// Number of epoch-chunk slots in the circular window.
    #[must_use]
    pub const fn epoch_chunk_count(&self) -> u64 {
        self.history_length / self.chunk_size
    }

    #[must_use]
    pub const fn validator_chunk_count(&self) -> u64 {
        self.max_validators.div_ceil(self.validator_chunk_size)
    }

    #[must_use]
    pub const fn validator_chunk_index(&self, validator_index: ValidatorIndex) -> u64 {
        validator_index / self.validator_chunk_size
    }

    /// The circular slot holding `epoch`. Distinct epochs alias the same slot
    /// whenever they are a multiple of `history_length` apart.
    #[must_use]
    pub const fn epoch_chunk_index(&self, epoch: Epoch) -> u64 {
        (epoch / self.chunk_size) % self.epoch_chunk_count()
    }

    #[must_use]
    pub const fn chunk_first_epoch(&self, epoch: Epoch) -> Epoch {
        epoch - epoch % self.chunk_size
    }

    #[must_use]
    pub const fn chunk_last_epoch(&self, epoch: Epoch) -> Epoch {
        self.chunk_first_epoch(epoch) + self.chunk_size - 1
    }

    /// Oldest epoch whose span cells may still be written at `current_epoch`.
    ///
    /// Slots are reclaimed a whole chunk at a time: once the chunk holding
    /// `current_epoch - history_length` is wiped for its next generation,
    /// every epoch of that chunk is out of reach, including the few still
    /// nominally inside the window.
    #[must_use]
    pub const fn lowest_tracked_epoch(&self, current_epoch: Epoch) -> Epoch {
        if current_epoch < self.history_length {
            return 0;
        }

        self.chunk_first_epoch(current_epoch - self.history_length) + self.chunk_size
    }

    #[must_use]
    pub fn chunk_cells(&self) -> usize {
        usize::try_from(self.validator_chunk_size * self.chunk_size)
            .expect("validated chunk dimensions fit in usize")
    }

    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_cells() * CELL_BYTES
    }
}

/// Small parameters used throughout the crate's tests so chunk boundary
/// behavior is exercised without megabyte-sized fixtures.
#[cfg(test)]
pub fn test_config() -> SlasherConfig {
    SlasherConfig {
        history_length: 64,
        chunk_size: 4,
        validator_chunk_size: 4,
        max_validators: 64,
        chunk_cache_capacity: 32,
        ..SlasherConfig::default()
    }
}
