use std::{collections::BTreeSet, sync::Arc};

use anyhow::{Context as _, Result};
use database::Database;
use log::debug;

use crate::{
    chunks::SpanKind,
    config::SlasherConfig,
    error::Error,
    primitives::Epoch,
    records::RecordIndex,
    spans::{ChunkKey, CHUNK_KEY_PREFIX, META_KEY_PREFIX, RECORD_KEY_PREFIX},
};

/// What one pruning pass reclaimed. The driver uses `wiped_epoch_chunks` to
/// purge the corresponding cache entries.
#[derive(Default, Debug)]
pub struct PruneOutcome {
    pub wiped_epoch_chunks: Vec<u32>,
    pub pruned_record_count: usize,
    pub wiped_everything: bool,
}

/// Reclaims storage as epochs leave the retention window.
///
/// A missing chunk reads back as the kind's identity, so deleting a chunk's
/// key *is* the wipe. Slots are reclaimed at chunk granularity: epoch `e`
/// triggers a wipe only when it is chunk-aligned, at which point every epoch
/// of the previous generation in that slot has left the window.
pub struct Pruner {
    config: SlasherConfig,
    db: Arc<Database>,
}

impl Pruner {
    #[must_use]
    pub const fn new(config: SlasherConfig, db: Arc<Database>) -> Self {
        Self { config, db }
    }

    /// Prunes everything that left the window while advancing from
    /// `previous_epoch` to `new_epoch`. All deletions from one pass go
    /// through a single store write.
    pub fn prune(
        &self,
        records: &RecordIndex,
        previous_epoch: Epoch,
        new_epoch: Epoch,
    ) -> Result<PruneOutcome> {
        let history = self.config.history_length;
        let chunk_size = self.config.chunk_size;

        let Some(new_cutoff) = new_epoch.checked_sub(history) else {
            return Ok(PruneOutcome::default());
        };

        // An advance spanning the whole window leaves nothing live:
        // drop both prefixes wholesale.
        if new_epoch.saturating_sub(previous_epoch) >= history {
            debug!("advance past the full window, clearing all span history");

            self.db
                .delete_range([CHUNK_KEY_PREFIX].as_slice()..[RECORD_KEY_PREFIX].as_slice())
                .context(Error::StoreUnavailable)?;
            self.db
                .delete_range([RECORD_KEY_PREFIX].as_slice()..[META_KEY_PREFIX].as_slice())
                .context(Error::StoreUnavailable)?;

            let all_slots = (0..self.config.epoch_chunk_count())
                .map(|slot| u32::try_from(slot).expect("validated chunk coordinates fit in 32 bits"))
                .collect();

            return Ok(PruneOutcome {
                wiped_epoch_chunks: all_slots,
                pruned_record_count: 0,
                wiped_everything: true,
            });
        }

        let previous_cutoff = previous_epoch.checked_sub(history);

        // First chunk-aligned epoch not yet reclaimed by an earlier pass.
        let first_aligned = match previous_cutoff {
            Some(previous_cutoff) => (previous_cutoff / chunk_size + 1) * chunk_size,
            None => 0,
        };

        let mut slots = BTreeSet::new();
        let mut epoch = first_aligned;

        while epoch <= new_cutoff {
            slots.insert(
                u32::try_from(self.config.epoch_chunk_index(epoch))
                    .expect("validated chunk coordinates fit in 32 bits"),
            );

            epoch += chunk_size;
        }

        if slots.is_empty() {
            return Ok(PruneOutcome::default());
        }

        let mut keys = Vec::with_capacity(
            2 * slots.len()
                * usize::try_from(self.config.validator_chunk_count())
                    .expect("validated chunk dimensions fit in usize"),
        );

        for kind in [SpanKind::Min, SpanKind::Max] {
            for validator_chunk in 0..self.config.validator_chunk_count() {
                for epoch_chunk in &slots {
                    let key = ChunkKey {
                        kind,
                        validator_chunk: u32::try_from(validator_chunk)
                            .expect("validated chunk coordinates fit in 32 bits"),
                        epoch_chunk: *epoch_chunk,
                    };

                    keys.push(key.to_bytes().to_vec());
                }
            }
        }

        // Stale attestation records share the pass and the store write.
        let stale_record_keys = records.stale_record_keys(new_cutoff)?;
        let pruned_record_count = stale_record_keys.len();

        keys.extend(stale_record_keys.into_iter().map(|key| key.to_vec()));

        self.db.delete_batch(keys).context(Error::StoreUnavailable)?;

        debug!(
            "pruned span history (slots: {slots:?}, records: {pruned_record_count}, \
             cutoff: {new_cutoff})",
        );

        Ok(PruneOutcome {
            wiped_epoch_chunks: slots.into_iter().collect(),
            pruned_record_count,
            wiped_everything: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::test_config,
        primitives::{Attestation, H256},
        spans::SpanStore,
        updater::SpanUpdater,
    };

    use super::*;

    struct Fixture {
        store: SpanStore,
        records: RecordIndex,
        pruner: Pruner,
        updater: SpanUpdater,
    }

    fn build_fixture() -> Fixture {
        let config = test_config();
        let db = Arc::new(Database::in_memory());

        Fixture {
            store: SpanStore::new(config, Arc::clone(&db)),
            records: RecordIndex::new(Arc::clone(&db)),
            pruner: Pruner::new(config, db),
            updater: SpanUpdater::new(config),
        }
    }

    fn record(fixture: &mut Fixture, source: Epoch, target: Epoch, current_epoch: Epoch) -> Result<()> {
        let attestation = Attestation {
            validator_index: 1,
            source,
            target,
            signing_root: H256::zero(),
        };

        fixture
            .updater
            .apply(&fixture.store, &attestation, current_epoch)?;
        fixture.records.insert_pending(attestation);

        Ok(())
    }

    fn flush(fixture: &mut Fixture) -> Result<()> {
        let mut pairs = fixture.updater.cache_mut().flush_pairs()?;
        pairs.extend(fixture.records.flush_pairs());
        fixture.store.write_batch(pairs)?;
        fixture.updater.cache_mut().commit_flush();
        fixture.records.commit_flush();
        Ok(())
    }

    #[test]
    fn no_pruning_before_the_window_fills() -> Result<()> {
        let mut fixture = build_fixture();

        record(&mut fixture, 5, 6, 10)?;
        flush(&mut fixture)?;

        let outcome = fixture.pruner.prune(&fixture.records, 10, 20)?;

        assert!(outcome.wiped_epoch_chunks.is_empty());
        assert!(!fixture.store.chunk_keys()?.is_empty());

        Ok(())
    }

    #[test]
    fn rolled_out_slots_are_wiped() -> Result<()> {
        let mut fixture = build_fixture();

        // History length is 64. Epochs 0..=3 live in slot 0.
        record(&mut fixture, 1, 3, 10)?;
        flush(&mut fixture)?;

        let slot_zero_keys = fixture
            .store
            .chunk_keys()?
            .into_iter()
            .filter(|key| key.epoch_chunk == 0)
            .count();
        assert!(slot_zero_keys > 0);

        // Advancing to epoch 68 rolls epochs 0..=4 out of the window;
        // the chunk-aligned epochs 0 and 4 reclaim slots 0 and 1.
        let outcome = fixture.pruner.prune(&fixture.records, 10, 68)?;

        assert_eq!(outcome.wiped_epoch_chunks, vec![0, 1]);
        assert_eq!(outcome.pruned_record_count, 1);

        assert!(fixture
            .store
            .chunk_keys()?
            .iter()
            .all(|key| key.epoch_chunk > 1));
        assert_eq!(fixture.records.scan_targets(1, 0..100)?, vec![]);

        Ok(())
    }

    #[test]
    fn pruning_is_idempotent_across_restarts() -> Result<()> {
        let mut fixture = build_fixture();

        record(&mut fixture, 1, 3, 10)?;
        flush(&mut fixture)?;

        fixture.pruner.prune(&fixture.records, 10, 68)?;
        let keys_after_first = fixture.store.chunk_keys()?;

        // A crash before the recovery point advanced replays the same span.
        let outcome = fixture.pruner.prune(&fixture.records, 10, 68)?;

        assert_eq!(outcome.wiped_epoch_chunks, vec![0, 1]);
        assert_eq!(fixture.store.chunk_keys()?, keys_after_first);

        Ok(())
    }

    #[test]
    fn advancing_past_the_whole_window_empties_the_store() -> Result<()> {
        let mut fixture = build_fixture();

        fixture.store.verify_or_init_meta()?;
        record(&mut fixture, 30, 35, 40)?;
        record(&mut fixture, 36, 38, 40)?;
        flush(&mut fixture)?;

        let outcome = fixture.pruner.prune(&fixture.records, 40, 40 + 65)?;

        assert!(outcome.wiped_everything);
        assert_eq!(fixture.store.chunk_keys()?, vec![]);
        assert_eq!(fixture.records.scan_targets(1, 0..1000)?, vec![]);

        // The meta record survives a full wipe.
        assert!(fixture.store.load_meta()?.is_some());

        Ok(())
    }
}
