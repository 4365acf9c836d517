use anyhow::Result;

use crate::{
    cache::ChunkCache,
    chunks::SpanKind,
    config::SlasherConfig,
    primitives::{Attestation, Epoch},
    spans::{ChunkKey, SpanStore},
};

/// Rewrites min-span and max-span cells for committed attestations.
///
/// Both walks move one chunk at a time through the cache, so a batch sorted
/// by validator keeps each chunk resident exactly once. `min` and `max` are
/// idempotent and commutative, which makes replaying a batch after a failed
/// flush safe.
pub struct SpanUpdater {
    config: SlasherConfig,
    cache: ChunkCache,
}

impl SpanUpdater {
    #[must_use]
    pub fn new(config: SlasherConfig) -> Self {
        Self {
            config,
            cache: ChunkCache::new(config),
        }
    }

    pub fn cache_mut(&mut self) -> &mut ChunkCache {
        &mut self.cache
    }

    pub fn apply(
        &mut self,
        store: &SpanStore,
        attestation: &Attestation,
        current_epoch: Epoch,
    ) -> Result<()> {
        self.update_min_spans(store, attestation, current_epoch)?;
        self.update_max_spans(store, attestation, current_epoch)?;
        Ok(())
    }

    /// Lowers `min[v, e]` for every epoch before the source, so a later
    /// attestation reaching over this one's source is caught at its own
    /// source cell. Walks downward from `source - 1` and stops early as soon
    /// as a cell already holds a tighter span.
    fn update_min_spans(
        &mut self,
        store: &SpanStore,
        attestation: &Attestation,
        current_epoch: Epoch,
    ) -> Result<()> {
        let lowest_epoch = self.config.lowest_tracked_epoch(current_epoch);

        let Some(start_epoch) = attestation.source.checked_sub(1) else {
            return Ok(());
        };

        if start_epoch < lowest_epoch {
            return Ok(());
        }

        self.walk(
            store,
            SpanKind::Min,
            attestation,
            start_epoch,
            lowest_epoch,
        )
    }

    /// Raises `max[v, e]` for every epoch strictly inside the attestation's
    /// span, so a later attestation nested inside it is caught. Walks upward
    /// from `source + 1`; epochs at or past the target would get a candidate
    /// of zero, the max identity, so the walk ends at `target - 1`.
    fn update_max_spans(
        &mut self,
        store: &SpanStore,
        attestation: &Attestation,
        current_epoch: Epoch,
    ) -> Result<()> {
        // An old source may point below the window; start inside it.
        let start_epoch = (attestation.source + 1)
            .max(self.config.lowest_tracked_epoch(current_epoch));

        let Some(highest_epoch) = attestation.target.checked_sub(1) else {
            return Ok(());
        };

        if start_epoch > highest_epoch {
            return Ok(());
        }

        self.walk(
            store,
            SpanKind::Max,
            attestation,
            start_epoch,
            highest_epoch,
        )
    }

    fn walk(
        &mut self,
        store: &SpanStore,
        kind: SpanKind,
        attestation: &Attestation,
        start_epoch: Epoch,
        limit_epoch: Epoch,
    ) -> Result<()> {
        let mut epoch = start_epoch;

        loop {
            let key = ChunkKey::new(&self.config, kind, attestation.validator_index, epoch)?;
            let chunk = self.cache.get_mut(store, key)?;

            let outcome = chunk.update(
                &self.config,
                attestation.validator_index,
                epoch,
                limit_epoch,
                attestation.target,
            )?;

            if outcome.changed {
                self.cache.mark_dirty(key);
            }

            match outcome.next_epoch {
                Some(next_epoch) => epoch = next_epoch,
                None => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use database::Database;

    use crate::{
        cache::SpanReader as _,
        chunks::{MAX_SPAN_IDENTITY, MIN_SPAN_IDENTITY},
        config::test_config,
        primitives::{H256, ValidatorIndex},
    };

    use super::*;

    fn attestation(validator_index: ValidatorIndex, source: Epoch, target: Epoch) -> Attestation {
        Attestation {
            validator_index,
            source,
            target,
            signing_root: H256::zero(),
        }
    }

    fn build_updater() -> (SpanUpdater, SpanStore) {
        let config = test_config();
        let store = SpanStore::new(config, Arc::new(Database::in_memory()));
        (SpanUpdater::new(config), store)
    }

    /// Brute-force reduction over `history`, the definition the chunked walks
    /// must agree with.
    fn expected_spans(history: &[Attestation], epoch: Epoch) -> (u16, u16) {
        let min = history
            .iter()
            .filter(|attestation| attestation.source > epoch)
            .map(|attestation| attestation.target - epoch)
            .min()
            .map_or(MIN_SPAN_IDENTITY, |distance| {
                u16::try_from(distance).expect("test distances fit in a cell")
            });

        let max = history
            .iter()
            .filter(|attestation| attestation.source < epoch && attestation.target > epoch)
            .map(|attestation| attestation.target - epoch)
            .max()
            .map_or(MAX_SPAN_IDENTITY, |distance| {
                u16::try_from(distance).expect("test distances fit in a cell")
            });

        (min, max)
    }

    fn assert_spans_match(
        updater: &mut SpanUpdater,
        store: &SpanStore,
        history: &[Attestation],
        current_epoch: Epoch,
    ) -> Result<()> {
        let config = updater.config;

        for epoch in config.lowest_tracked_epoch(current_epoch)..=current_epoch {
            let (expected_min, expected_max) = expected_spans(history, epoch);

            let actual_min = updater
                .cache_mut()
                .span_at(store, SpanKind::Min, 1, epoch)?;
            let actual_max = updater
                .cache_mut()
                .span_at(store, SpanKind::Max, 1, epoch)?;

            assert_eq!(actual_min, expected_min, "min span mismatch at {epoch}");
            assert_eq!(actual_max, expected_max, "max span mismatch at {epoch}");
        }

        Ok(())
    }

    #[test]
    fn spans_match_the_brute_force_reduction() -> Result<()> {
        let (mut updater, store) = build_updater();
        let current_epoch = 40;

        let history = [
            attestation(1, 10, 12),
            attestation(1, 13, 14),
            attestation(1, 15, 20),
            attestation(1, 22, 23),
            attestation(1, 24, 30),
            attestation(1, 31, 32),
        ];

        for recorded in &history {
            updater.apply(&store, recorded, current_epoch)?;
        }

        assert_spans_match(&mut updater, &store, &history, current_epoch)
    }

    #[test]
    fn applying_a_batch_twice_changes_nothing() -> Result<()> {
        let (mut updater, store) = build_updater();
        let current_epoch = 40;

        let history = [
            attestation(1, 10, 12),
            attestation(1, 15, 20),
            attestation(1, 22, 23),
        ];

        for recorded in &history {
            updater.apply(&store, recorded, current_epoch)?;
        }

        store.write_batch(updater.cache_mut().flush_pairs()?)?;
        updater.cache_mut().commit_flush();
        let keys_after_first = store.chunk_keys()?;

        for recorded in &history {
            updater.apply(&store, recorded, current_epoch)?;
        }

        // Nothing was improved, so nothing is dirty.
        assert_eq!(updater.cache_mut().dirty_chunk_count(), 0);
        assert_eq!(store.chunk_keys()?, keys_after_first);
        assert_spans_match(&mut updater, &store, &history, current_epoch)
    }

    #[test]
    fn application_order_does_not_matter() -> Result<()> {
        let current_epoch = 40;

        let history = [
            attestation(1, 10, 12),
            attestation(1, 15, 20),
            attestation(1, 22, 23),
            attestation(1, 24, 30),
        ];

        let (mut forward, store_forward) = build_updater();
        for recorded in &history {
            forward.apply(&store_forward, recorded, current_epoch)?;
        }

        let (mut backward, store_backward) = build_updater();
        for recorded in history.iter().rev() {
            backward.apply(&store_backward, recorded, current_epoch)?;
        }

        let config = forward.config;

        for epoch in config.lowest_tracked_epoch(current_epoch)..=current_epoch {
            for kind in [SpanKind::Min, SpanKind::Max] {
                assert_eq!(
                    forward.cache_mut().span_at(&store_forward, kind, 1, epoch)?,
                    backward
                        .cache_mut()
                        .span_at(&store_backward, kind, 1, epoch)?,
                    "{kind:?} span mismatch at {epoch}",
                );
            }
        }

        Ok(())
    }

    #[test]
    fn min_walk_clamps_to_the_window() -> Result<()> {
        let (mut updater, store) = build_updater();

        // History length is 64; at epoch 100 the slot holding epoch 36 is
        // already reclaimed, so epoch 40 is the oldest writable one.
        let current_epoch = 100;
        updater.apply(&store, &attestation(1, 43, 44), current_epoch)?;

        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Min, 1, 40)?,
            4,
        );

        // Epoch 39's slot belongs to the next generation by now; its cell
        // (shared with epoch 103) must stay untouched.
        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Min, 1, 39)?,
            MIN_SPAN_IDENTITY,
        );

        Ok(())
    }

    #[test]
    fn max_walk_starts_inside_the_window() -> Result<()> {
        let (mut updater, store) = build_updater();

        // A late attestation whose source fell out of the window must not
        // write into reclaimed slots below epoch 40.
        let current_epoch = 100;
        updater.apply(&store, &attestation(1, 37, 42), current_epoch)?;

        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Max, 1, 39)?,
            MAX_SPAN_IDENTITY,
        );
        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Max, 1, 40)?,
            2,
        );
        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Max, 1, 41)?,
            1,
        );

        Ok(())
    }

    #[test]
    fn adjacent_epoch_attestation_writes_no_max_spans() -> Result<()> {
        let (mut updater, store) = build_updater();

        updater.apply(&store, &attestation(1, 5, 6), 10)?;

        for epoch in 0..=10 {
            assert_eq!(
                updater.cache_mut().span_at(&store, SpanKind::Max, 1, epoch)?,
                MAX_SPAN_IDENTITY,
            );
        }

        Ok(())
    }

    #[test]
    fn same_epoch_attestation_is_a_no_op_for_max_spans() -> Result<()> {
        let (mut updater, store) = build_updater();

        updater.apply(&store, &attestation(1, 5, 5), 10)?;

        // The min walk still ran, touching the two chunks below the source.
        assert_eq!(updater.cache_mut().dirty_chunk_count(), 2);
        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Max, 1, 5)?,
            MAX_SPAN_IDENTITY,
        );

        Ok(())
    }

    #[test]
    fn updates_stay_inside_the_validator_row() -> Result<()> {
        let (mut updater, store) = build_updater();

        // Validators 1 and 2 share a chunk row block.
        updater.apply(&store, &attestation(1, 10, 20), 30)?;

        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Max, 2, 15)?,
            MAX_SPAN_IDENTITY,
        );
        assert_eq!(
            updater.cache_mut().span_at(&store, SpanKind::Min, 2, 5)?,
            MIN_SPAN_IDENTITY,
        );

        Ok(())
    }
}
