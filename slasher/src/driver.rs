use core::sync::atomic::{AtomicBool, Ordering};
use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context as _, Result};
use database::Database;
use log::{debug, info, warn};
use strum::AsRefStr;
use tokio::time::sleep;

use crate::{
    cache::ReadCache,
    config::SlasherConfig,
    detector::Detector,
    metrics::METRICS,
    primitives::{Attestation, Epoch, ValidatorIndex},
    pruner::Pruner,
    records::RecordIndex,
    spans::SpanStore,
    status::{SlashingEvent, SlashingKind},
    updater::SpanUpdater,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DriverState {
    Idle,
    Collecting,
    Processing,
    Flushing,
    Pruning,
}

impl DriverState {
    #[must_use]
    pub const fn is_accepting(self) -> bool {
        matches!(self, Self::Idle | Self::Collecting)
    }
}

/// The serialized writer that owns every mutable piece of the span history.
///
/// Batches move through `collecting → processing → flushing → pruning`.
/// Within a batch, attestations are handled in `(validator, source, target,
/// signing root)` order, each one checked against the history before its own
/// updates are applied, so a slashable pair arriving in one batch is still
/// caught and evidence selection is reproducible.
pub struct EpochDriver {
    config: SlasherConfig,
    store: SpanStore,
    records: RecordIndex,
    updater: SpanUpdater,
    detector: Detector,
    pruner: Pruner,
    state: DriverState,
    buffer: Vec<Attestation>,
    /// Attestations waiting for a later epoch, plus anything submitted while
    /// a batch was in flight.
    deferred: Vec<Attestation>,
    current_epoch: Epoch,
    last_flushed_epoch: Option<Epoch>,
    cancel: Arc<AtomicBool>,
}

impl EpochDriver {
    pub fn open(
        config: SlasherConfig,
        db: Arc<Database>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;

        let store = SpanStore::new(config, Arc::clone(&db));
        let highest_processed = store.verify_or_init_meta()?;

        if let Some(epoch) = highest_processed {
            info!("span history opened at recovery point (epoch: {epoch})");
        }

        Ok(Self {
            config,
            store,
            records: RecordIndex::new(Arc::clone(&db)),
            updater: SpanUpdater::new(config),
            detector: Detector::new(config),
            pruner: Pruner::new(config, db),
            state: DriverState::Idle,
            buffer: vec![],
            deferred: vec![],
            current_epoch: highest_processed.unwrap_or(0),
            last_flushed_epoch: highest_processed,
            cancel,
        })
    }

    #[must_use]
    pub const fn state(&self) -> DriverState {
        self.state
    }

    #[must_use]
    pub const fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    #[must_use]
    pub fn cache_generation(&mut self) -> u64 {
        self.updater.cache_mut().generation()
    }

    /// Buffers an attestation. Returns true when the batch threshold is
    /// reached and the caller should process.
    pub fn submit(&mut self, attestation: Attestation) -> bool {
        if attestation.source > attestation.target {
            debug!("ignoring malformed attestation (attestation: {attestation:?})");
            return false;
        }

        if let Err(error) = self
            .detector
            .validate_window(&attestation, self.current_epoch)
        {
            debug!("ignoring attestation: {error}");
            return false;
        }

        if attestation.target > self.current_epoch || !self.state.is_accepting() {
            self.deferred.push(attestation);
            return false;
        }

        self.buffer.push(attestation);
        self.set_state(DriverState::Collecting);

        self.buffer.len() >= self.config.batch_threshold
    }

    /// Runs the frozen buffer through detection and span updates, then
    /// flushes. On a store failure the driver returns to collecting with the
    /// buffer intact; replaying it later is safe because span updates and
    /// record inserts are idempotent.
    pub async fn process_batch(&mut self) -> Result<Vec<SlashingEvent>> {
        if self.buffer.is_empty() {
            return Ok(vec![]);
        }

        self.set_state(DriverState::Processing);

        match self.run_batch().await {
            Ok(events) => Ok(events),
            Err(error) => {
                self.set_state(DriverState::Collecting);
                Err(error)
            }
        }
    }

    /// Finishes the current epoch's batch, reclaims slots that rolled out of
    /// the window, and starts collecting for `new_epoch`.
    pub async fn advance_epoch(&mut self, new_epoch: Epoch) -> Result<Vec<SlashingEvent>> {
        if new_epoch <= self.current_epoch {
            if new_epoch < self.current_epoch {
                warn!(
                    "ignoring non-monotonic epoch advance (current: {}, new: {new_epoch})",
                    self.current_epoch,
                );
            }

            return Ok(vec![]);
        }

        let mut events = self.process_batch().await?;

        self.set_state(DriverState::Pruning);

        let outcome = match self.pruner.prune(&self.records, self.current_epoch, new_epoch) {
            Ok(outcome) => outcome,
            Err(error) => {
                // Pruning is idempotent; the next advance retries it.
                self.set_state(DriverState::Idle);
                return Err(error).context("pruning failed");
            }
        };

        if outcome.wiped_everything {
            self.updater.cache_mut().clear();
        } else {
            for epoch_chunk in outcome.wiped_epoch_chunks {
                self.updater.cache_mut().purge_epoch_slot(epoch_chunk);
            }
        }

        self.current_epoch = new_epoch;
        self.drain_deferred();

        let state = if self.buffer.is_empty() {
            DriverState::Idle
        } else {
            DriverState::Collecting
        };
        self.set_state(state);

        if self.buffer.len() >= self.config.batch_threshold {
            events.extend(self.process_batch().await?);
        }

        Ok(events)
    }

    /// Read-only classification for queries running between batches.
    pub fn query(
        &self,
        read_cache: &mut ReadCache,
        attestation: &Attestation,
    ) -> Result<Option<SlashingEvent>> {
        if self
            .detector
            .validate_window(attestation, self.current_epoch)
            .is_err()
        {
            return Ok(None);
        }

        self.detector
            .find_slashing(read_cache, &self.store, &self.records, attestation)
    }

    /// Drops the in-flight batch and reverts all uncommitted state.
    pub fn abort_batch(&mut self) {
        self.updater.cache_mut().discard();
        self.records.discard();
        self.buffer.clear();
        self.set_state(DriverState::Idle);
    }

    async fn run_batch(&mut self) -> Result<Vec<SlashingEvent>> {
        self.buffer.sort_unstable();
        self.buffer.dedup();

        let batch_size = self.buffer.len();
        let mut events = vec![];
        let mut skip = vec![false; batch_size];

        // Late or malformed entries can reach the buffer through an epoch
        // advance; re-check the window before anything else sees them.
        for (index, attestation) in self.buffer.iter().enumerate() {
            if let Err(error) = self
                .detector
                .validate_window(attestation, self.current_epoch)
            {
                debug!("dropping buffered attestation: {error}");
                skip[index] = true;
            }
        }

        self.find_batch_double_votes(&mut skip, &mut events);

        for index in 0..batch_size {
            if skip[index] {
                continue;
            }

            if self.cancel.load(Ordering::Relaxed) {
                warn!(
                    "batch processing cancelled, discarding {} attestations",
                    batch_size - index,
                );

                self.abort_batch();
                return Ok(events);
            }

            let attestation = self.buffer[index];

            let slashing = self.detector.find_slashing(
                self.updater.cache_mut(),
                &self.store,
                &self.records,
                &attestation,
            )?;

            match slashing {
                Some(event) => {
                    info!("attester slashing constructed: {event:?}");
                    events.push(event);
                }
                None => {
                    self.updater
                        .apply(&self.store, &attestation, self.current_epoch)?;
                    self.records.insert_pending(attestation);
                }
            }
        }

        self.set_state(DriverState::Flushing);

        let (chunks_flushed, bytes_written) = self.flush().await?;

        if let Some(metrics) = METRICS.get() {
            let (hits, misses) = self.updater.cache_mut().take_access_counts();
            let lag = self
                .last_flushed_epoch
                .map_or(0, |epoch| self.current_epoch.saturating_sub(epoch));

            metrics.observe_batch(batch_size, chunks_flushed, hits, misses, bytes_written, lag);

            for event in &events {
                metrics.inc_slashings(event.kind);
            }
        }

        self.last_flushed_epoch = Some(self.current_epoch);
        self.buffer.clear();
        self.set_state(DriverState::Idle);

        Ok(events)
    }

    /// Same-target, different-root pairs inside one batch. Every ordered pair
    /// is evidence; none of the participants is committed to the history.
    fn find_batch_double_votes(&self, skip: &mut [bool], events: &mut Vec<SlashingEvent>) {
        let mut groups: BTreeMap<(ValidatorIndex, Epoch), Vec<usize>> = BTreeMap::new();

        for (index, attestation) in self.buffer.iter().enumerate() {
            if !skip[index] {
                groups
                    .entry((attestation.validator_index, attestation.target))
                    .or_default()
                    .push(index);
            }
        }

        for ((validator_index, _), indices) in groups {
            if indices.len() < 2 {
                continue;
            }

            for (position, &first_index) in indices.iter().enumerate() {
                for &second_index in &indices[position + 1..] {
                    let first = self.buffer[first_index];
                    let second = self.buffer[second_index];

                    if first.signing_root == second.signing_root {
                        continue;
                    }

                    let event = SlashingEvent {
                        kind: SlashingKind::DoubleVote,
                        validator_index,
                        attestation_a: first,
                        attestation_b: second,
                    };

                    info!("attester slashing constructed: {event:?}");
                    events.push(event);
                    skip[first_index] = true;
                    skip[second_index] = true;
                }
            }
        }
    }

    /// Commits dirty chunks, pending records and the recovery point in one
    /// atomic store batch, retrying transient failures with a doubling delay.
    async fn flush(&mut self) -> Result<(usize, usize)> {
        let mut delay = self.config.flush_retry_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.try_flush() {
                Ok(stats) => return Ok(stats),
                Err(error) if attempt < self.config.max_flush_attempts => {
                    warn!(
                        "flushing the span history failed, retrying in {delay:?} \
                         (attempt: {attempt}, error: {error:#})",
                    );

                    sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(error) => {
                    return Err(error).context("flushing the span history failed; batch preserved")
                }
            }
        }
    }

    fn try_flush(&mut self) -> Result<(usize, usize)> {
        let mut pairs = self.updater.cache_mut().flush_pairs()?;
        let chunk_count = pairs.len();

        pairs.extend(self.records.flush_pairs());
        pairs.push(self.store.meta_pair(Some(self.current_epoch))?);

        let bytes = pairs.iter().map(|(_, value)| value.len()).sum();

        self.store.write_batch(pairs)?;

        self.updater.cache_mut().commit_flush();
        self.records.commit_flush();

        Ok((chunk_count, bytes))
    }

    fn drain_deferred(&mut self) {
        let current_epoch = self.current_epoch;

        let (ready, waiting): (Vec<_>, Vec<_>) = core::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|attestation| attestation.target <= current_epoch);

        self.buffer.extend(ready);
        self.deferred = waiting;
    }

    fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            debug!("slasher driver state: {}", state.as_ref());
            self.state = state;
        }
    }
}
