use anyhow::{bail, Result};
use log::debug;

use crate::{
    cache::SpanReader,
    chunks::{SpanKind, MIN_SPAN_IDENTITY},
    config::SlasherConfig,
    error::Error,
    primitives::{Attestation, Epoch},
    records::RecordIndex,
    spans::SpanStore,
    status::{SlashingEvent, SlashingKind},
};

/// Classifies incoming attestations against the recorded history.
///
/// The span arrays answer "is there a conflicting attestation" in O(1);
/// the record index is then consulted to produce the concrete pair. A
/// slashing is only emitted once the partner record has been checked against
/// the actual surround predicate, so a stale or aliased span cell can at
/// worst cost a detection, never fabricate one.
pub struct Detector {
    config: SlasherConfig,
}

impl Detector {
    #[must_use]
    pub const fn new(config: SlasherConfig) -> Self {
        Self { config }
    }

    /// Rejects attestations outside the retained window. Old targets have no
    /// live span slots left; far-future targets are nonsense input.
    pub fn validate_window(&self, attestation: &Attestation, current_epoch: Epoch) -> Result<()> {
        let target = attestation.target;

        let too_old = current_epoch.saturating_sub(target) >= self.config.history_length;
        let too_new = target > current_epoch + self.config.future_epoch_tolerance;

        if too_old || too_new {
            bail!(Error::OutOfWindow {
                target,
                current_epoch,
            });
        }

        Ok(())
    }

    pub fn find_slashing(
        &self,
        spans: &mut impl SpanReader,
        store: &SpanStore,
        records: &RecordIndex,
        attestation: &Attestation,
    ) -> Result<Option<SlashingEvent>> {
        if let Some(event) = self.check_double_vote(records, attestation)? {
            return Ok(Some(event));
        }

        if let Some(event) = self.check_surrounding(spans, store, records, attestation)? {
            return Ok(Some(event));
        }

        if let Some(event) = self.check_surrounded(spans, store, records, attestation)? {
            return Ok(Some(event));
        }

        Ok(None)
    }

    fn check_double_vote(
        &self,
        records: &RecordIndex,
        attestation: &Attestation,
    ) -> Result<Option<SlashingEvent>> {
        let Some(existing) = records.find(attestation.validator_index, attestation.target)? else {
            return Ok(None);
        };

        if existing.signing_root == attestation.signing_root {
            return Ok(None);
        }

        Ok(Some(SlashingEvent {
            kind: SlashingKind::DoubleVote,
            validator_index: attestation.validator_index,
            attestation_a: existing,
            attestation_b: *attestation,
        }))
    }

    /// Does the incoming attestation surround a recorded one? The min span at
    /// its source holds the distance to the nearest-targeted attestation with
    /// a later source; a strictly larger incoming distance covers it.
    fn check_surrounding(
        &self,
        spans: &mut impl SpanReader,
        store: &SpanStore,
        records: &RecordIndex,
        attestation: &Attestation,
    ) -> Result<Option<SlashingEvent>> {
        let span = spans.span_at(
            store,
            SpanKind::Min,
            attestation.validator_index,
            attestation.source,
        )?;

        if span == MIN_SPAN_IDENTITY {
            return Ok(None);
        }

        let distance = attestation.target.saturating_sub(attestation.source);

        if u64::from(span) >= distance {
            return Ok(None);
        }

        let pinned_target = attestation.source + u64::from(span);

        self.reconstruct(
            records,
            attestation,
            SlashingKind::Surrounding,
            pinned_target,
            attestation.source + 1..attestation.target,
        )
    }

    /// Is the incoming attestation surrounded by a recorded one? Symmetric to
    /// [`Self::check_surrounding`] over the max span.
    fn check_surrounded(
        &self,
        spans: &mut impl SpanReader,
        store: &SpanStore,
        records: &RecordIndex,
        attestation: &Attestation,
    ) -> Result<Option<SlashingEvent>> {
        let span = spans.span_at(
            store,
            SpanKind::Max,
            attestation.validator_index,
            attestation.source,
        )?;

        let distance = attestation.target.saturating_sub(attestation.source);

        if u64::from(span) <= distance {
            return Ok(None);
        }

        let pinned_target = attestation.source + u64::from(span);

        self.reconstruct(
            records,
            attestation,
            SlashingKind::Surrounded,
            pinned_target,
            attestation.target + 1..Epoch::MAX,
        )
    }

    /// Recovers the partner attestation behind a firing span cell: first the
    /// record at the exact target the span pins down, then a range scan. The
    /// surround predicate is re-checked on every candidate.
    fn reconstruct(
        &self,
        records: &RecordIndex,
        attestation: &Attestation,
        kind: SlashingKind,
        pinned_target: Epoch,
        scan_targets: core::ops::Range<Epoch>,
    ) -> Result<Option<SlashingEvent>> {
        let is_partner = |existing: &Attestation| match kind {
            SlashingKind::Surrounding => attestation.surrounds(existing),
            SlashingKind::Surrounded => existing.surrounds(attestation),
            SlashingKind::DoubleVote => false,
        };

        if let Some(existing) = records.find(attestation.validator_index, pinned_target)? {
            if is_partner(&existing) {
                return Ok(Some(SlashingEvent {
                    kind,
                    validator_index: attestation.validator_index,
                    attestation_a: existing,
                    attestation_b: *attestation,
                }));
            }
        }

        for existing in records.scan_targets(attestation.validator_index, scan_targets)? {
            if is_partner(&existing) {
                return Ok(Some(SlashingEvent {
                    kind,
                    validator_index: attestation.validator_index,
                    attestation_a: existing,
                    attestation_b: *attestation,
                }));
            }
        }

        debug!(
            "span cell indicated a {kind:?} but no partner record was found \
             (attestation: {attestation:?}, pinned target: {pinned_target})",
        );

        Ok(None)
    }
}
