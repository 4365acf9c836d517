use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::OnceCell;
use prometheus::{opts, Gauge, IntCounter, IntCounterVec, IntGauge};

use crate::status::SlashingKind;

/// Set by the embedding application when it wants metrics exported.
/// Left unset, all reporting is skipped.
pub static METRICS: OnceCell<Arc<Metrics>> = OnceCell::new();

#[derive(Debug)]
pub struct Metrics {
    batch_size: IntGauge,
    chunks_touched: IntGauge,
    cache_hit_rate: Gauge,
    bytes_written: IntCounter,
    lag_epochs: IntGauge,
    slashings_constructed: IntCounterVec,
    corrupt_chunks: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            batch_size: IntGauge::with_opts(opts!(
                "slasher_batch_size",
                "Number of attestations in the most recent processed batch",
            ))?,
            chunks_touched: IntGauge::with_opts(opts!(
                "slasher_chunks_touched",
                "Number of span chunks written by the most recent batch",
            ))?,
            cache_hit_rate: Gauge::with_opts(opts!(
                "slasher_cache_hit_rate",
                "Chunk cache hit rate over the most recent batch",
            ))?,
            bytes_written: IntCounter::with_opts(opts!(
                "slasher_bytes_written_total",
                "Compressed bytes handed to the chunk store",
            ))?,
            lag_epochs: IntGauge::with_opts(opts!(
                "slasher_lag_epochs",
                "Distance between the current epoch and the last flushed one",
            ))?,
            slashings_constructed: IntCounterVec::new(
                opts!(
                    "slasher_slashings_constructed_total",
                    "Slashing events constructed, by kind",
                ),
                &["kind"],
            )?,
            corrupt_chunks: IntCounter::with_opts(opts!(
                "slasher_corrupt_chunks_total",
                "Span chunks that failed to decode and were replaced with blanks",
            ))?,
        })
    }

    pub fn register_with_default_metrics(&self) -> Result<()> {
        let default_registry = prometheus::default_registry();

        default_registry.register(Box::new(self.batch_size.clone()))?;
        default_registry.register(Box::new(self.chunks_touched.clone()))?;
        default_registry.register(Box::new(self.cache_hit_rate.clone()))?;
        default_registry.register(Box::new(self.bytes_written.clone()))?;
        default_registry.register(Box::new(self.lag_epochs.clone()))?;
        default_registry.register(Box::new(self.slashings_constructed.clone()))?;
        default_registry.register(Box::new(self.corrupt_chunks.clone()))?;

        Ok(())
    }

    pub fn observe_batch(
        &self,
        batch_size: usize,
        chunks_touched: usize,
        cache_hits: u64,
        cache_misses: u64,
        bytes_written: usize,
        lag_epochs: u64,
    ) {
        self.batch_size.set(batch_size.try_into().unwrap_or(i64::MAX));
        self.chunks_touched
            .set(chunks_touched.try_into().unwrap_or(i64::MAX));
        self.bytes_written
            .inc_by(bytes_written.try_into().unwrap_or(u64::MAX));
        self.lag_epochs
            .set(lag_epochs.try_into().unwrap_or(i64::MAX));

        let accesses = cache_hits + cache_misses;

        if accesses > 0 {
            #[expect(clippy::cast_precision_loss)]
            self.cache_hit_rate
                .set(cache_hits as f64 / accesses as f64);
        }
    }

    pub fn inc_slashings(&self, kind: SlashingKind) {
        self.slashings_constructed
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_corrupt_chunks(&self) {
        self.corrupt_chunks.inc();
    }
}
