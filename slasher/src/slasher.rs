use core::{
    convert::Infallible as Never,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, Ordering},
};
use std::sync::Arc;

use anyhow::Result;
use database::Database;
use futures::{
    channel::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    select,
    stream::StreamExt as _,
};
use log::{debug, warn};

use crate::{
    cache::ReadCache,
    config::SlasherConfig,
    driver::EpochDriver,
    error,
    messages::{IngestToSlasher, SlasherToBroadcast},
    primitives::Attestation,
    status::SlashingEvent,
};

const READ_CACHE_CAPACITY: usize = 1024;

/// The slashing detection service: a single task owning the epoch driver,
/// fed attestations and epoch ticks over a channel, publishing constructed
/// slashings to another.
pub struct Slasher {
    driver: EpochDriver,
    read_cache: ReadCache,
    queued_queries: Vec<(Attestation, oneshot::Sender<Option<SlashingEvent>>)>,
    slasher_to_broadcast_tx: UnboundedSender<SlasherToBroadcast>,
    ingest_to_slasher_rx: UnboundedReceiver<IngestToSlasher>,
    cancel: Arc<AtomicBool>,
}

impl Slasher {
    pub fn new(
        config: SlasherConfig,
        database: Database,
        slasher_to_broadcast_tx: UnboundedSender<SlasherToBroadcast>,
        ingest_to_slasher_rx: UnboundedReceiver<IngestToSlasher>,
    ) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let driver = EpochDriver::open(config, Arc::new(database), Arc::clone(&cancel))?;

        let read_cache_capacity = NonZeroUsize::new(READ_CACHE_CAPACITY)
            .expect("read cache capacity constant is nonzero");

        Ok(Self {
            driver,
            read_cache: ReadCache::new(config, read_cache_capacity),
            queued_queries: vec![],
            slasher_to_broadcast_tx,
            ingest_to_slasher_rx,
            cancel,
        })
    }

    /// Requests rollback of the batch being processed. Safe to call from any
    /// task; the driver honors it between attestations and never mid-commit.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub async fn run(mut self) -> Result<Never> {
        loop {
            select! {
                message = self.ingest_to_slasher_rx.select_next_some() => {
                    match message {
                        IngestToSlasher::Attestation(attestation) => {
                            debug!(
                                "processing attestation record (validator: {}, source: {}, \
                                 target: {})",
                                attestation.validator_index,
                                attestation.source,
                                attestation.target,
                            );

                            if self.driver.submit(attestation) {
                                let result = self.driver.process_batch().await;
                                self.publish(result)?;
                            }
                        }
                        IngestToSlasher::Epoch(epoch) => {
                            let result = self.driver.advance_epoch(epoch).await;
                            self.publish(result)?;
                        }
                        IngestToSlasher::Query { attestation, reply } => {
                            if self.driver.state().is_accepting() {
                                self.answer_query(attestation, reply);
                            } else {
                                self.queued_queries.push((attestation, reply));
                            }
                        }
                    }

                    self.flush_queued_queries();
                },
            }
        }
    }

    /// Sends constructed slashings onward. Batch failures are retried by the
    /// driver on the next trigger, so they are only logged here, unless they
    /// are fatal.
    fn publish(&mut self, result: Result<Vec<SlashingEvent>>) -> Result<()> {
        match result {
            Ok(events) => {
                for event in events {
                    SlasherToBroadcast::AttesterSlashing(event)
                        .send(&self.slasher_to_broadcast_tx);
                }

                Ok(())
            }
            Err(error) if error::is_fatal(&error) => Err(error),
            Err(error) => {
                warn!("attestation batch processing failed: {error:#}");
                Ok(())
            }
        }
    }

    fn answer_query(
        &mut self,
        attestation: Attestation,
        reply: oneshot::Sender<Option<SlashingEvent>>,
    ) {
        self.read_cache.sync_generation(self.driver.cache_generation());

        let answer = match self.driver.query(&mut self.read_cache, &attestation) {
            Ok(answer) => answer,
            Err(error) => {
                warn!("slashing query failed (attestation: {attestation:?}, error: {error:#})");
                None
            }
        };

        if reply.send(answer).is_err() {
            debug!("slashing query reply dropped by the caller");
        }
    }

    fn flush_queued_queries(&mut self) {
        if !self.driver.state().is_accepting() {
            return;
        }

        for (attestation, reply) in core::mem::take(&mut self.queued_queries) {
            self.answer_query(attestation, reply);
        }
    }
}
