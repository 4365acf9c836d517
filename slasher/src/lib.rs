//! Attester-slashing detection over min/max span chunks.
//!
//! Each validator's attesting history is reduced into two per-epoch arrays:
//! the min span (smallest `target - epoch` over votes with a later source)
//! and the max span (largest such distance over votes with an earlier
//! source). An incoming vote then needs exactly two cell reads to know
//! whether it surrounds or is surrounded by anything on record. The arrays
//! are stored as snappy-compressed 256-validator × 16-epoch chunks in a
//! circular window of 4096 epochs, following the layout introduced by the
//! min-max-surround design: <https://hackmd.io/@sproul/min-max-slasher>.

pub use crate::{
    cache::ReadCache,
    config::SlasherConfig,
    driver::{DriverState, EpochDriver},
    error::Error,
    messages::{IngestToSlasher, SlasherToBroadcast},
    metrics::{Metrics, METRICS},
    primitives::{Attestation, Epoch, ValidatorIndex, H256},
    slasher::Slasher,
    status::{SlashingEvent, SlashingKind},
};

mod cache;
mod chunks;
mod config;
mod detector;
mod driver;
mod error;
mod messages;
mod metrics;
mod primitives;
mod pruner;
mod records;
mod slasher;
mod spans;
mod status;
mod updater;
