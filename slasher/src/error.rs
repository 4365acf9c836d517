use thiserror::Error;

use crate::primitives::Epoch;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stored bytes failed to decode (expected {expected} bytes, found {found})")]
    Corruption { expected: usize, found: usize },
    #[error("store operation failed and may succeed if retried")]
    StoreUnavailable,
    #[error("persisted parameters ({found}) disagree with configured parameters ({expected})")]
    SchemaMismatch { expected: String, found: String },
    #[error("attestation target {target} is outside the window retained at epoch {current_epoch}")]
    OutOfWindow {
        target: Epoch,
        current_epoch: Epoch,
    },
    #[error("internal invariant violated: {0}")]
    InternalInvariantViolated(&'static str),
}

impl Error {
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. } | Self::InternalInvariantViolated(_),
        )
    }
}

// `anyhow::Error::downcast_ref` sees through `context` layers,
// unlike downcasting the elements of `anyhow::Error::chain`.

/// Whether the error is one the process cannot recover from.
#[must_use]
pub fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Error>()
        .is_some_and(Error::is_fatal)
}

/// Whether the error is a contained chunk or record corruption.
#[must_use]
pub fn is_corruption(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Error>()
        .is_some_and(Error::is_corruption)
}
