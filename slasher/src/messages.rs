use futures::channel::{mpsc::UnboundedSender, oneshot};
use log::warn;

use crate::{
    primitives::{Attestation, Epoch},
    status::SlashingEvent,
};

pub enum IngestToSlasher {
    /// A validated, per-validator attestation record.
    Attestation(Attestation),
    /// The chain advanced. Must be monotonic; a gap triggers pruning
    /// catch-up for every skipped epoch.
    Epoch(Epoch),
    /// Read-only classification of an attestation without committing it.
    /// Served between batches; queued while a batch is in flight.
    Query {
        attestation: Attestation,
        reply: oneshot::Sender<Option<SlashingEvent>>,
    },
}

impl IngestToSlasher {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to slasher failed because the receiver was dropped");
        }
    }
}

pub enum SlasherToBroadcast {
    AttesterSlashing(SlashingEvent),
}

impl SlasherToBroadcast {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to broadcaster failed because the receiver was dropped");
        }
    }
}
