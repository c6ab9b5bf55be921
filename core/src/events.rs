//! Typed domain events published after state changes commit.
//!
//! Delivery is fire-and-forget: `publish` never awaits and never fails the
//! operation that produced the event.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{ImportSessionId, LogEntryId, UserId};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    ImportFinalized {
        session: ImportSessionId,
        owner: UserId,
        log_entries: Vec<LogEntryId>,
    },
    #[serde(rename_all = "camelCase")]
    ImportCanceled {
        session: ImportSessionId,
        owner: UserId,
        removed_entries: u64,
    },
    #[serde(rename_all = "camelCase")]
    SamplesSaved { log_entry: LogEntryId, saved: u64 },
    #[serde(rename_all = "camelCase")]
    SamplesCleared { log_entry: LogEntryId, removed: u64 },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ImportFinalized { .. } => "importFinalized",
            DomainEvent::ImportCanceled { .. } => "importCanceled",
            DomainEvent::SamplesSaved { .. } => "samplesSaved",
            DomainEvent::SamplesCleared { .. } => "samplesCleared",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: DomainEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            debug!(event = name, "outbox receiver dropped; event discarded");
        }
    }
}
