//! Import session lifecycle: create, add records, finalize or cancel.
//!
//! ```text
//! Open ──add_records──▶ Open
//! Open ──finalize─────▶ Finalized   (terminal)
//! Open ──cancel───────▶ Canceled    (terminal, row deleted)
//! ```
//!
//! Both terminal transitions are guarded by conditional statements in storage,
//! so of two concurrent finalize/cancel calls at most one succeeds.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use super::json::JsonRecordImporter;
use super::RecordImporter;
use crate::config::PipelineConfig;
use crate::error::{LogbookError, Result};
use crate::events::{DomainEvent, Outbox};
use crate::models::{ImportSession, ImportSessionId, ImportSessionMetadata, LogEntry, UserId};
use crate::storage::{AppendOutcome, LogEntryRepository, SessionRepository};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Give records without a log number the next free number for the owner,
    /// in arrival order.
    pub assign_log_numbers: bool,
}

pub struct ImportSessionManager<S> {
    store: Arc<S>,
    config: PipelineConfig,
    outbox: Option<Outbox>,
}

impl<S> ImportSessionManager<S> {
    pub fn new(store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(outbox) = &self.outbox {
            outbox.publish(event);
        }
    }
}

impl<S> ImportSessionManager<S>
where
    S: SessionRepository + LogEntryRepository,
{
    #[instrument(skip(self, owner, metadata), fields(owner = %owner))]
    pub async fn create(
        &self,
        owner: &UserId,
        metadata: ImportSessionMetadata,
    ) -> Result<ImportSession> {
        let session = ImportSession::new(owner.clone(), metadata);
        self.store.insert_session(&session).await?;
        info!(session = %session.id, "import session created");
        Ok(session)
    }

    pub async fn get(&self, owner: &UserId, id: &ImportSessionId) -> Result<ImportSession> {
        self.store
            .get_session(owner, id)
            .await?
            .ok_or_else(|| LogbookError::not_found("import session", id))
    }

    /// Appends records after those already buffered, keeping their order.
    #[instrument(
        skip(self, session, records),
        fields(session = %session.id, records = records.len())
    )]
    pub async fn add_records(&self, session: &ImportSession, records: &[String]) -> Result<()> {
        if records.is_empty() {
            return Err(LogbookError::validation(
                None,
                "records",
                "at least one record is required",
            ));
        }
        if session.canceled {
            return Err(LogbookError::InvalidState(format!(
                "import session {} was canceled",
                session.id
            )));
        }
        if session.is_finalized() {
            return Err(LogbookError::InvalidState(format!(
                "import session {} is already finalized",
                session.id
            )));
        }

        match self.store.append_records(&session.id, records).await? {
            AppendOutcome::Appended(count) => {
                debug!(appended = count, "records buffered");
                Ok(())
            }
            AppendOutcome::Closed => Err(LogbookError::InvalidState(format!(
                "import session {} is already finalized",
                session.id
            ))),
            // The caller held a live session, so a missing row means it was canceled.
            AppendOutcome::Missing => Err(LogbookError::InvalidState(format!(
                "import session {} was canceled",
                session.id
            ))),
        }
    }

    pub async fn record_count(&self, session: &ImportSession) -> Result<u64> {
        self.store.count_records(&session.id).await
    }

    /// Finalizes with the default JSON record importer.
    pub async fn finalize(
        &self,
        session: &mut ImportSession,
        options: FinalizeOptions,
    ) -> Result<Vec<LogEntry>> {
        self.finalize_with(session, options, &JsonRecordImporter).await
    }

    /// Replays every buffered record through `importer` and persists the
    /// results. All or nothing: on the first failing record every entry created
    /// so far is removed, the session is discarded and marked canceled, and the
    /// record's error is returned.
    #[instrument(
        skip(self, session, options, importer),
        fields(session = %session.id, importer = importer.name())
    )]
    pub async fn finalize_with(
        &self,
        session: &mut ImportSession,
        options: FinalizeOptions,
        importer: &dyn RecordImporter,
    ) -> Result<Vec<LogEntry>> {
        if session.canceled {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} was canceled",
                session.id
            )));
        }
        if session.is_finalized() {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} is already finalized",
                session.id
            )));
        }
        if self.store.count_records(&session.id).await? == 0 {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} has no records to finalize",
                session.id
            )));
        }

        let finalized_at = Utc::now();
        if !self.store.mark_finalized(&session.id, finalized_at).await? {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} is no longer open",
                session.id
            )));
        }

        let entries = match self.replay(session, options, importer).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "finalize aborted, rolling back import session");
                match self.discard(&session.id).await {
                    Ok(removed) => self.publish(DomainEvent::ImportCanceled {
                        session: session.id.clone(),
                        owner: session.owner.clone(),
                        removed_entries: removed,
                    }),
                    Err(rollback) => {
                        error!(error = %rollback, "rollback of import session failed");
                    }
                }
                session.canceled = true;
                return Err(err);
            }
        };

        session.finalized = Some(finalized_at);
        self.store.delete_records(&session.id).await?;
        info!(entries = entries.len(), "import session finalized");
        self.publish(DomainEvent::ImportFinalized {
            session: session.id.clone(),
            owner: session.owner.clone(),
            log_entries: entries.iter().map(|entry| entry.id.clone()).collect(),
        });
        Ok(entries)
    }

    async fn replay(
        &self,
        session: &ImportSession,
        options: FinalizeOptions,
        importer: &dyn RecordImporter,
    ) -> Result<Vec<LogEntry>> {
        let page_size = self.config.record_page_size.max(1);
        let mut last_number = if options.assign_log_numbers {
            self.store.max_log_number(&session.owner).await?.unwrap_or(0)
        } else {
            0
        };

        let mut entries = Vec::new();
        let mut after = None;
        loop {
            let page = self.store.list_records(&session.id, after, page_size).await?;
            debug!(records = page.len(), ?after, "replaying buffered records");

            for record in &page {
                let index = entries.len();
                let mut new_entry = importer.import_record(index, &record.payload)?;
                if options.assign_log_numbers {
                    match new_entry.log_number {
                        Some(number) => last_number = last_number.max(number),
                        None => {
                            last_number = last_number.saturating_add(1);
                            new_entry.log_number = Some(last_number);
                        }
                    }
                }
                let entry =
                    LogEntry::from_new(session.owner.clone(), Some(session.id.clone()), new_entry);
                self.store.insert_log_entry(&entry).await?;
                entries.push(entry);
            }

            if page.len() < page_size {
                break;
            }
            after = page.last().map(|record| record.sequence);
        }
        Ok(entries)
    }

    async fn discard(&self, id: &ImportSessionId) -> Result<u64> {
        let removed = self.store.delete_log_entries_by_session(id).await?;
        self.store.delete_session(id).await?;
        Ok(removed)
    }

    /// Discards an open session together with any entries created under it.
    #[instrument(skip(self, session), fields(session = %session.id))]
    pub async fn cancel(&self, session: &mut ImportSession) -> Result<()> {
        if session.is_finalized() {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} is already finalized",
                session.id
            )));
        }
        if session.canceled {
            return Err(LogbookError::MethodNotAllowed(format!(
                "import session {} was already canceled",
                session.id
            )));
        }

        if !self.store.delete_open_session(&session.id).await? {
            return match self.store.get_session(&session.owner, &session.id).await? {
                Some(current) if current.is_finalized() => {
                    session.finalized = current.finalized;
                    Err(LogbookError::MethodNotAllowed(format!(
                        "import session {} is already finalized",
                        session.id
                    )))
                }
                _ => Err(LogbookError::not_found("import session", &session.id)),
            };
        }

        let removed = self.store.delete_log_entries_by_session(&session.id).await?;
        session.canceled = true;
        info!(removed_entries = removed, "import session canceled");
        self.publish(DomainEvent::ImportCanceled {
            session: session.id.clone(),
            owner: session.owner.clone(),
            removed_entries: removed,
        });
        Ok(())
    }

    /// Creates a session and fills it from `payloads` in fixed-size batches.
    /// The first failing payload cancels the partially built session.
    #[instrument(skip(self, owner, metadata, payloads), fields(owner = %owner))]
    pub async fn import_records<I>(
        &self,
        owner: &UserId,
        metadata: ImportSessionMetadata,
        payloads: I,
    ) -> Result<ImportSession>
    where
        I: IntoIterator<Item = Result<String>>,
        I::IntoIter: Send,
    {
        let mut session = self.create(owner, metadata).await?;
        let batch_size = self.config.import_batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        for payload in payloads {
            let pushed = match payload {
                Ok(payload) => {
                    batch.push(payload);
                    if batch.len() < batch_size {
                        continue;
                    }
                    let pushed = self.add_records(&session, &batch).await;
                    batch.clear();
                    pushed
                }
                Err(err) => Err(err),
            };
            if let Err(err) = pushed {
                self.abandon(&mut session, &err).await;
                return Err(err);
            }
        }
        if !batch.is_empty() {
            if let Err(err) = self.add_records(&session, &batch).await {
                self.abandon(&mut session, &err).await;
                return Err(err);
            }
        }
        Ok(session)
    }

    async fn abandon(&self, session: &mut ImportSession, cause: &LogbookError) {
        warn!(session = %session.id, error = %cause, "import aborted, canceling session");
        if let Err(err) = self.cancel(session).await {
            error!(session = %session.id, error = %err, "failed to cancel aborted import session");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::storage::SqliteStorage;

    fn record(log_number: Option<u32>, day: u32) -> String {
        let number = log_number
            .map(|n| format!(r#""logNumber": {n}, "#))
            .unwrap_or_default();
        format!(
            r#"{{{number}"timing": {{"entryTime": "2024-03-{day:02}T10:00:00", "timezone": "Etc/UTC", "duration": 40}}}}"#
        )
    }

    fn manager(config: PipelineConfig) -> ImportSessionManager<SqliteStorage> {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        ImportSessionManager::new(store, config)
    }

    #[tokio::test]
    async fn finalize_replays_records_in_arrival_order() {
        let manager = manager(PipelineConfig {
            record_page_size: 2,
            ..Default::default()
        });
        let owner = UserId::from("usr_1");
        let mut session = manager.create(&owner, Default::default()).await.unwrap();
        manager
            .add_records(&session, &[record(None, 1), record(Some(7), 2)])
            .await
            .unwrap();
        manager
            .add_records(&session, &[record(None, 3), record(None, 4), record(None, 5)])
            .await
            .unwrap();
        assert_eq!(manager.record_count(&session).await.unwrap(), 5);

        let entries = manager
            .finalize(&mut session, FinalizeOptions { assign_log_numbers: true })
            .await
            .unwrap();
        let numbers: Vec<_> = entries.iter().map(|e| e.log_number).collect();
        assert_eq!(numbers, vec![Some(1), Some(7), Some(8), Some(9), Some(10)]);
        assert!(entries
            .iter()
            .all(|e| e.import_session.as_ref() == Some(&session.id)));
        assert!(session.is_finalized());
        assert_eq!(manager.record_count(&session).await.unwrap(), 0);

        let stored = manager.get(&owner, &session.id).await.unwrap();
        assert!(stored.is_finalized());
    }

    #[tokio::test]
    async fn add_records_rejects_closed_sessions() {
        let manager = manager(PipelineConfig::default());
        let owner = UserId::from("usr_1");

        let mut session = manager.create(&owner, Default::default()).await.unwrap();
        assert_matches!(
            manager.add_records(&session, &[]).await,
            Err(LogbookError::Validation { .. })
        );
        manager.add_records(&session, &[record(None, 1)]).await.unwrap();
        manager
            .finalize(&mut session, FinalizeOptions::default())
            .await
            .unwrap();
        assert_matches!(
            manager.add_records(&session, &[record(None, 2)]).await,
            Err(LogbookError::InvalidState(_))
        );

        let mut canceled = manager.create(&owner, Default::default()).await.unwrap();
        manager.cancel(&mut canceled).await.unwrap();
        assert!(canceled.canceled);
        assert_matches!(
            manager.add_records(&canceled, &[record(None, 1)]).await,
            Err(LogbookError::InvalidState(_))
        );
        assert_matches!(
            manager.get(&owner, &canceled.id).await,
            Err(LogbookError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn stale_handles_lose_the_race() {
        let manager = manager(PipelineConfig::default());
        let owner = UserId::from("usr_1");
        let mut session = manager.create(&owner, Default::default()).await.unwrap();
        manager.add_records(&session, &[record(None, 1)]).await.unwrap();

        let mut stale = session.clone();
        manager
            .finalize(&mut session, FinalizeOptions::default())
            .await
            .unwrap();

        assert_matches!(
            manager.finalize(&mut stale, FinalizeOptions::default()).await,
            Err(LogbookError::MethodNotAllowed(_))
        );
        let mut stale = manager.get(&owner, &session.id).await.unwrap();
        stale.finalized = None;
        assert_matches!(
            manager.cancel(&mut stale).await,
            Err(LogbookError::MethodNotAllowed(_))
        );
        assert!(stale.is_finalized());
    }

    #[tokio::test]
    async fn import_records_cancels_on_first_failure() {
        let (outbox, mut events) = Outbox::channel();
        let manager = manager(PipelineConfig {
            import_batch_size: 2,
            ..Default::default()
        })
        .with_outbox(outbox);
        let owner = UserId::from("usr_1");
        let payloads = vec![
            Ok(record(None, 1)),
            Ok(record(None, 2)),
            Ok(record(None, 3)),
            Err(LogbookError::validation(Some(3), "duration", "bad")),
            Ok(record(None, 5)),
        ];
        let err = manager
            .import_records(&owner, Default::default(), payloads)
            .await
            .unwrap_err();
        assert_matches!(err, LogbookError::Validation { record: Some(3), .. });

        // The first batch was already buffered when the fourth payload failed.
        let aborted = assert_matches!(
            events.try_recv(),
            Ok(DomainEvent::ImportCanceled { session, removed_entries: 0, .. }) => session
        );
        assert_matches!(manager.store.get_session(&owner, &aborted).await, Ok(None));
        assert_eq!(manager.store.count_records(&aborted).await.unwrap(), 0);

        let session = manager
            .import_records(&owner, Default::default(), vec![Ok(record(None, 1))])
            .await
            .unwrap();
        assert_eq!(manager.record_count(&session).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_page_and_batch_sizes_still_make_progress() {
        let manager = manager(PipelineConfig {
            record_page_size: 0,
            import_batch_size: 0,
            ..Default::default()
        });
        let owner = UserId::from("usr_1");
        let mut session = manager
            .import_records(
                &owner,
                Default::default(),
                vec![Ok(record(None, 1)), Ok(record(None, 2))],
            )
            .await
            .unwrap();
        assert_eq!(manager.record_count(&session).await.unwrap(), 2);

        let entries = manager
            .finalize(&mut session, FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }
}
