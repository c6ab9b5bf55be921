//! Persistence contract for the pipeline.
//!
//! The services in this crate only talk to storage through these traits. The
//! contract they rely on: ordered range queries with skip/limit, bulk batch
//! inserts, deletes by id and by provenance, and a max/mean aggregate over the
//! nullable sample depth column.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    BufferedRecord, DepthUnit, ImportSession, ImportSessionId, LogEntry, LogEntryId, Sample,
    UserId,
};

pub use sqlite::SqliteStorage;

/// Outcome of appending records to a session row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(usize),
    /// The session has already been finalized.
    Closed,
    Missing,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    EntryTime,
    LogNumber,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

/// Filter for listing a logbook. Results are ordered by `sort`, ties broken by id.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntryQuery {
    pub owner: UserId,
    /// Case-insensitive substring match against notes.
    pub text: Option<String>,
    pub entry_time_from: Option<DateTime<Utc>>,
    pub entry_time_to: Option<DateTime<Utc>>,
    pub tag: Option<String>,
    pub sort: SortField,
    pub direction: SortDirection,
}

impl LogEntryQuery {
    pub fn for_owner(owner: UserId) -> Self {
        Self {
            owner,
            text: None,
            entry_time_from: None,
            entry_time_to: None,
            tag: None,
            sort: SortField::default(),
            direction: SortDirection::default(),
        }
    }
}

/// Max and mean over the stored, non-null sample depths of one entry.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthAggregate {
    pub max_depth: Option<f64>,
    pub average_depth: Option<f64>,
    /// Samples that carry a depth.
    pub sample_count: u64,
    /// Every stored sample, with or without a depth.
    pub stored_samples: u64,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert_session(&self, session: &ImportSession) -> Result<()>;
    async fn get_session(
        &self,
        owner: &UserId,
        id: &ImportSessionId,
    ) -> Result<Option<ImportSession>>;

    /// Appends payloads after the session's last sequence number, only while
    /// the session is still open.
    async fn append_records(&self, id: &ImportSessionId, payloads: &[String])
        -> Result<AppendOutcome>;
    async fn count_records(&self, id: &ImportSessionId) -> Result<u64>;
    /// Records with a sequence greater than `after`, ascending.
    async fn list_records(
        &self,
        id: &ImportSessionId,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BufferedRecord>>;
    async fn delete_records(&self, id: &ImportSessionId) -> Result<u64>;

    /// Sets the finalized timestamp if and only if it is still unset.
    async fn mark_finalized(&self, id: &ImportSessionId, at: DateTime<Utc>) -> Result<bool>;
    /// Deletes the session and its records if and only if it is not finalized.
    async fn delete_open_session(&self, id: &ImportSessionId) -> Result<bool>;
    async fn delete_session(&self, id: &ImportSessionId) -> Result<bool>;
}

#[async_trait]
pub trait LogEntryRepository: Send + Sync {
    async fn insert_log_entry(&self, entry: &LogEntry) -> Result<()>;
    async fn get_log_entry(&self, id: &LogEntryId) -> Result<Option<LogEntry>>;
    async fn list_log_entries(
        &self,
        query: &LogEntryQuery,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;
    async fn delete_log_entries_by_session(&self, session: &ImportSessionId) -> Result<u64>;
    async fn max_log_number(&self, owner: &UserId) -> Result<Option<u32>>;
    async fn update_depths(
        &self,
        id: &LogEntryId,
        max_depth: Option<f64>,
        average_depth: Option<f64>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait SampleRepository: Send + Sync {
    /// Which of `offsets` are already stored for the entry, ascending.
    async fn find_sample_collisions(&self, entry: &LogEntryId, offsets: &[u32])
        -> Result<Vec<u32>>;
    /// Inserts the batch atomically.
    async fn insert_samples(&self, entry: &LogEntryId, samples: &[Sample]) -> Result<()>;
    /// Samples ordered by ascending time offset.
    async fn list_samples(
        &self,
        entry: &LogEntryId,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Sample>>;
    async fn delete_samples(&self, entry: &LogEntryId) -> Result<u64>;
    /// Aggregates depths expressed in `unit`; samples without a unit are taken
    /// to already be in `unit`.
    async fn aggregate_depths(&self, entry: &LogEntryId, unit: DepthUnit)
        -> Result<DepthAggregate>;
}
