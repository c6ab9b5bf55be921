//! Importers: pluggable transforms from external input into normalized log entries.
//!
//! Two layers. A [`FileImporter`] turns a whole uploaded file into a freshly
//! created import session full of buffered records, all in the shared
//! [`RecordDocument`] shape. A [`RecordImporter`] turns one buffered record into
//! a [`NewLogEntry`] when the session is finalized. Adding a format means
//! writing a file-level transform into `RecordDocument`; validation and
//! persistence stay in one place.

pub mod json;
pub mod record;
pub mod session;
pub mod subsurface;
pub mod units;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ImportSession, NewLogEntry, UserId};
use crate::storage::{LogEntryRepository, SessionRepository};

pub use json::{JsonFileImporter, JsonRecordImporter};
pub use record::RecordDocument;
pub use session::{FinalizeOptions, ImportSessionManager};
pub use subsurface::{SubsurfaceDocument, SubsurfaceImporter};

/// Normalizes one buffered record.
pub trait RecordImporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// `index` is the record's zero-based arrival position, used in errors.
    fn import_record(&self, index: usize, payload: &str) -> Result<NewLogEntry>;
}

/// Parses a whole file into a new, populated import session.
#[async_trait]
pub trait FileImporter: Send + Sync {
    fn format(&self) -> ImportFormat;

    async fn parse_file(&self, bytes: &[u8], owner: &UserId) -> Result<ImportSession>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportFormat {
    /// JSON array or newline-delimited JSON of records.
    Json,
    /// Subsurface XML divelog.
    Subsurface,
}

impl ImportFormat {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/json" | "application/x-ndjson" | "application/jsonl" => {
                Some(ImportFormat::Json)
            }
            "application/xml" | "text/xml" | "application/vnd.subsurface+xml" => {
                Some(ImportFormat::Subsurface)
            }
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, extension) = name.rsplit_once('.')?;
        match extension.to_ascii_lowercase().as_str() {
            "json" | "ndjson" | "jsonl" => Some(ImportFormat::Json),
            "xml" | "ssrf" => Some(ImportFormat::Subsurface),
            _ => None,
        }
    }
}

/// The file importer for `format`, pushing into sessions owned by `sessions`.
pub fn file_importer<S>(
    format: ImportFormat,
    sessions: Arc<ImportSessionManager<S>>,
) -> Box<dyn FileImporter>
where
    S: SessionRepository + LogEntryRepository + 'static,
{
    match format {
        ImportFormat::Json => Box::new(JsonFileImporter::new(sessions)),
        ImportFormat::Subsurface => Box::new(SubsurfaceImporter::new(sessions)),
    }
}
