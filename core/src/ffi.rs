//! Offline entry points exported to the mobile apps: check a record, or turn a
//! Subsurface divelog into records, before anything is uploaded.

use chrono_tz::Tz;

use crate::error::LogbookError;
use crate::import::{JsonRecordImporter, RecordImporter, SubsurfaceDocument};

#[derive(Debug, thiserror::Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum FfiImportError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Internal(String),
}

impl From<LogbookError> for FfiImportError {
    fn from(err: LogbookError) -> Self {
        match err {
            LogbookError::Validation { .. } => FfiImportError::Validation(err.to_string()),
            LogbookError::Parse { .. } => FfiImportError::Parse(err.to_string()),
            other => FfiImportError::Internal(other.to_string()),
        }
    }
}

/// What a record normalizes to, for display before upload.
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct ImportRecordSummary {
    pub log_number: Option<u32>,
    pub entry_time_unix: i64,
    pub timezone: String,
    pub duration_minutes: f64,
    pub air_count: u32,
    pub tag_count: u32,
}

/// Validates one JSON record exactly as finalize would.
#[uniffi::export]
pub fn validate_import_record(record_json: String) -> Result<ImportRecordSummary, FfiImportError> {
    let entry = JsonRecordImporter.import_record(0, &record_json)?;
    Ok(ImportRecordSummary {
        log_number: entry.log_number,
        entry_time_unix: entry.timing.entry_time.timestamp(),
        timezone: entry.timing.timezone,
        duration_minutes: entry.timing.duration,
        air_count: u32::try_from(entry.air.len()).unwrap_or(u32::MAX),
        tag_count: u32::try_from(entry.tags.len()).unwrap_or(u32::MAX),
    })
}

/// Converts a Subsurface divelog into JSON records ready for `addRecords`.
#[uniffi::export]
pub fn convert_subsurface_xml(
    xml: String,
    timezone: String,
) -> Result<Vec<String>, FfiImportError> {
    let zone: Tz = timezone
        .parse()
        .map_err(|_| FfiImportError::Validation(format!("unknown timezone '{timezone}'")))?;
    let document = SubsurfaceDocument::parse(xml.as_bytes())?;
    if document.dive_count() == 0 {
        return Err(FfiImportError::Parse("divelog contains no dives".to_string()));
    }
    document
        .records(zone)
        .map(|record| {
            let record = record?;
            serde_json::to_string(&record).map_err(|e| FfiImportError::Internal(e.to_string()))
        })
        .collect()
}
