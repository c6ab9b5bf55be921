use thiserror::Error;

use crate::models::LogEntryId;

pub type Result<T> = std::result::Result<T, LogbookError>;

/// Error type for the import, sample and export pipeline.
#[derive(Error, Debug)]
pub enum LogbookError {
    #[error("{}", validation_message(*record, field.as_deref(), message))]
    Validation {
        record: Option<usize>,
        field: Option<String>,
        message: String,
    },

    #[error("log entry {log_entry} already has samples at time offsets {time_offsets:?}")]
    Conflict {
        log_entry: LogEntryId,
        time_offsets: Vec<u32>,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("failed to parse {format} document: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn validation_message(record: Option<usize>, field: Option<&str>, message: &str) -> String {
    match (record, field) {
        (Some(record), Some(field)) => format!("record {record}: invalid {field}: {message}"),
        (Some(record), None) => format!("record {record}: {message}"),
        (None, Some(field)) => format!("invalid {field}: {message}"),
        (None, None) => message.to_string(),
    }
}

impl LogbookError {
    pub(crate) fn validation(
        record: Option<usize>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LogbookError::Validation {
            record,
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LogbookError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable discriminator for API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            LogbookError::Validation { .. } => "validation",
            LogbookError::Conflict { .. } => "conflict",
            LogbookError::InvalidState(_) => "invalid_state",
            LogbookError::MethodNotAllowed(_) => "method_not_allowed",
            LogbookError::NotFound { .. } => "not_found",
            LogbookError::Parse { .. } => "parse",
            LogbookError::Config(_) => "config",
            LogbookError::Storage(_) => "storage",
            LogbookError::Serialization(_) => "serialization",
            LogbookError::Io(_) => "io",
        }
    }

    /// HTTP status the transport layer surfaces for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            LogbookError::Validation { .. } | LogbookError::Parse { .. } => 400,
            LogbookError::NotFound { .. } => 404,
            LogbookError::MethodNotAllowed(_) => 405,
            LogbookError::Conflict { .. } | LogbookError::InvalidState(_) => 409,
            LogbookError::Config(_)
            | LogbookError::Storage(_)
            | LogbookError::Serialization(_)
            | LogbookError::Io(_) => 500,
        }
    }
}
