pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod ffi;
pub mod import;
pub mod migrations;
pub mod models;
pub mod samples;
pub mod storage;

uniffi::setup_scaffolding!();

pub use config::{load_config, load_config_from_path, PipelineConfig};
pub use error::{LogbookError, Result};
pub use events::{DomainEvent, Outbox};
pub use export::{write_json_array, ExportFilter, ExportStreamer};
pub use import::{
    file_importer, FileImporter, FinalizeOptions, ImportFormat, ImportSessionManager,
    JsonFileImporter, JsonRecordImporter, RecordDocument, RecordImporter, SubsurfaceImporter,
};
pub use models::{
    AirUsage, Conditions, DepthUnit, Depths, EquipmentUsage, GpsPoint, ImportSession,
    ImportSessionId, ImportSessionMetadata, LogEntry, LogEntryId, NewLogEntry, OperatorId,
    PressureUnit, Sample, SiteId, TemperatureUnit, Timing, UserId, WeightUnit,
};
pub use samples::{SampleStore, SaveSummary};
pub use storage::{
    LogEntryQuery, LogEntryRepository, SampleRepository, SessionRepository, SortDirection,
    SortField, SqliteStorage,
};
