//! Batch and page sizes for the import, sample and export pipeline.
//!
//! Values are resolved from three layers, lowest priority first:
//! 1. compiled defaults ([`PipelineConfig::default`])
//! 2. an optional JSON file ([`load_config_from_path`]), partial files allowed
//! 3. `DIVELOG_*` environment variables

use std::path::Path;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{LogbookError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Records pushed into a session per round by file importers.
    pub import_batch_size: usize,
    /// Buffered records read per round while finalizing.
    pub record_page_size: usize,
    /// Samples checked and written per round by `save_samples`.
    pub sample_batch_size: usize,
    /// Samples fetched per round by `get_samples`.
    pub sample_page_size: usize,
    /// Log entries fetched per round by `begin_export`.
    pub export_page_size: usize,
    /// Zone applied to formats that record local time only.
    pub default_timezone: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            import_batch_size: 20,
            record_page_size: 100,
            sample_batch_size: 500,
            sample_page_size: 1000,
            export_page_size: 50,
            default_timezone: "Etc/UTC".to_string(),
        }
    }
}

const SIZE_OVERRIDES: &[&str] = &[
    "DIVELOG_IMPORT_BATCH_SIZE",
    "DIVELOG_RECORD_PAGE_SIZE",
    "DIVELOG_SAMPLE_BATCH_SIZE",
    "DIVELOG_SAMPLE_PAGE_SIZE",
    "DIVELOG_EXPORT_PAGE_SIZE",
];

impl PipelineConfig {
    /// Rejects zero sizes and unknown timezones.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("importBatchSize", self.import_batch_size),
            ("recordPageSize", self.record_page_size),
            ("sampleBatchSize", self.sample_batch_size),
            ("samplePageSize", self.sample_page_size),
            ("exportPageSize", self.export_page_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(LogbookError::Config(format!("{name} must be greater than zero")));
        }
        self.default_timezone
            .parse::<Tz>()
            .map_err(|_| {
                LogbookError::Config(format!("unknown timezone '{}'", self.default_timezone))
            })?;
        Ok(())
    }

    /// Applies `DIVELOG_*` overrides from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in SIZE_OVERRIDES {
            let Some(raw) = lookup(key) else {
                continue;
            };
            let value: usize = raw
                .trim()
                .parse()
                .map_err(|_| LogbookError::Config(format!("{key} is not a number: '{raw}'")))?;
            match *key {
                "DIVELOG_IMPORT_BATCH_SIZE" => self.import_batch_size = value,
                "DIVELOG_RECORD_PAGE_SIZE" => self.record_page_size = value,
                "DIVELOG_SAMPLE_BATCH_SIZE" => self.sample_batch_size = value,
                "DIVELOG_SAMPLE_PAGE_SIZE" => self.sample_page_size = value,
                _ => self.export_page_size = value,
            }
        }
        if let Some(tz) = lookup("DIVELOG_DEFAULT_TIMEZONE") {
            self.default_timezone = tz.trim().to_string();
        }
        Ok(())
    }
}

/// Defaults plus environment overrides.
pub fn load_config() -> Result<PipelineConfig> {
    let mut config = PipelineConfig::default();
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Defaults, then the JSON file at `path`, then environment overrides.
pub fn load_config_from_path(path: &Path) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)?;
    let mut config: PipelineConfig = serde_json::from_str(&raw)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    tracing::debug!(?path, "pipeline config loaded");
    Ok(config)
}
