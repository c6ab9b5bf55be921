//! Default record importer plus the JSON file importer that feeds it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tracing::instrument;

use super::record::{
    AirDocument, ConditionsDocument, DepthsDocument, EquipmentDocument, RecordDocument,
    TimingDocument,
};
use super::session::ImportSessionManager;
use super::{FileImporter, ImportFormat, RecordImporter};
use crate::error::{LogbookError, Result};
use crate::models::{
    AirUsage, Conditions, Depths, EquipmentUsage, ImportSession, ImportSessionMetadata,
    NewLogEntry, OperatorId, PressureUnit, SiteId, Timing, UserId,
};
use crate::storage::{LogEntryRepository, SessionRepository};

const MAX_NOTES_LEN: usize = 5000;
const MAX_SHORT_TEXT_LEN: usize = 200;
const MAX_TAGS: usize = 50;
const MAX_TAG_LEN: usize = 100;
const MAX_AIR_ENTRIES: usize = 20;
const MAX_VISIBILITY: u8 = 10;

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Schema validation and normalization of [`RecordDocument`] payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRecordImporter;

impl RecordImporter for JsonRecordImporter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn import_record(&self, index: usize, payload: &str) -> Result<NewLogEntry> {
        let document = RecordDocument::from_json(index, payload)?;
        normalize(index, document)
    }
}

/// Validates a record and coalesces it into a [`NewLogEntry`]. Fails on the
/// first offending field.
pub fn normalize(index: usize, doc: RecordDocument) -> Result<NewLogEntry> {
    let v = Validator { index };

    let log_number = match doc.log_number {
        Some(0) => return Err(v.fail("logNumber", "must be a positive integer")),
        other => other,
    };

    Ok(NewLogEntry {
        log_number,
        site: v.text("site", doc.site, MAX_SHORT_TEXT_LEN)?.map(SiteId),
        operator: v.text("operator", doc.operator, MAX_SHORT_TEXT_LEN)?.map(OperatorId),
        timing: v.timing(doc.timing)?,
        depths: v.depths(doc.depths.unwrap_or_default())?,
        conditions: v.conditions(doc.conditions.unwrap_or_default())?,
        equipment: v.equipment(doc.equipment.unwrap_or_default())?,
        air: v.air(doc.air.unwrap_or_default())?,
        notes: v.text("notes", doc.notes, MAX_NOTES_LEN)?,
        tags: v.tags(doc.tags.unwrap_or_default())?,
    })
}

/// Parses a local wall-clock timestamp in any of the accepted layouts.
pub(crate) fn parse_local_time(raw: &str) -> Option<NaiveDateTime> {
    LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

struct Validator {
    index: usize,
}

impl Validator {
    fn fail(&self, field: impl Into<String>, message: impl Into<String>) -> LogbookError {
        LogbookError::validation(Some(self.index), field, message)
    }

    fn text(&self, field: &str, value: Option<String>, max_len: usize) -> Result<Option<String>> {
        let Some(value) = value else {
            return Ok(None);
        };
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        if value.chars().count() > max_len {
            return Err(self.fail(field, format!("must be at most {max_len} characters")));
        }
        Ok(Some(value.to_string()))
    }

    fn non_negative(&self, field: &str, value: Option<f64>) -> Result<Option<f64>> {
        match value {
            Some(v) if !v.is_finite() || v < 0.0 => {
                Err(self.fail(field, "must be a non-negative number"))
            }
            other => Ok(other),
        }
    }

    fn positive(&self, field: &str, value: Option<f64>) -> Result<Option<f64>> {
        match value {
            Some(v) if !v.is_finite() || v <= 0.0 => {
                Err(self.fail(field, "must be greater than zero"))
            }
            other => Ok(other),
        }
    }

    fn finite(&self, field: &str, value: Option<f64>) -> Result<Option<f64>> {
        match value {
            Some(v) if !v.is_finite() => Err(self.fail(field, "must be a finite number")),
            other => Ok(other),
        }
    }

    fn timing(&self, doc: Option<TimingDocument>) -> Result<Timing> {
        let doc = doc.ok_or_else(|| self.fail("timing", "is required"))?;

        let zone_name = self
            .text("timing.timezone", doc.timezone, MAX_SHORT_TEXT_LEN)?
            .ok_or_else(|| self.fail("timing.timezone", "is required"))?;
        let zone: Tz = zone_name
            .parse()
            .map_err(|_| self.fail("timing.timezone", format!("unknown timezone '{zone_name}'")))?;

        let local_text =
            self.text("timing.localEntryTime", doc.local_entry_time, MAX_SHORT_TEXT_LEN)?;
        let local = match local_text {
            Some(raw) => parse_local_time(&raw).ok_or_else(|| {
                self.fail("timing.localEntryTime", format!("'{raw}' is not a valid date/time"))
            })?,
            None => {
                let raw = self
                    .text("timing.entryTime", doc.entry_time, MAX_SHORT_TEXT_LEN)?
                    .ok_or_else(|| self.fail("timing.entryTime", "is required"))?;
                parse_local_time(&raw)
                    .or_else(|| {
                        DateTime::parse_from_rfc3339(&raw)
                            .ok()
                            .map(|instant| instant.with_timezone(&zone).naive_local())
                    })
                    .ok_or_else(|| {
                        self.fail("timing.entryTime", format!("'{raw}' is not a valid date/time"))
                    })?
            }
        };

        // Ambiguous wall-clock times (DST fall-back) resolve to the earlier instant.
        let entry_time = zone
            .from_local_datetime(&local)
            .earliest()
            .ok_or_else(|| {
                self.fail(
                    "timing.entryTime",
                    format!("{local} does not exist in {zone_name}"),
                )
            })?
            .with_timezone(&Utc);

        let duration = self
            .positive("timing.duration", doc.duration)?
            .ok_or_else(|| self.fail("timing.duration", "is required"))?;
        let bottom_time = self.positive("timing.bottomTime", doc.bottom_time)?;
        if bottom_time.is_some_and(|bottom| bottom > duration) {
            return Err(self.fail("timing.bottomTime", "cannot exceed the dive duration"));
        }

        Ok(Timing {
            entry_time,
            local_entry_time: local,
            timezone: zone_name,
            duration,
            bottom_time,
        })
    }

    fn depths(&self, doc: DepthsDocument) -> Result<Depths> {
        let max_depth = self.non_negative("depths.maxDepth", doc.max_depth)?;
        let average_depth = self.non_negative("depths.averageDepth", doc.average_depth)?;
        if let (Some(max), Some(avg)) = (max_depth, average_depth) {
            if avg > max {
                return Err(self.fail("depths.averageDepth", "cannot exceed the maximum depth"));
            }
        }
        Ok(Depths {
            max_depth,
            average_depth,
            depth_unit: doc.depth_unit.unwrap_or_default(),
        })
    }

    fn conditions(&self, doc: ConditionsDocument) -> Result<Conditions> {
        if doc.visibility.is_some_and(|v| v > MAX_VISIBILITY) {
            return Err(self.fail(
                "conditions.visibility",
                format!("must be between 0 and {MAX_VISIBILITY}"),
            ));
        }
        let conditions = Conditions {
            air_temperature: self.finite("conditions.airTemperature", doc.air_temperature)?,
            surface_temperature: self
                .finite("conditions.surfaceTemperature", doc.surface_temperature)?,
            bottom_temperature: self
                .finite("conditions.bottomTemperature", doc.bottom_temperature)?,
            temperature_unit: doc.temperature_unit,
            weather: self.text("conditions.weather", doc.weather, MAX_SHORT_TEXT_LEN)?,
            current: self.text("conditions.current", doc.current, MAX_SHORT_TEXT_LEN)?,
            chop: self.text("conditions.chop", doc.chop, MAX_SHORT_TEXT_LEN)?,
            visibility: doc.visibility,
        };
        let has_temperature = conditions.air_temperature.is_some()
            || conditions.surface_temperature.is_some()
            || conditions.bottom_temperature.is_some();
        if has_temperature && conditions.temperature_unit.is_none() {
            return Err(self.fail(
                "conditions.temperatureUnit",
                "is required when temperatures are given",
            ));
        }
        Ok(conditions)
    }

    fn equipment(&self, doc: EquipmentDocument) -> Result<EquipmentUsage> {
        let weight = self.non_negative("equipment.weight", doc.weight)?;
        if weight.is_some() && doc.weight_unit.is_none() {
            return Err(self.fail("equipment.weightUnit", "is required when weight is given"));
        }
        let mut items = Vec::new();
        for (i, item) in doc.items.unwrap_or_default().into_iter().enumerate() {
            let field = format!("equipment.items[{i}]");
            if let Some(item) = self.text(&field, Some(item), MAX_SHORT_TEXT_LEN)? {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
        }
        Ok(EquipmentUsage {
            weight,
            weight_unit: doc.weight_unit,
            weight_correctness: self.text(
                "equipment.weightCorrectness",
                doc.weight_correctness,
                MAX_SHORT_TEXT_LEN,
            )?,
            trim_correctness: self.text(
                "equipment.trimCorrectness",
                doc.trim_correctness,
                MAX_SHORT_TEXT_LEN,
            )?,
            items,
            comments: self.text("equipment.comments", doc.comments, MAX_NOTES_LEN)?,
        })
    }

    fn air(&self, docs: Vec<AirDocument>) -> Result<Vec<AirUsage>> {
        if docs.len() > MAX_AIR_ENTRIES {
            return Err(self.fail("air", format!("at most {MAX_AIR_ENTRIES} entries are allowed")));
        }
        docs.into_iter()
            .enumerate()
            .map(|(i, doc)| {
                let path = |name: &str| format!("air[{i}].{name}");
                let count = doc.count.unwrap_or(1);
                if count == 0 {
                    return Err(self.fail(path("count"), "must be at least 1"));
                }
                let o2_percent = self.positive(&path("o2Percent"), doc.o2_percent)?;
                let he_percent = self.non_negative(&path("hePercent"), doc.he_percent)?;
                let total = o2_percent.unwrap_or(0.0) + he_percent.unwrap_or(0.0);
                if total > 100.0 {
                    return Err(self.fail(path("hePercent"), "oxygen and helium exceed 100%"));
                }
                Ok(AirUsage {
                    ordinal: u32::try_from(i).unwrap_or(u32::MAX),
                    tank_name: self.text(&path("tankName"), doc.tank_name, MAX_SHORT_TEXT_LEN)?,
                    tank_volume: self.positive(&path("tankVolume"), doc.tank_volume)?,
                    working_pressure: self
                        .positive(&path("workingPressure"), doc.working_pressure)?,
                    count,
                    start_pressure: self.non_negative(&path("startPressure"), doc.start_pressure)?,
                    end_pressure: self.non_negative(&path("endPressure"), doc.end_pressure)?,
                    pressure_unit: doc.pressure_unit.unwrap_or(PressureUnit::Bar),
                    o2_percent,
                    he_percent,
                })
            })
            .collect()
    }

    fn tags(&self, raw: Vec<String>) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut tags = Vec::new();
        for (i, tag) in raw.into_iter().enumerate() {
            let Some(tag) = self.text(&format!("tags[{i}]"), Some(tag), MAX_TAG_LEN)? else {
                continue;
            };
            if seen.insert(tag.to_lowercase()) {
                tags.push(tag);
            }
        }
        if tags.len() > MAX_TAGS {
            return Err(self.fail("tags", format!("at most {MAX_TAGS} tags are allowed")));
        }
        Ok(tags)
    }
}

/// Buffers a JSON array (or newline-delimited JSON) of records into a new
/// session without validating them; validation happens at finalize.
pub struct JsonFileImporter<S> {
    sessions: Arc<ImportSessionManager<S>>,
}

impl<S> JsonFileImporter<S> {
    pub fn new(sessions: Arc<ImportSessionManager<S>>) -> Self {
        Self { sessions }
    }
}

fn parse_error(message: impl Into<String>) -> LogbookError {
    LogbookError::Parse {
        format: "json",
        message: message.into(),
    }
}

fn split_records(bytes: &[u8]) -> Result<Vec<Value>> {
    let trimmed = bytes.trim_ascii_start();
    if trimmed.first() == Some(&b'[') {
        return serde_json::from_slice::<Vec<Value>>(trimmed)
            .map_err(|e| parse_error(e.to_string()));
    }
    serde_json::Deserializer::from_slice(trimmed)
        .into_iter::<Value>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| parse_error(e.to_string()))
}

#[async_trait]
impl<S> FileImporter for JsonFileImporter<S>
where
    S: SessionRepository + LogEntryRepository + 'static,
{
    fn format(&self) -> ImportFormat {
        ImportFormat::Json
    }

    #[instrument(skip(self, bytes, owner), fields(owner = %owner, bytes = bytes.len()))]
    async fn parse_file(&self, bytes: &[u8], owner: &UserId) -> Result<ImportSession> {
        let records = split_records(bytes)?;
        if records.is_empty() {
            return Err(parse_error("file contains no records"));
        }
        let payloads = records
            .into_iter()
            .map(|value| serde_json::to_string(&value).map_err(LogbookError::from));
        let metadata = ImportSessionMetadata {
            device: Some("json".to_string()),
            ..Default::default()
        };
        self.sessions.import_records(owner, metadata, payloads).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, Timelike};

    use super::*;
    use crate::models::DepthUnit;

    fn import(payload: &str) -> Result<NewLogEntry> {
        JsonRecordImporter.import_record(0, payload)
    }

    fn field_of(err: LogbookError) -> String {
        match err {
            LogbookError::Validation { field: Some(f), .. } => f,
            other => panic!("expected a field validation error, got {other}"),
        }
    }

    #[test]
    fn normalizes_a_full_record() {
        let entry = import(
            r#"{
                "logNumber": 12,
                "site": "  site_abc ",
                "timing": {"entryTime": "2024-03-01T10:15:00", "timezone": "Pacific/Guam", "duration": 48, "bottomTime": 40},
                "depths": {"maxDepth": 30.2, "averageDepth": 18.0, "depthUnit": "m"},
                "conditions": {"bottomTemperature": 27, "temperatureUnit": "C", "weather": "", "visibility": 8},
                "equipment": {"weight": 4, "weightUnit": "kg", "items": ["bcd", "bcd", " fins "]},
                "air": [
                    {"tankName": "AL80", "startPressure": 200, "endPressure": 60, "pressureUnit": "bar", "o2Percent": 32},
                    {"tankName": "Stage", "count": 2, "pressureUnit": "psi"}
                ],
                "notes": "  Turtles!  ",
                "tags": ["reef", "Reef", " ", "night"]
            }"#,
        )
        .unwrap();

        assert_eq!(entry.log_number, Some(12));
        assert_eq!(entry.site, Some(SiteId("site_abc".into())));
        // Guam is UTC+10.
        assert_eq!(entry.timing.entry_time.hour(), 0);
        assert_eq!(
            entry.timing.local_entry_time,
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 15, 0)
                .unwrap()
        );
        assert_eq!(entry.depths.depth_unit, DepthUnit::Meters);
        assert_eq!(entry.conditions.weather, None);
        assert_eq!(entry.equipment.items, vec!["bcd".to_string(), "fins".to_string()]);
        assert_eq!(
            entry.air.iter().map(|a| a.ordinal).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(entry.air[1].count, 2);
        assert_eq!(entry.air[1].pressure_unit, PressureUnit::Psi);
        assert_eq!(entry.notes.as_deref(), Some("Turtles!"));
        assert_eq!(entry.tags, vec!["reef".to_string(), "night".to_string()]);
    }

    #[test]
    fn accepts_exported_instants() {
        let entry = import(
            r#"{"timing": {"entryTime": "2024-03-01T00:15:00Z", "timezone": "Pacific/Guam", "duration": 30}}"#,
        )
        .unwrap();
        assert_eq!(entry.timing.local_entry_time.hour(), 10);
        assert_eq!(entry.timing.entry_time.hour(), 0);
    }

    #[test]
    fn local_entry_time_takes_precedence() {
        let entry = import(
            r#"{"timing": {"entryTime": "garbage", "localEntryTime": "2024-07-04 09:30", "timezone": "America/New_York", "duration": 30}}"#,
        )
        .unwrap();
        assert_eq!(entry.timing.entry_time.hour(), 13);
    }

    #[test]
    fn rejects_missing_or_bad_timing() {
        assert_eq!(field_of(import("{}").unwrap_err()), "timing");
        assert_eq!(
            field_of(
                import(r#"{"timing": {"entryTime": "2024-03-01T10:00:00", "timezone": "Atlantis/Lost", "duration": 30}}"#)
                    .unwrap_err()
            ),
            "timing.timezone"
        );
        assert_eq!(
            field_of(
                import(r#"{"timing": {"entryTime": "yesterday", "timezone": "Etc/UTC", "duration": 30}}"#)
                    .unwrap_err()
            ),
            "timing.entryTime"
        );
        assert_eq!(
            field_of(
                import(r#"{"timing": {"entryTime": "2024-03-01T10:00:00", "timezone": "Etc/UTC", "duration": 0}}"#)
                    .unwrap_err()
            ),
            "timing.duration"
        );
        assert_eq!(
            field_of(
                import(r#"{"timing": {"entryTime": "2024-03-01T10:00:00", "timezone": "Etc/UTC", "duration": 30, "bottomTime": 45}}"#)
                    .unwrap_err()
            ),
            "timing.bottomTime"
        );
    }

    #[test]
    fn rejects_nonexistent_local_time() {
        // Clocks in New York jumped from 02:00 to 03:00 on 2024-03-10.
        let err = import(
            r#"{"timing": {"entryTime": "2024-03-10T02:30:00", "timezone": "America/New_York", "duration": 30}}"#,
        )
        .unwrap_err();
        assert_eq!(field_of(err), "timing.entryTime");
    }

    #[test]
    fn rejects_inconsistent_values() {
        let timing = r#""timing": {"entryTime": "2024-03-01T10:00:00", "timezone": "Etc/UTC", "duration": 30}"#;
        let cases = [
            (format!(r#"{{{timing}, "logNumber": 0}}"#), "logNumber"),
            (
                format!(r#"{{{timing}, "depths": {{"maxDepth": 10, "averageDepth": 12}}}}"#),
                "depths.averageDepth",
            ),
            (
                format!(r#"{{{timing}, "air": [{{}}, {{"o2Percent": 80, "hePercent": 30}}]}}"#),
                "air[1].hePercent",
            ),
            (format!(r#"{{{timing}, "air": [{{"count": 0}}]}}"#), "air[0].count"),
            (
                format!(r#"{{{timing}, "conditions": {{"airTemperature": 20}}}}"#),
                "conditions.temperatureUnit",
            ),
            (
                format!(r#"{{{timing}, "conditions": {{"visibility": 11}}}}"#),
                "conditions.visibility",
            ),
            (
                format!(r#"{{{timing}, "equipment": {{"weight": 3}}}}"#),
                "equipment.weightUnit",
            ),
            (
                format!(r#"{{{timing}, "depths": {{"depthUnit": "fathoms"}}}}"#),
                "depths",
            ),
        ];
        for (payload, expected) in cases {
            assert_eq!(field_of(import(&payload).unwrap_err()), expected, "{payload}");
        }
    }

    #[test]
    fn reports_the_record_index() {
        let err = JsonRecordImporter.import_record(9, "{}").unwrap_err();
        assert_matches!(err, LogbookError::Validation { record: Some(9), .. });
    }

    #[test]
    fn splits_arrays_and_ndjson() {
        assert_eq!(split_records(b"  [{\"a\":1}, {\"b\":2}]").unwrap().len(), 2);
        assert_eq!(split_records(b"{\"a\":1}\n{\"b\":2}\n\n{\"c\":3}\n").unwrap().len(), 3);
        assert_matches!(split_records(b"{\"a\":1}\n{oops"), Err(LogbookError::Parse { .. }));
    }
}
