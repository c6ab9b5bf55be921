//! The normalized record shape every importer produces and the default
//! importer consumes. Field names match the serialized [`LogEntry`], so an
//! export from this system can be fed straight back in.
//!
//! [`LogEntry`]: crate::models::LogEntry

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LogbookError, Result};
use crate::models::{DepthUnit, PressureUnit, TemperatureUnit, WeightUnit};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    pub timing: Option<TimingDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depths: Option<DepthsDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionsDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equipment: Option<EquipmentDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub air: Option<Vec<AirDocument>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingDocument {
    /// Local wall-clock time, or an RFC 3339 instant.
    pub entry_time: Option<String>,
    /// Takes precedence over `entry_time` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_entry_time: Option<String>,
    pub timezone: Option<String>,
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottom_time: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthsDocument {
    pub max_depth: Option<f64>,
    pub average_depth: Option<f64>,
    pub depth_unit: Option<DepthUnit>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsDocument {
    pub air_temperature: Option<f64>,
    pub surface_temperature: Option<f64>,
    pub bottom_temperature: Option<f64>,
    pub temperature_unit: Option<TemperatureUnit>,
    pub weather: Option<String>,
    pub current: Option<String>,
    pub chop: Option<String>,
    pub visibility: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentDocument {
    pub weight: Option<f64>,
    pub weight_unit: Option<WeightUnit>,
    pub weight_correctness: Option<String>,
    pub trim_correctness: Option<String>,
    pub items: Option<Vec<String>>,
    pub comments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirDocument {
    pub tank_name: Option<String>,
    pub tank_volume: Option<f64>,
    pub working_pressure: Option<f64>,
    pub count: Option<u32>,
    pub start_pressure: Option<f64>,
    pub end_pressure: Option<f64>,
    pub pressure_unit: Option<PressureUnit>,
    pub o2_percent: Option<f64>,
    pub he_percent: Option<f64>,
}

impl RecordDocument {
    /// Parses one payload, attributing type errors to the top-level field
    /// they occurred in. Unknown fields are ignored.
    pub fn from_json(index: usize, payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload).map_err(|e| LogbookError::Validation {
            record: Some(index),
            field: None,
            message: format!("not valid JSON: {e}"),
        })?;
        let Value::Object(map) = value else {
            return Err(LogbookError::Validation {
                record: Some(index),
                field: None,
                message: "record must be a JSON object".to_string(),
            });
        };

        Ok(Self {
            log_number: field(index, &map, "logNumber")?,
            site: field(index, &map, "site")?,
            operator: field(index, &map, "operator")?,
            timing: field(index, &map, "timing")?,
            depths: field(index, &map, "depths")?,
            conditions: field(index, &map, "conditions")?,
            equipment: field(index, &map, "equipment")?,
            air: field(index, &map, "air")?,
            notes: field(index, &map, "notes")?,
            tags: field(index, &map, "tags")?,
        })
    }
}

fn field<T: DeserializeOwned>(
    index: usize,
    map: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => T::deserialize(value)
            .map(Some)
            .map_err(|e| LogbookError::validation(Some(index), key, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn reads_known_fields_and_ignores_the_rest() {
        let doc = RecordDocument::from_json(
            0,
            r#"{"id": "log_x", "logNumber": 7, "timing": {"entryTime": "2024-03-01T10:15:00", "timezone": "Pacific/Guam", "duration": 42}, "tags": ["reef"], "notes": null}"#,
        )
        .unwrap();
        assert_eq!(doc.log_number, Some(7));
        assert_eq!(doc.timing.unwrap().duration, Some(42.0));
        assert_eq!(doc.tags, Some(vec!["reef".to_string()]));
        assert_eq!(doc.notes, None);
    }

    #[test]
    fn attributes_type_errors_to_the_field() {
        let err = RecordDocument::from_json(4, r#"{"logNumber": "seven"}"#).unwrap_err();
        assert_matches!(
            err,
            LogbookError::Validation { record: Some(4), field: Some(f), .. } if f == "logNumber"
        );

        let err = RecordDocument::from_json(1, "[1, 2]").unwrap_err();
        assert_matches!(err, LogbookError::Validation { record: Some(1), field: None, .. });

        let err = RecordDocument::from_json(2, "{not json").unwrap_err();
        assert_matches!(err, LogbookError::Validation { record: Some(2), .. });
    }
}
