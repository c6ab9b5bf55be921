use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(UserId, "usr");
string_id!(ImportSessionId, "imp");
string_id!(LogEntryId, "log");
string_id!(SiteId, "site");
string_id!(OperatorId, "op");

macro_rules! unit_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown unit '{other}'")),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

unit_enum!(DepthUnit { Meters => "m", Feet => "ft" });
unit_enum!(TemperatureUnit { Celsius => "C", Fahrenheit => "F" });
unit_enum!(PressureUnit { Bar => "bar", Psi => "psi" });
unit_enum!(WeightUnit { Kilograms => "kg", Pounds => "lbs" });

impl Default for DepthUnit {
    fn default() -> Self {
        DepthUnit::Meters
    }
}

pub(crate) const FEET_PER_METER: f64 = 3.280_84;

impl DepthUnit {
    /// Converts a depth expressed in `from` into this unit.
    pub fn convert(self, value: f64, from: DepthUnit) -> f64 {
        match (from, self) {
            (DepthUnit::Meters, DepthUnit::Feet) => value * FEET_PER_METER,
            (DepthUnit::Feet, DepthUnit::Meters) => value / FEET_PER_METER,
            _ => value,
        }
    }
}

/// Provenance strings attached to an import session by the uploading tool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSessionMetadata {
    pub device: Option<String>,
    pub device_id: Option<String>,
    pub bookmark: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSession {
    pub id: ImportSessionId,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub finalized: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metadata: ImportSessionMetadata,
    /// Set once the session has been discarded; the backing row no longer exists.
    #[serde(skip)]
    pub canceled: bool,
}

impl ImportSession {
    pub fn new(owner: UserId, metadata: ImportSessionMetadata) -> Self {
        Self {
            id: ImportSessionId::generate(),
            owner,
            created_at: Utc::now(),
            finalized: None,
            metadata,
            canceled: false,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn is_open(&self) -> bool {
        !self.is_finalized() && !self.canceled
    }

    pub fn is_cancelable(&self) -> bool {
        self.is_open()
    }
}

/// One opaque candidate record waiting inside an import session.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedRecord {
    pub session_id: ImportSessionId,
    pub sequence: i64,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    /// Absolute instant used for storage and sorting.
    pub entry_time: DateTime<Utc>,
    /// Wall-clock time at the dive site, as entered.
    pub local_entry_time: NaiveDateTime,
    /// IANA zone name the local time was recorded in.
    pub timezone: String,
    /// Minutes.
    pub duration: f64,
    pub bottom_time: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Depths {
    pub max_depth: Option<f64>,
    pub average_depth: Option<f64>,
    pub depth_unit: DepthUnit,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    pub air_temperature: Option<f64>,
    pub surface_temperature: Option<f64>,
    pub bottom_temperature: Option<f64>,
    pub temperature_unit: Option<TemperatureUnit>,
    pub weather: Option<String>,
    pub current: Option<String>,
    pub chop: Option<String>,
    /// 0 (none) to 10 (unlimited).
    pub visibility: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentUsage {
    pub weight: Option<f64>,
    pub weight_unit: Option<WeightUnit>,
    pub weight_correctness: Option<String>,
    pub trim_correctness: Option<String>,
    pub items: Vec<String>,
    pub comments: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirUsage {
    /// Position in the submitted list; preserves input order.
    pub ordinal: u32,
    pub tank_name: Option<String>,
    pub tank_volume: Option<f64>,
    pub working_pressure: Option<f64>,
    pub count: u32,
    pub start_pressure: Option<f64>,
    pub end_pressure: Option<f64>,
    pub pressure_unit: PressureUnit,
    pub o2_percent: Option<f64>,
    pub he_percent: Option<f64>,
}

/// Normalized dive record produced by an importer, not yet persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewLogEntry {
    pub log_number: Option<u32>,
    pub site: Option<SiteId>,
    pub operator: Option<OperatorId>,
    pub timing: Timing,
    pub depths: Depths,
    pub conditions: Conditions,
    pub equipment: EquipmentUsage,
    pub air: Vec<AirUsage>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: LogEntryId,
    pub owner: UserId,
    pub log_number: Option<u32>,
    pub site: Option<SiteId>,
    pub operator: Option<OperatorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_session: Option<ImportSessionId>,
    pub timing: Timing,
    pub depths: Depths,
    pub conditions: Conditions,
    pub equipment: EquipmentUsage,
    pub air: Vec<AirUsage>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl LogEntry {
    pub fn from_new(
        owner: UserId,
        import_session: Option<ImportSessionId>,
        entry: NewLogEntry,
    ) -> Self {
        Self {
            id: LogEntryId::generate(),
            owner,
            log_number: entry.log_number,
            site: entry.site,
            operator: entry.operator,
            import_session,
            timing: entry.timing,
            depths: entry.depths,
            conditions: entry.conditions,
            equipment: entry.equipment,
            air: entry.air,
            notes: entry.notes,
            tags: entry.tags,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Seconds from dive start. Unique within a log entry.
    pub time_offset: u32,
    pub depth: Option<f64>,
    pub depth_unit: Option<DepthUnit>,
    pub temperature: Option<f64>,
    pub temperature_unit: Option<TemperatureUnit>,
    pub gps: Option<GpsPoint>,
}

impl Sample {
    pub fn at(time_offset: u32) -> Self {
        Self {
            time_offset,
            depth: None,
            depth_unit: None,
            temperature: None,
            temperature_unit: None,
            gps: None,
        }
    }

    pub fn with_depth(mut self, depth: f64, unit: DepthUnit) -> Self {
        self.depth = Some(depth);
        self.depth_unit = Some(unit);
        self
    }

    pub fn with_temperature(mut self, temperature: f64, unit: TemperatureUnit) -> Self {
        self.temperature = Some(temperature);
        self.temperature_unit = Some(unit);
        self
    }
}
