//! Subsurface XML divelogs (`.ssrf` / `.xml`).
//!
//! Subsurface stores local dive times without a zone, so the importer applies
//! a configured zone to every dive in the file.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::record::{
    AirDocument, ConditionsDocument, DepthsDocument, EquipmentDocument, RecordDocument,
    TimingDocument,
};
use super::session::ImportSessionManager;
use super::units;
use super::{FileImporter, ImportFormat};
use crate::error::{LogbookError, Result};
use crate::models::{
    DepthUnit, ImportSession, ImportSessionMetadata, PressureUnit, TemperatureUnit, UserId,
    WeightUnit,
};
use crate::storage::{LogEntryRepository, SessionRepository};

const KG_PER_LB: f64 = 0.453_592_37;

#[derive(Debug, Default, Deserialize)]
pub struct SubsurfaceDocument {
    #[serde(rename = "@program")]
    pub program: Option<String>,
    #[serde(rename = "@version")]
    pub version: Option<String>,
    pub dives: Option<XmlDives>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlDives {
    #[serde(default)]
    pub dive: Vec<XmlDive>,
    #[serde(default)]
    pub trip: Vec<XmlTrip>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlTrip {
    #[serde(rename = "@location")]
    pub location: Option<String>,
    #[serde(default)]
    pub dive: Vec<XmlDive>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlDive {
    #[serde(rename = "@number")]
    pub number: Option<String>,
    #[serde(rename = "@date")]
    pub date: Option<String>,
    #[serde(rename = "@time")]
    pub time: Option<String>,
    #[serde(rename = "@duration")]
    pub duration: Option<String>,
    #[serde(rename = "@tags")]
    pub tags: Option<String>,
    #[serde(rename = "@divesiteid")]
    pub dive_site: Option<String>,
    /// Star rating, 0 to 5.
    #[serde(rename = "@visibility")]
    pub visibility: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub cylinder: Vec<XmlCylinder>,
    #[serde(default)]
    pub weightsystem: Vec<XmlWeight>,
    #[serde(default)]
    pub divecomputer: Vec<XmlDiveComputer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlCylinder {
    #[serde(rename = "@size")]
    pub size: Option<String>,
    #[serde(rename = "@workpressure")]
    pub work_pressure: Option<String>,
    #[serde(rename = "@description")]
    pub description: Option<String>,
    #[serde(rename = "@o2")]
    pub o2: Option<String>,
    #[serde(rename = "@he")]
    pub he: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<String>,
    #[serde(rename = "@end")]
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlWeight {
    #[serde(rename = "@weight")]
    pub weight: Option<String>,
    #[serde(rename = "@description")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlDiveComputer {
    #[serde(rename = "@model")]
    pub model: Option<String>,
    pub depth: Option<XmlDepth>,
    pub temperature: Option<XmlTemperature>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlDepth {
    #[serde(rename = "@max")]
    pub max: Option<String>,
    #[serde(rename = "@mean")]
    pub mean: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlTemperature {
    #[serde(rename = "@air")]
    pub air: Option<String>,
    #[serde(rename = "@water")]
    pub water: Option<String>,
}

fn parse_error(message: impl Into<String>) -> LogbookError {
    LogbookError::Parse {
        format: "subsurface",
        message: message.into(),
    }
}

impl SubsurfaceDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| parse_error(e.to_string()))?;
        quick_xml::de::from_str(text).map_err(|e| parse_error(e.to_string()))
    }

    /// Top-level dives first, then the dives of each trip, in document order.
    pub fn dives(&self) -> impl Iterator<Item = &XmlDive> {
        self.dives.iter().flat_map(|dives| {
            dives
                .dive
                .iter()
                .chain(dives.trip.iter().flat_map(|trip| trip.dive.iter()))
        })
    }

    pub fn dive_count(&self) -> usize {
        self.dives().count()
    }

    /// Converts every dive, attributing failures to the dive's position.
    pub fn records(&self, timezone: Tz) -> impl Iterator<Item = Result<RecordDocument>> + '_ {
        self.dives()
            .enumerate()
            .map(move |(index, dive)| dive.to_record(index, timezone))
    }
}

impl XmlDive {
    fn to_record(&self, index: usize, timezone: Tz) -> Result<RecordDocument> {
        let fail =
            |field: &str, message: String| LogbookError::validation(Some(index), field, message);

        let log_number = match self.number.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => return Err(fail("number", format!("'{raw}' is not a dive number"))),
            },
        };

        let entry_time = self.date.as_deref().map(|date| {
            let time = self.time.as_deref().unwrap_or("00:00:00");
            format!("{}T{}", date.trim(), time.trim())
        });
        let duration = self
            .duration
            .as_deref()
            .map(units::duration_minutes)
            .transpose()
            .map_err(|e| fail("duration", e))?;

        let visibility = self
            .visibility
            .as_deref()
            .map(|raw| {
                raw.trim()
                    .parse::<u8>()
                    .map(|stars| stars.saturating_mul(2).min(10))
                    .map_err(|_| fail("visibility", format!("'{raw}' is not a rating")))
            })
            .transpose()?;

        let computer = self.divecomputer.first();
        let depths = computer
            .and_then(|dc| dc.depth.as_ref())
            .map(|depth| depths(depth).map_err(|e| fail("divecomputer.depth", e)))
            .transpose()?;
        let mut conditions = computer
            .and_then(|dc| dc.temperature.as_ref())
            .map(|t| temperatures(t).map_err(|e| fail("divecomputer.temperature", e)))
            .transpose()?
            .unwrap_or_default();
        conditions.visibility = visibility;

        let air = self
            .cylinder
            .iter()
            .enumerate()
            .map(|(i, cylinder)| {
                cylinder
                    .to_air()
                    .map_err(|e| fail(&format!("cylinder[{i}]"), e))
            })
            .collect::<Result<Vec<_>>>()?;
        let equipment = weights(&self.weightsystem).map_err(|e| fail("weightsystem", e))?;

        let tags: Vec<String> = self
            .tags
            .as_deref()
            .map(|raw| raw.split(',').map(|t| t.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(RecordDocument {
            log_number,
            site: self.dive_site.clone(),
            operator: None,
            timing: Some(TimingDocument {
                entry_time,
                local_entry_time: None,
                timezone: Some(timezone.name().to_string()),
                duration,
                bottom_time: None,
            }),
            depths,
            conditions: Some(conditions),
            equipment,
            air: (!air.is_empty()).then_some(air),
            notes: self.notes.clone(),
            tags: (!tags.is_empty()).then_some(tags),
        })
    }
}

impl XmlCylinder {
    fn to_air(&self) -> std::result::Result<AirDocument, String> {
        let work_pressure = self.work_pressure.as_deref().map(units::pressure).transpose()?;
        let start = self.start.as_deref().map(units::pressure).transpose()?;
        let end = self.end.as_deref().map(units::pressure).transpose()?;

        let pressure_unit = start.or(end).or(work_pressure).map(|(_, unit)| unit);
        let in_unit = |reading: Option<(f64, PressureUnit)>| match (reading, pressure_unit) {
            (Some((_, unit)), Some(expected)) if unit != expected => {
                Err(format!("mixed pressure units {unit} and {expected}"))
            }
            (reading, _) => Ok(reading.map(|(value, _)| value)),
        };

        Ok(AirDocument {
            tank_name: self.description.clone(),
            tank_volume: self.size.as_deref().map(units::volume).transpose()?,
            working_pressure: in_unit(work_pressure)?,
            count: Some(1),
            start_pressure: in_unit(start)?,
            end_pressure: in_unit(end)?,
            pressure_unit,
            o2_percent: self.o2.as_deref().map(units::percent).transpose()?,
            he_percent: self.he.as_deref().map(units::percent).transpose()?,
        })
    }
}

fn depths(depth: &XmlDepth) -> std::result::Result<DepthsDocument, String> {
    let max = depth.max.as_deref().map(units::depth).transpose()?;
    let mean = depth.mean.as_deref().map(units::depth).transpose()?;
    let unit = max.or(mean).map(|(_, unit)| unit).unwrap_or_default();
    let in_unit =
        |reading: Option<(f64, DepthUnit)>| reading.map(|(value, from)| unit.convert(value, from));
    Ok(DepthsDocument {
        max_depth: in_unit(max),
        average_depth: in_unit(mean),
        depth_unit: Some(unit),
    })
}

fn to_temperature_unit(value: f64, from: TemperatureUnit, to: TemperatureUnit) -> f64 {
    match (from, to) {
        (TemperatureUnit::Celsius, TemperatureUnit::Fahrenheit) => value * 9.0 / 5.0 + 32.0,
        (TemperatureUnit::Fahrenheit, TemperatureUnit::Celsius) => (value - 32.0) * 5.0 / 9.0,
        _ => value,
    }
}

fn temperatures(temperature: &XmlTemperature) -> std::result::Result<ConditionsDocument, String> {
    let water = temperature.water.as_deref().map(units::temperature).transpose()?;
    let air = temperature.air.as_deref().map(units::temperature).transpose()?;
    let unit = water.or(air).map(|(_, unit)| unit);
    let in_unit = |reading: Option<(f64, TemperatureUnit)>| {
        reading.zip(unit).map(|((value, from), to)| to_temperature_unit(value, from, to))
    };
    Ok(ConditionsDocument {
        air_temperature: in_unit(air),
        bottom_temperature: in_unit(water),
        temperature_unit: unit,
        ..Default::default()
    })
}

fn weights(systems: &[XmlWeight]) -> std::result::Result<Option<EquipmentDocument>, String> {
    if systems.is_empty() {
        return Ok(None);
    }
    let mut total: Option<(f64, WeightUnit)> = None;
    let mut items = Vec::new();
    for system in systems {
        if let Some(raw) = system.weight.as_deref() {
            let (value, unit) = match units::quantity(raw)? {
                (value, None | Some("kg")) => (value, WeightUnit::Kilograms),
                (value, Some("lbs" | "lb")) => (value, WeightUnit::Pounds),
                (_, Some(other)) => return Err(format!("unknown weight unit '{other}'")),
            };
            total = Some(match total {
                None => (value, unit),
                Some((sum, WeightUnit::Kilograms)) if unit == WeightUnit::Pounds => {
                    (sum + value * KG_PER_LB, WeightUnit::Kilograms)
                }
                Some((sum, WeightUnit::Pounds)) if unit == WeightUnit::Kilograms => {
                    (sum + value / KG_PER_LB, WeightUnit::Pounds)
                }
                Some((sum, unit)) => (sum + value, unit),
            });
        }
        if let Some(description) = &system.description {
            items.push(description.clone());
        }
    }
    Ok(Some(EquipmentDocument {
        weight: total.map(|(sum, _)| sum),
        weight_unit: total.map(|(_, unit)| unit),
        items: (!items.is_empty()).then_some(items),
        ..Default::default()
    }))
}

/// Converts a Subsurface divelog into a populated import session.
pub struct SubsurfaceImporter<S> {
    sessions: Arc<ImportSessionManager<S>>,
    timezone: Tz,
}

impl<S> SubsurfaceImporter<S> {
    /// Uses the pipeline's default timezone.
    pub fn new(sessions: Arc<ImportSessionManager<S>>) -> Self {
        let timezone = sessions
            .config()
            .default_timezone
            .parse()
            .unwrap_or(Tz::UTC);
        Self { sessions, timezone }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

#[async_trait]
impl<S> FileImporter for SubsurfaceImporter<S>
where
    S: SessionRepository + LogEntryRepository + 'static,
{
    fn format(&self) -> ImportFormat {
        ImportFormat::Subsurface
    }

    #[instrument(skip(self, bytes, owner), fields(owner = %owner, bytes = bytes.len()))]
    async fn parse_file(&self, bytes: &[u8], owner: &UserId) -> Result<ImportSession> {
        let document = SubsurfaceDocument::parse(bytes)?;
        let dives = document.dive_count();
        if dives == 0 {
            return Err(parse_error("divelog contains no dives"));
        }
        debug!(dives, program = ?document.program, "subsurface divelog parsed");

        let metadata = ImportSessionMetadata {
            device: document.program.clone(),
            device_id: document.version.clone(),
            bookmark: None,
        };
        // Dives are converted as the session pulls them, so conversion stops at
        // the first malformed dive.
        let payloads = document.records(self.timezone).map(|record| {
            record.and_then(|r| serde_json::to_string(&r).map_err(LogbookError::from))
        });
        self.sessions.import_records(owner, metadata, payloads).await
    }
}
