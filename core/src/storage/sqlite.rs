//! `SQLite` implementation of the repository traits.
//!
//! One connection behind a mutex. Every method does its SQL synchronously and
//! releases the lock before returning, so no guard is ever held across an
//! await point.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    AppendOutcome, DepthAggregate, LogEntryQuery, LogEntryRepository, SampleRepository,
    SessionRepository, SortDirection, SortField,
};
use crate::error::{LogbookError, Result};
use crate::migrations::ensure_schema;
use crate::models::{
    AirUsage, BufferedRecord, DepthUnit, Depths, GpsPoint, ImportSession, ImportSessionId,
    ImportSessionMetadata, LogEntry, LogEntryId, OperatorId, PressureUnit, Sample, SiteId,
    TemperatureUnit, Timing, UserId, FEET_PER_METER,
};

macro_rules! text_column {
    ($($ty:ty),+) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    value
                        .as_str()?
                        .parse()
                        .map_err(|e: String| FromSqlError::Other(e.into()))
                }
            }
        )+
    };
}

macro_rules! id_column {
    ($($ty:ident),+) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    Ok($ty(value.as_str()?.to_string()))
                }
            }
        )+
    };
}

text_column!(DepthUnit, TemperatureUnit, PressureUnit);
id_column!(UserId, ImportSessionId, LogEntryId, SiteId, OperatorId);

const SESSION_COLUMNS: &str = "id, owner_id, created_at, finalized, device, device_id, bookmark";

const LOG_ENTRY_COLUMNS: &str = "id, owner_id, log_number, site_id, operator_id, import_session_id, \
     entry_time, entry_time_local, timezone, duration, bottom_time, \
     max_depth, average_depth, depth_unit, conditions, equipment, notes, tags, created_at, updated_at";

const SAMPLE_COLUMNS: &str =
    "time_offset, depth, depth_unit, temperature, temperature_unit, gps_lat, gps_lon";

/// Pipeline storage backed by a single `SQLite` connection.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        ensure_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code == SQLITE_CONSTRAINT_UNIQUE,
        _ => false,
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ─────────────────────────────────────────────────────────────────────────────
// Import sessions
// ─────────────────────────────────────────────────────────────────────────────

fn map_session(row: &Row<'_>) -> rusqlite::Result<ImportSession> {
    Ok(ImportSession {
        id: row.get(0)?,
        owner: row.get(1)?,
        created_at: row.get(2)?,
        finalized: row.get(3)?,
        metadata: ImportSessionMetadata {
            device: row.get(4)?,
            device_id: row.get(5)?,
            bookmark: row.get(6)?,
        },
        canceled: false,
    })
}

#[async_trait]
impl SessionRepository for SqliteStorage {
    async fn insert_session(&self, session: &ImportSession) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO import_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                session.id,
                session.owner,
                session.created_at,
                session.finalized,
                session.metadata.device,
                session.metadata.device_id,
                session.metadata.bookmark,
            ],
        )?;
        Ok(())
    }

    async fn get_session(
        &self,
        owner: &UserId,
        id: &ImportSessionId,
    ) -> Result<Option<ImportSession>> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM import_sessions WHERE id = ?1 AND owner_id = ?2"),
                params![id, owner],
                map_session,
            )
            .optional()?;
        Ok(session)
    }

    async fn append_records(
        &self,
        id: &ImportSessionId,
        payloads: &[String],
    ) -> Result<AppendOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let finalized: Option<Option<DateTime<Utc>>> = tx
            .query_row(
                "SELECT finalized FROM import_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match finalized {
            None => return Ok(AppendOutcome::Missing),
            Some(Some(_)) => return Ok(AppendOutcome::Closed),
            Some(None) => {}
        }

        let last: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), -1) FROM import_records WHERE session_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO import_records (session_id, sequence, payload) VALUES (?1, ?2, ?3)",
            )?;
            for (offset, payload) in payloads.iter().enumerate() {
                stmt.execute(params![id, last + 1 + to_i64(offset), payload])?;
            }
        }
        tx.commit()?;
        Ok(AppendOutcome::Appended(payloads.len()))
    }

    async fn count_records(&self, id: &ImportSessionId) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM import_records WHERE session_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_records(
        &self,
        id: &ImportSessionId,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BufferedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, sequence, payload FROM import_records
             WHERE session_id = ?1 AND sequence > ?2 ORDER BY sequence ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![id, after.unwrap_or(-1), to_i64(limit)], |row| {
                Ok(BufferedRecord {
                    session_id: row.get(0)?,
                    sequence: row.get(1)?,
                    payload: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_records(&self, id: &ImportSessionId) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM import_records WHERE session_id = ?1",
            params![id],
        )?;
        Ok(to_u64(changed))
    }

    async fn mark_finalized(&self, id: &ImportSessionId, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE import_sessions SET finalized = ?2 WHERE id = ?1 AND finalized IS NULL",
            params![id, at],
        )?;
        Ok(changed == 1)
    }

    async fn delete_open_session(&self, id: &ImportSessionId) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM import_sessions WHERE id = ?1 AND finalized IS NULL",
            params![id],
        )?;
        Ok(changed == 1)
    }

    async fn delete_session(&self, id: &ImportSessionId) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM import_sessions WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log entries
// ─────────────────────────────────────────────────────────────────────────────

fn map_log_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        owner: row.get(1)?,
        log_number: row.get(2)?,
        site: row.get(3)?,
        operator: row.get(4)?,
        import_session: row.get(5)?,
        timing: Timing {
            entry_time: row.get(6)?,
            local_entry_time: row.get(7)?,
            timezone: row.get(8)?,
            duration: row.get(9)?,
            bottom_time: row.get(10)?,
        },
        depths: Depths {
            max_depth: row.get(11)?,
            average_depth: row.get(12)?,
            depth_unit: row.get(13)?,
        },
        conditions: json_column(row, 14)?,
        equipment: json_column(row, 15)?,
        air: Vec::new(),
        notes: row.get(16)?,
        tags: json_column(row, 17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn load_air(conn: &Connection, entry: &LogEntryId) -> Result<Vec<AirUsage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ordinal, tank_name, tank_volume, working_pressure, count, start_pressure,
                end_pressure, pressure_unit, o2_percent, he_percent
         FROM log_entry_air WHERE log_entry_id = ?1 ORDER BY ordinal ASC",
    )?;
    let rows = stmt
        .query_map(params![entry], |row| {
            Ok(AirUsage {
                ordinal: row.get(0)?,
                tank_name: row.get(1)?,
                tank_volume: row.get(2)?,
                working_pressure: row.get(3)?,
                count: row.get(4)?,
                start_pressure: row.get(5)?,
                end_pressure: row.get(6)?,
                pressure_unit: row.get(7)?,
                o2_percent: row.get(8)?,
                he_percent: row.get(9)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn with_air(conn: &Connection, mut entries: Vec<LogEntry>) -> Result<Vec<LogEntry>> {
    for entry in &mut entries {
        entry.air = load_air(conn, &entry.id)?;
    }
    Ok(entries)
}

#[async_trait]
impl LogEntryRepository for SqliteStorage {
    async fn insert_log_entry(&self, entry: &LogEntry) -> Result<()> {
        let conditions = serde_json::to_string(&entry.conditions)?;
        let equipment = serde_json::to_string(&entry.equipment)?;
        let tags = serde_json::to_string(&entry.tags)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO log_entries ({LOG_ENTRY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                entry.id,
                entry.owner,
                entry.log_number,
                entry.site,
                entry.operator,
                entry.import_session,
                entry.timing.entry_time,
                entry.timing.local_entry_time,
                entry.timing.timezone,
                entry.timing.duration,
                entry.timing.bottom_time,
                entry.depths.max_depth,
                entry.depths.average_depth,
                entry.depths.depth_unit,
                conditions,
                equipment,
                entry.notes,
                tags,
                entry.created_at,
                entry.updated_at,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO log_entry_air (log_entry_id, ordinal, tank_name, tank_volume, working_pressure,
                    count, start_pressure, end_pressure, pressure_unit, o2_percent, he_percent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for air in &entry.air {
                stmt.execute(params![
                    entry.id,
                    air.ordinal,
                    air.tank_name,
                    air.tank_volume,
                    air.working_pressure,
                    air.count,
                    air.start_pressure,
                    air.end_pressure,
                    air.pressure_unit,
                    air.o2_percent,
                    air.he_percent,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_log_entry(&self, id: &LogEntryId) -> Result<Option<LogEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!("SELECT {LOG_ENTRY_COLUMNS} FROM log_entries WHERE id = ?1"),
                params![id],
                map_log_entry,
            )
            .optional()?;
        match entry {
            Some(mut entry) => {
                entry.air = load_air(&conn, &entry.id)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn list_log_entries(
        &self,
        query: &LogEntryQuery,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut sql = format!("SELECT {LOG_ENTRY_COLUMNS} FROM log_entries WHERE owner_id = ?");
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(query.owner.clone())];

        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            sql.push_str(" AND notes LIKE ? ESCAPE '\\'");
            values.push(Box::new(format!("%{}%", escape_like(text.trim()))));
        }
        if let Some(from) = query.entry_time_from {
            sql.push_str(" AND entry_time >= ?");
            values.push(Box::new(from));
        }
        if let Some(to) = query.entry_time_to {
            sql.push_str(" AND entry_time <= ?");
            values.push(Box::new(to));
        }
        if let Some(tag) = &query.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(log_entries.tags) WHERE json_each.value = ?)");
            values.push(Box::new(tag.clone()));
        }

        let column = match query.sort {
            SortField::EntryTime => "entry_time",
            SortField::LogNumber => "log_number",
        };
        let direction = match query.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY {column} {direction}, id {direction} LIMIT ? OFFSET ?"
        ));
        values.push(Box::new(to_i64(limit)));
        values.push(Box::new(to_i64(skip)));

        let conn = self.conn.lock();
        let entries = {
            let mut stmt = conn.prepare(&sql)?;
            let params = params_from_iter(values.iter().map(|v| &**v));
            let rows = stmt
                .query_map(params, map_log_entry)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        debug!(owner = %query.owner, skip, limit, fetched = entries.len(), "listed log entries");
        with_air(&conn, entries)
    }

    async fn delete_log_entries_by_session(&self, session: &ImportSessionId) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM log_entries WHERE import_session_id = ?1",
            params![session],
        )?;
        Ok(to_u64(changed))
    }

    async fn max_log_number(&self, owner: &UserId) -> Result<Option<u32>> {
        let conn = self.conn.lock();
        let max: Option<u32> = conn.query_row(
            "SELECT MAX(log_number) FROM log_entries WHERE owner_id = ?1",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    async fn update_depths(
        &self,
        id: &LogEntryId,
        max_depth: Option<f64>,
        average_depth: Option<f64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE log_entries SET max_depth = ?2, average_depth = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, max_depth, average_depth, Utc::now()],
        )?;
        Ok(changed == 1)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Samples
// ─────────────────────────────────────────────────────────────────────────────

fn map_sample(row: &Row<'_>) -> rusqlite::Result<Sample> {
    let lat: Option<f64> = row.get(5)?;
    let lon: Option<f64> = row.get(6)?;
    Ok(Sample {
        time_offset: row.get(0)?,
        depth: row.get(1)?,
        depth_unit: row.get(2)?,
        temperature: row.get(3)?,
        temperature_unit: row.get(4)?,
        gps: lat.zip(lon).map(|(lat, lon)| GpsPoint { lat, lon }),
    })
}

fn collisions(conn: &Connection, entry: &LogEntryId, offsets: &[u32]) -> Result<Vec<u32>> {
    let offsets = serde_json::to_string(offsets)?;
    let mut stmt = conn.prepare_cached(
        "SELECT time_offset FROM samples
         WHERE log_entry_id = ?1 AND time_offset IN (SELECT value FROM json_each(?2))
         ORDER BY time_offset ASC",
    )?;
    let rows = stmt
        .query_map(params![entry, offsets], |row| row.get(0))?
        .collect::<std::result::Result<Vec<u32>, _>>()?;
    Ok(rows)
}

fn insert_batch(
    conn: &mut Connection,
    entry: &LogEntryId,
    samples: &[Sample],
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO samples (log_entry_id, {SAMPLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ))?;
        for sample in samples {
            stmt.execute(params![
                entry,
                sample.time_offset,
                sample.depth,
                sample.depth_unit,
                sample.temperature,
                sample.temperature_unit,
                sample.gps.map(|p| p.lat),
                sample.gps.map(|p| p.lon),
            ])?;
        }
    }
    tx.commit()
}

#[async_trait]
impl SampleRepository for SqliteStorage {
    async fn find_sample_collisions(
        &self,
        entry: &LogEntryId,
        offsets: &[u32],
    ) -> Result<Vec<u32>> {
        let conn = self.conn.lock();
        collisions(&conn, entry, offsets)
    }

    async fn insert_samples(&self, entry: &LogEntryId, samples: &[Sample]) -> Result<()> {
        let mut conn = self.conn.lock();
        match insert_batch(&mut conn, entry, samples) {
            Ok(()) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                // A concurrent writer got there first; report what now collides.
                let offsets: Vec<u32> = samples.iter().map(|s| s.time_offset).collect();
                let mut colliding = collisions(&conn, entry, &offsets)?;
                if colliding.is_empty() {
                    colliding = crate::samples::duplicate_offsets(samples);
                }
                Err(LogbookError::Conflict {
                    log_entry: entry.clone(),
                    time_offsets: colliding,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_samples(
        &self,
        entry: &LogEntryId,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Sample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE log_entry_id = ?1
             ORDER BY time_offset ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(params![entry, to_i64(limit), to_i64(skip)], map_sample)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn delete_samples(&self, entry: &LogEntryId) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM samples WHERE log_entry_id = ?1", params![entry])?;
        Ok(to_u64(changed))
    }

    async fn aggregate_depths(
        &self,
        entry: &LogEntryId,
        unit: DepthUnit,
    ) -> Result<DepthAggregate> {
        let conn = self.conn.lock();
        let aggregate = conn.query_row(
            "SELECT MAX(d), AVG(d), COUNT(d), COUNT(*) FROM (
                SELECT CASE
                    WHEN depth IS NULL THEN NULL
                    WHEN depth_unit IS NULL OR depth_unit = ?2 THEN depth
                    WHEN ?2 = 'ft' THEN depth * ?3
                    ELSE depth / ?3
                END AS d
                FROM samples WHERE log_entry_id = ?1
            )",
            params![entry, unit, FEET_PER_METER],
            |row| {
                let with_depth: i64 = row.get(2)?;
                let stored: i64 = row.get(3)?;
                Ok(DepthAggregate {
                    max_depth: row.get(0)?,
                    average_depth: row.get(1)?,
                    sample_count: u64::try_from(with_depth).unwrap_or(0),
                    stored_samples: u64::try_from(stored).unwrap_or(0),
                })
            },
        )?;
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::models::{Conditions, EquipmentUsage, NewLogEntry};

    fn new_entry(owner: &UserId, session: Option<&ImportSessionId>, hour: u32) -> LogEntry {
        let local = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        LogEntry::from_new(
            owner.clone(),
            session.cloned(),
            NewLogEntry {
                log_number: Some(hour),
                site: None,
                operator: None,
                timing: Timing {
                    entry_time: local.and_utc(),
                    local_entry_time: local,
                    timezone: "Etc/UTC".into(),
                    duration: 45.0,
                    bottom_time: None,
                },
                depths: Depths::default(),
                conditions: Conditions::default(),
                equipment: EquipmentUsage::default(),
                air: vec![AirUsage {
                    ordinal: 0,
                    tank_name: Some("AL80".into()),
                    tank_volume: Some(11.1),
                    working_pressure: Some(207.0),
                    count: 1,
                    start_pressure: Some(200.0),
                    end_pressure: Some(50.0),
                    pressure_unit: PressureUnit::Bar,
                    o2_percent: Some(32.0),
                    he_percent: None,
                }],
                notes: Some("Wall dive".into()),
                tags: vec!["reef".into()],
            },
        )
    }

    #[tokio::test]
    async fn log_entry_round_trips_with_air() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::from("u1");
        let entry = new_entry(&owner, None, 9);
        store.insert_log_entry(&entry).await.unwrap();

        let loaded = store.get_log_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(loaded.air, entry.air);
        assert_eq!(loaded.timing, entry.timing);
        assert_eq!(loaded.tags, vec!["reef".to_string()]);
        assert_eq!(store.max_log_number(&owner).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn list_filters_by_tag_and_text() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::from("u1");
        for hour in 8..12 {
            let mut entry = new_entry(&owner, None, hour);
            if hour % 2 == 0 {
                entry.tags = vec!["wreck".into()];
                entry.notes = Some("100% visibility".into());
            }
            store.insert_log_entry(&entry).await.unwrap();
        }

        let mut query = LogEntryQuery::for_owner(owner.clone());
        query.tag = Some("wreck".into());
        let wrecks = store.list_log_entries(&query, 0, 10).await.unwrap();
        assert_eq!(wrecks.len(), 2);

        let mut query = LogEntryQuery::for_owner(owner.clone());
        query.text = Some("100%".into());
        query.direction = SortDirection::Ascending;
        let matched = store.list_log_entries(&query, 0, 10).await.unwrap();
        assert_eq!(
            matched.iter().map(|e| e.log_number).collect::<Vec<_>>(),
            vec![Some(8), Some(10)]
        );

        let other = LogEntryQuery::for_owner(UserId::from("u2"));
        assert!(store.list_log_entries(&other, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_and_delete_are_conditional() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let session = ImportSession::new(UserId::from("u1"), Default::default());
        store.insert_session(&session).await.unwrap();

        assert!(store.mark_finalized(&session.id, Utc::now()).await.unwrap());
        assert!(!store.mark_finalized(&session.id, Utc::now()).await.unwrap());
        assert!(!store.delete_open_session(&session.id).await.unwrap());
        assert_eq!(
            store
                .append_records(&session.id, &["{}".to_string()])
                .await
                .unwrap(),
            AppendOutcome::Closed
        );
    }

    #[tokio::test]
    async fn deleting_entries_cascades_to_samples() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::from("u1");
        let session = ImportSessionId::from("imp-1");
        let entry = new_entry(&owner, Some(&session), 10);
        store.insert_log_entry(&entry).await.unwrap();
        store
            .insert_samples(&entry.id, &[Sample::at(0), Sample::at(10)])
            .await
            .unwrap();

        assert_eq!(store.delete_log_entries_by_session(&session).await.unwrap(), 1);
        let remaining: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn unique_index_backstops_duplicate_inserts() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::from("u1");
        let entry = new_entry(&owner, None, 10);
        store.insert_log_entry(&entry).await.unwrap();
        store.insert_samples(&entry.id, &[Sample::at(30)]).await.unwrap();

        let err = store
            .insert_samples(&entry.id, &[Sample::at(20), Sample::at(30)])
            .await
            .unwrap_err();
        match err {
            LogbookError::Conflict { time_offsets, .. } => assert_eq!(time_offsets, vec![30]),
            other => panic!("unexpected error: {other}"),
        }
        // The failed batch left nothing behind.
        assert_eq!(store.list_samples(&entry.id, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_unique_failures_become_conflicts() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let missing = LogEntryId::from("log_missing");
        let err = store
            .insert_samples(&missing, &[Sample::at(0)])
            .await
            .unwrap_err();
        assert!(matches!(err, LogbookError::Storage(_)), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn aggregate_converts_units() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let owner = UserId::from("u1");
        let entry = new_entry(&owner, None, 10);
        store.insert_log_entry(&entry).await.unwrap();
        store
            .insert_samples(
                &entry.id,
                &[
                    Sample::at(0).with_depth(10.0, DepthUnit::Meters),
                    Sample::at(10).with_depth(FEET_PER_METER * 20.0, DepthUnit::Feet),
                    Sample::at(20),
                ],
            )
            .await
            .unwrap();

        let agg = store
            .aggregate_depths(&entry.id, DepthUnit::Meters)
            .await
            .unwrap();
        assert_eq!(agg.sample_count, 2);
        assert_eq!(agg.stored_samples, 3);
        assert!((agg.max_depth.unwrap() - 20.0).abs() < 1e-9);
        assert!((agg.average_depth.unwrap() - 15.0).abs() < 1e-9);
    }
}
