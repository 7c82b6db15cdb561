//! Durable record of unknown-person events and daily attendance.
//!
//! All statements run on one dedicated SQLite thread (`tokio-rusqlite`), so
//! callers never block the runtime and writes are serialized. Attendance
//! touches are a single upsert against a unique `(employee_name, date)`
//! index: two near-simultaneous sightings can't create two rows, and a failed
//! touch leaves the previous row untouched.

use crate::schema::{DATE_FORMAT, DEFAULT_EVENT_LIMIT, SCHEMA, TIMESTAMP_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("journal connection closed")]
    Closed,
    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("invalid date '{0}' (expected YYYY-MM-DD)")]
    InvalidDate(String),
    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
    #[error("journal: {0}")]
    Other(String),
}

impl From<tokio_rusqlite::Error> for JournalError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(e) => JournalError::Sqlite(e),
            tokio_rusqlite::Error::ConnectionClosed => JournalError::Closed,
            other => JournalError::Other(other.to_string()),
        }
    }
}

/// One unknown-person sighting that raised an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub id: i64,
    /// Always `Unknown_<cluster id>` or a gallery name.
    pub identity_label: String,
    pub timestamp: NaiveDateTime,
    pub evidence_path: String,
}

/// First and last sighting of a known identity on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub employee_name: String,
    pub date: NaiveDate,
    pub first_seen: NaiveTime,
    pub last_seen: NaiveTime,
}

/// Inclusive calendar-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, JournalError> {
        if start > end {
            return Err(JournalError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self, JournalError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    fn bounds(&self) -> (String, String) {
        (
            self.start.format(DATE_FORMAT).to_string(),
            self.end.format(DATE_FORMAT).to_string(),
        )
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, JournalError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map_err(|_| JournalError::InvalidDate(s.to_string()))
}

/// Handle to the journal database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Journal {
    conn: tokio_rusqlite::Connection,
}

impl Journal {
    /// Open (creating if needed) the journal at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let journal = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "journal opened");
        Ok(journal)
    }

    pub async fn open_in_memory() -> Result<Self, JournalError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, JournalError> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            // The dashboard reads while the pipeline writes.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Append one unknown-person event and return it with its fresh id.
    pub async fn record_unknown(
        &self,
        label: &str,
        timestamp: NaiveDateTime,
        evidence_path: &str,
    ) -> Result<Event, JournalError> {
        let label = label.to_string();
        let evidence_path = evidence_path.to_string();
        let ts = timestamp.format(TIMESTAMP_FORMAT).to_string();

        let event = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO unknown_faces (name, timestamp, snapshot_path) VALUES (?1, ?2, ?3)",
                    params![label, ts, evidence_path],
                )?;
                let id = conn.last_insert_rowid();
                Ok((id, label, evidence_path))
            })
            .await
            .map(|(id, identity_label, evidence_path)| Event {
                id,
                identity_label,
                // Stored at second resolution.
                timestamp: truncate_to_second(timestamp),
                evidence_path,
            })?;

        tracing::debug!(id = event.id, label = %event.identity_label, "event recorded");
        Ok(event)
    }

    /// Create today's attendance row for `employee_name`, or move its
    /// `last_seen` forward. `first_seen` is never rewritten, and `last_seen`
    /// never moves backwards, so `first_seen <= last_seen` holds even when
    /// sightings from different streams arrive out of order.
    pub async fn touch_attendance(
        &self,
        employee_name: &str,
        now: NaiveDateTime,
    ) -> Result<AttendanceRecord, JournalError> {
        let name = employee_name.to_string();
        let date = now.date().format(DATE_FORMAT).to_string();
        let time = now.time().format(TIME_FORMAT).to_string();

        let record = self
            .conn
            .call(move |conn| {
                let record = conn.query_row(
                    r#"
                    INSERT INTO employee_log (employee_name, date, first_seen, last_seen)
                    VALUES (?1, ?2, ?3, ?3)
                    ON CONFLICT(employee_name, date) DO UPDATE SET
                        first_seen = COALESCE(first_seen, excluded.first_seen),
                        last_seen = MAX(COALESCE(last_seen, excluded.last_seen), excluded.last_seen)
                    RETURNING employee_name, date, first_seen, last_seen
                    "#,
                    params![name, date, time],
                    attendance_from_row,
                )?;
                Ok(record)
            })
            .await?;

        tracing::debug!(
            employee = %record.employee_name,
            date = %record.date,
            first_seen = %record.first_seen,
            last_seen = %record.last_seen,
            "attendance touched"
        );
        Ok(record)
    }

    /// Events newest first. Without a range only the latest page is returned;
    /// with a range, every event whose date falls inside it.
    pub async fn query_events(&self, range: Option<DateRange>) -> Result<Vec<Event>, JournalError> {
        let events = self
            .conn
            .call(move |conn| {
                let events = match range {
                    Some(range) => {
                        let (start, end) = range.bounds();
                        let mut stmt = conn.prepare(
                            r#"
                            SELECT id, name, timestamp, snapshot_path
                              FROM unknown_faces
                             WHERE date(timestamp) BETWEEN ?1 AND ?2
                             ORDER BY timestamp DESC, id DESC
                            "#,
                        )?;
                        let rows = stmt.query_map(params![start, end], event_from_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            r#"
                            SELECT id, name, timestamp, snapshot_path
                              FROM unknown_faces
                             ORDER BY timestamp DESC, id DESC
                             LIMIT ?1
                            "#,
                        )?;
                        let rows = stmt.query_map(params![DEFAULT_EVENT_LIMIT], event_from_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    /// Remove one event. Returns false (not an error) when no such id exists.
    pub async fn delete_event(&self, id: i64) -> Result<bool, JournalError> {
        let deleted = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM unknown_faces WHERE id = ?1", params![id])?))
            .await?;
        if deleted == 0 {
            tracing::debug!(id, "delete_event: no such event");
        } else {
            tracing::info!(id, "event deleted");
        }
        Ok(deleted > 0)
    }

    /// Remove every event. Returns how many were removed.
    pub async fn clear_events(&self) -> Result<usize, JournalError> {
        let deleted = self
            .conn
            .call(|conn| Ok(conn.execute("DELETE FROM unknown_faces", [])?))
            .await?;
        tracing::info!(deleted, "events cleared");
        Ok(deleted)
    }

    /// Attendance rows, newest day first then by name.
    pub async fn query_attendance(
        &self,
        range: Option<DateRange>,
    ) -> Result<Vec<AttendanceRecord>, JournalError> {
        self.attendance_ordered(range, "date DESC, employee_name").await
    }

    /// Remove one attendance row. Returns false when none matched.
    pub async fn delete_attendance(&self, employee_name: &str, date: NaiveDate) -> Result<bool, JournalError> {
        let name = employee_name.to_string();
        let date_str = date.format(DATE_FORMAT).to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM employee_log WHERE employee_name = ?1 AND date = ?2",
                    params![name, date_str],
                )?)
            })
            .await?;
        if deleted > 0 {
            tracing::info!(employee = employee_name, %date, "attendance deleted");
        }
        Ok(deleted > 0)
    }

    pub(crate) async fn attendance_ordered(
        &self,
        range: Option<DateRange>,
        order_by: &'static str,
    ) -> Result<Vec<AttendanceRecord>, JournalError> {
        let records = self
            .conn
            .call(move |conn| {
                let base = "SELECT employee_name, date, first_seen, last_seen FROM employee_log";
                let records = match range {
                    Some(range) => {
                        let (start, end) = range.bounds();
                        let sql = format!("{base} WHERE date BETWEEN ?1 AND ?2 ORDER BY {order_by}");
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt.query_map(params![start, end], attendance_from_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                    None => {
                        let sql = format!("{base} ORDER BY {order_by}");
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt.query_map([], attendance_from_row)?;
                        rows.collect::<Result<Vec<_>, _>>()?
                    }
                };
                Ok(records)
            })
            .await?;
        Ok(records)
    }
}

fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let raw: String = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        identity_label: row.get(1)?,
        timestamp: parse_column(2, &raw, |s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT))?,
        evidence_path: row.get(3)?,
    })
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date: String = row.get(1)?;
    let first: String = row.get(2)?;
    let last: String = row.get(3)?;
    Ok(AttendanceRecord {
        employee_name: row.get(0)?,
        date: parse_column(1, &date, |s| NaiveDate::parse_from_str(s, DATE_FORMAT))?,
        first_seen: parse_column(2, &first, |s| NaiveTime::parse_from_str(s, TIME_FORMAT))?,
        last_seen: parse_column(3, &last, |s| NaiveTime::parse_from_str(s, TIME_FORMAT))?,
    })
}

fn parse_column<T>(
    idx: usize,
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, chrono::ParseError>,
) -> rusqlite::Result<T> {
    parse(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
