//! Tabular (CSV) exports of the journal for the dashboard and operators.

use crate::journal::{AttendanceRecord, DateRange, Event, Journal, JournalError};
use crate::schema::{DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use std::path::Path;

impl Journal {
    /// Events as CSV, same selection and order as [`Journal::query_events`].
    /// The snapshot column carries only the file name, which is what the
    /// dashboard serves under `/snapshots/`.
    pub async fn export_events_csv(&self, range: Option<DateRange>) -> Result<Vec<u8>, JournalError> {
        let events = self.query_events(range).await?;
        events_to_csv(&events)
    }

    /// Attendance as CSV, oldest day first then by name.
    pub async fn export_attendance_csv(&self, range: Option<DateRange>) -> Result<Vec<u8>, JournalError> {
        let records = self.attendance_ordered(range, "date ASC, employee_name").await?;
        attendance_to_csv(&records)
    }
}

pub fn events_to_csv(events: &[Event]) -> Result<Vec<u8>, JournalError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["ID", "Name", "Timestamp", "Snapshot"])?;
    for event in events {
        let snapshot = Path::new(&event.evidence_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        wtr.write_record([
            event.id.to_string(),
            event.identity_label.clone(),
            event.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            snapshot,
        ])?;
    }
    finish(wtr)
}

pub fn attendance_to_csv(records: &[AttendanceRecord]) -> Result<Vec<u8>, JournalError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["Employee", "Date", "FirstSeen", "LastSeen"])?;
    for record in records {
        wtr.write_record([
            record.employee_name.clone(),
            record.date.format(DATE_FORMAT).to_string(),
            record.first_seen.format(TIME_FORMAT).to_string(),
            record.last_seen.format(TIME_FORMAT).to_string(),
        ])?;
    }
    finish(wtr)
}

fn finish(wtr: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, JournalError> {
    wtr.into_inner()
        .map_err(|e| JournalError::Export(csv::Error::from(e.into_error())))
}
