//! gatewatch-journal — Event and attendance journal.
//!
//! SQLite-backed record of unknown-person alerts and per-day attendance of
//! known identities. This is the only surface the dashboard and the
//! operator CLI read from.

pub mod export;
pub mod journal;
pub mod schema;

pub use journal::{parse_date, AttendanceRecord, DateRange, Event, Journal, JournalError};
