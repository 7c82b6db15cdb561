/// Journal schema. Table and column names match the dashboard's existing
/// `alerts.db`, so an older database opens in place; the unique index on
/// attendance is added if missing.
pub const SCHEMA: &str = r#"
-- Unknown-person events, append-only
CREATE TABLE IF NOT EXISTS unknown_faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    timestamp TEXT NOT NULL,       -- local time, YYYY-MM-DD HH:MM:SS
    snapshot_path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_unknown_faces_timestamp ON unknown_faces(timestamp);

-- Per-day attendance for known identities
CREATE TABLE IF NOT EXISTS employee_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    employee_name TEXT NOT NULL,
    date TEXT NOT NULL,            -- YYYY-MM-DD
    first_seen TEXT,               -- HH:MM:SS
    last_seen TEXT                 -- HH:MM:SS
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_employee_log_name_date
    ON employee_log(employee_name, date);
"#;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Page size for unfiltered event listings.
pub const DEFAULT_EVENT_LIMIT: u32 = 50;
