use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use gatewatch_journal::schema::{DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use gatewatch_journal::{parse_date, AttendanceRecord, DateRange, Event, Journal};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatewatch", about = "Gatewatch journal CLI", version)]
struct Cli {
    /// Journal database written by gatewatchd
    #[arg(long, env = "GATEWATCH_DB_PATH", default_value = "alerts.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List unknown-person events (latest 50 unless a range is given)
    Events {
        #[command(flatten)]
        range: RangeArgs,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete one event by id
    DeleteEvent { id: i64 },
    /// Delete every event
    ClearEvents {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
    /// List attendance, newest day first
    Attendance {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        json: bool,
    },
    /// Delete one attendance row
    DeleteAttendance {
        name: String,
        /// Day as YYYY-MM-DD
        date: String,
    },
    /// Write events as CSV
    ExportEvents {
        #[command(flatten)]
        range: RangeArgs,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write attendance as CSV, oldest day first
    ExportAttendance {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RangeArgs {
    /// First day, YYYY-MM-DD (inclusive)
    #[arg(long, requires = "end", conflicts_with = "date")]
    start: Option<String>,
    /// Last day, YYYY-MM-DD (inclusive)
    #[arg(long, requires = "start", conflicts_with = "date")]
    end: Option<String>,
    /// Single day, YYYY-MM-DD
    #[arg(long)]
    date: Option<String>,
}

impl RangeArgs {
    fn resolve(&self) -> Result<Option<DateRange>> {
        match (&self.start, &self.end, &self.date) {
            (Some(start), Some(end), _) => Ok(Some(DateRange::parse(start, end)?)),
            (_, _, Some(day)) => Ok(Some(DateRange::day(parse_date(day)?))),
            (None, None, None) => Ok(None),
            _ => bail!("--start and --end must be given together"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let journal = Journal::open(&cli.db)
        .await
        .with_context(|| format!("failed to open journal {}", cli.db.display()))?;
    tracing::debug!(db = %cli.db.display(), "journal opened");

    let stdout = std::io::stdout();
    run(&journal, cli.command, &mut stdout.lock()).await
}

async fn run(journal: &Journal, command: Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Events { range, json } => {
            let events = journal.query_events(range.resolve()?).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&events)?)?;
            } else if events.is_empty() {
                writeln!(out, "No events")?;
            } else {
                write!(out, "{}", events_table(&events))?;
            }
        }
        Commands::DeleteEvent { id } => {
            if journal.delete_event(id).await? {
                writeln!(out, "Deleted event {id}")?;
            } else {
                writeln!(out, "No event with id {id}; nothing deleted")?;
            }
        }
        Commands::ClearEvents { yes } => {
            if !yes {
                bail!("refusing to clear all events without --yes");
            }
            let deleted = journal.clear_events().await?;
            writeln!(out, "Deleted {deleted} events")?;
        }
        Commands::Attendance { range, json } => {
            let records = journal.query_attendance(range.resolve()?).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&records)?)?;
            } else if records.is_empty() {
                writeln!(out, "No attendance records")?;
            } else {
                write!(out, "{}", attendance_table(&records))?;
            }
        }
        Commands::DeleteAttendance { name, date } => {
            let day: NaiveDate = parse_date(&date)?;
            if journal.delete_attendance(&name, day).await? {
                writeln!(out, "Deleted attendance for {name} on {date}")?;
            } else {
                writeln!(out, "No attendance for {name} on {date}; nothing deleted")?;
            }
        }
        Commands::ExportEvents { range, output } => {
            let csv = journal.export_events_csv(range.resolve()?).await?;
            emit(&csv, output, out)?;
        }
        Commands::ExportAttendance { range, output } => {
            let csv = journal.export_attendance_csv(range.resolve()?).await?;
            emit(&csv, output, out)?;
        }
    }
    Ok(())
}

fn emit(bytes: &[u8], path: Option<PathBuf>, out: &mut impl Write) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => out.write_all(bytes)?,
    }
    Ok(())
}

fn events_table(events: &[Event]) -> String {
    let mut table = format!("{:<6} {:<20} {:<19}  {}\n", "ID", "NAME", "TIMESTAMP", "SNAPSHOT");
    for event in events {
        table.push_str(&format!(
            "{:<6} {:<20} {:<19}  {}\n",
            event.id,
            event.identity_label,
            event.timestamp.format(TIMESTAMP_FORMAT),
            if event.evidence_path.is_empty() { "-" } else { event.evidence_path.as_str() },
        ));
    }
    table
}

fn attendance_table(records: &[AttendanceRecord]) -> String {
    let mut table = format!("{:<20} {:<10}  {:<8}  {}\n", "EMPLOYEE", "DATE", "FIRST", "LAST");
    for record in records {
        table.push_str(&format!(
            "{:<20} {:<10}  {:<8}  {}\n",
            record.employee_name,
            record.date.format(DATE_FORMAT),
            record.first_seen.format(TIME_FORMAT),
            record.last_seen.format(TIME_FORMAT),
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    async fn seeded() -> Journal {
        let journal = Journal::open_in_memory().await.unwrap();
        journal
            .record_unknown("Unknown_1", at(1, 9, 0), "snapshots/main/Unknown_1_20240501_090000_4.jpg")
            .await
            .unwrap();
        journal.record_unknown("Unknown_2", at(2, 10, 0), "").await.unwrap();
        journal.touch_attendance("alice", at(1, 8, 0)).await.unwrap();
        journal.touch_attendance("alice", at(1, 17, 0)).await.unwrap();
        journal
    }

    async fn output(journal: &Journal, args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("gatewatch").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        run(journal, cli.command, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_start_requires_end() {
        assert!(Cli::try_parse_from(["gatewatch", "events", "--start", "2024-05-01"]).is_err());
        assert!(Cli::try_parse_from(["gatewatch", "events", "--date", "2024-05-01", "--start", "2024-05-01", "--end", "2024-05-02"]).is_err());
    }

    #[test]
    fn test_reversed_range_rejected() {
        let range = RangeArgs {
            start: Some("2024-05-03".into()),
            end: Some("2024-05-01".into()),
            date: None,
        };
        assert!(range.resolve().is_err());
    }

    #[tokio::test]
    async fn test_events_table_newest_first() {
        let journal = seeded().await;
        let text = output(&journal, &["events"]).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].contains("Unknown_2"));
        assert!(lines[1].ends_with('-'));
        assert!(lines[2].contains("Unknown_1"));
    }

    #[tokio::test]
    async fn test_events_json_with_range() {
        let journal = seeded().await;
        let text = output(&journal, &["events", "--date", "2024-05-01", "--json"]).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        let events = parsed.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["identity_label"], "Unknown_1");
    }

    #[tokio::test]
    async fn test_attendance_table() {
        let journal = seeded().await;
        let text = output(&journal, &["attendance"]).await.unwrap();
        assert!(text.contains("alice"));
        assert!(text.contains("08:00:00"));
        assert!(text.contains("17:00:00"));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let journal = seeded().await;
        let text = output(&journal, &["delete-event", "99"]).await.unwrap();
        assert_eq!(text.trim(), "No event with id 99; nothing deleted");
        assert_eq!(journal.query_events(None).await.unwrap().len(), 2);
        let text = output(&journal, &["delete-event", "1"]).await.unwrap();
        assert_eq!(text.trim(), "Deleted event 1");
        assert_eq!(journal.query_events(None).await.unwrap().len(), 1);

        assert!(output(&journal, &["clear-events"]).await.is_err());
        let text = output(&journal, &["clear-events", "--yes"]).await.unwrap();
        assert_eq!(text.trim(), "Deleted 1 events");

        let text = output(&journal, &["delete-attendance", "bob", "2024-05-01"]).await.unwrap();
        assert_eq!(text.trim(), "No attendance for bob on 2024-05-01; nothing deleted");
        output(&journal, &["delete-attendance", "alice", "2024-05-01"]).await.unwrap();
        assert!(journal.query_attendance(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_to_file() {
        let journal = seeded().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        output(&journal, &["export-attendance", "-o", path.to_str().unwrap()])
            .await
            .unwrap();
        let csv = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            csv.lines().collect::<Vec<_>>(),
            vec!["Employee,Date,FirstSeen,LastSeen", "alice,2024-05-01,08:00:00,17:00:00"]
        );
    }
}
