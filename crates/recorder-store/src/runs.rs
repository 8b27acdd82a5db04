// ABOUTME: Run tracker recording when each recording session started and ended.
// ABOUTME: Repairs runs left open by an unclean shutdown before opening the current one.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::row::{ConversionError, Row, Timestamp, from_epoch};

/// A row of the `recorder_runs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderRun {
    pub run_id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub closed_incorrect: bool,
    pub created: DateTime<Utc>,
}

impl RecorderRun {
    pub fn from_row(row: &Row) -> Result<Self, ConversionError> {
        let datetime = |column: &str, value: i64| {
            from_epoch(value).ok_or_else(|| ConversionError::Timestamp {
                column: column.to_string(),
                value,
            })
        };

        let end = match row.optional_integer("end")? {
            Some(value) => Some(datetime("end", value)?),
            None => None,
        };

        Ok(Self {
            run_id: row.integer("run_id")?,
            start: datetime("start", row.integer("start")?)?,
            end,
            closed_incorrect: row.optional_integer("closed_incorrect")?.unwrap_or(0) != 0,
            created: datetime("created", row.integer("created")?)?,
        })
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Close every run that a previous process left open, flagging it as closed
/// incorrectly. Returns how many runs were repaired.
pub fn close_unfinished_runs(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let repaired = conn.execute(
        r#"UPDATE recorder_runs SET "end" = ?1, closed_incorrect = 1 WHERE "end" IS NULL"#,
        params![Timestamp(now)],
    )?;
    if repaired > 0 {
        tracing::warn!("found {} unfinished recorder run(s), marked closed_incorrect", repaired);
    }
    Ok(repaired)
}

/// Insert the row for the current run and return its run_id.
pub fn open_run(conn: &Connection, start: DateTime<Utc>) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO recorder_runs (start, created) VALUES (?1, ?2)",
        params![Timestamp(start), Timestamp(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Repair prior runs, then open the current one.
pub fn setup_run(conn: &Connection, start: DateTime<Utc>) -> rusqlite::Result<i64> {
    close_unfinished_runs(conn, Utc::now())?;
    let run_id = open_run(conn, start)?;
    tracing::info!("recorder run {} started", run_id);
    Ok(run_id)
}

/// Record the end time of the current run.
pub fn close_run(conn: &Connection, run_id: i64, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    let updated = conn.execute(
        r#"UPDATE recorder_runs SET "end" = ?1 WHERE run_id = ?2"#,
        params![Timestamp(now), run_id],
    )?;
    tracing::info!("recorder run {} closed", run_id);
    Ok(updated)
}
