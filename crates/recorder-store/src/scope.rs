// ABOUTME: Builds WHERE fragments that restrict queries to a single recording run.
// ABOUTME: Runs are delimited by the recorded homeassistant_start events.

use std::fmt;

use chrono::{DateTime, Utc};
use recorder_core::EVENT_HOMEASSISTANT_START;

use crate::error::RecorderError;
use crate::facade::{QueryFacade, QueryOutcome, ReturnMode};
use crate::row::{Timestamp, adapt_datetime};

/// A `[start, end)` window over the `created` column, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl RunWindow {
    /// The WHERE fragment for this window.
    pub fn to_sql(&self) -> String {
        match (self.start, self.end) {
            (Some(start), Some(end)) => format!("created >= {} AND created < {}", start, end),
            (Some(start), None) => format!("created >= {}", start),
            (None, Some(end)) => format!("created < {}", end),
            (None, None) => "1 = 1".to_string(),
        }
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

fn start_event_created(
    facade: &QueryFacade,
    sql: &str,
    bound: i64,
) -> Result<Option<i64>, RecorderError> {
    let outcome = facade.execute(
        sql,
        &[&EVENT_HOMEASSISTANT_START, &bound],
        ReturnMode::OneRow,
    )?;
    match outcome {
        QueryOutcome::OneRow(Some(row)) => Ok(row.optional_integer("created")?),
        _ => Ok(None),
    }
}

/// Locate the run that was active at `point_in_time`: it begins at the last
/// start event before that point and ends, exclusively, at the start event
/// that follows it. Without a preceding start event the lower bound is left
/// open and the run ends at the first start at or after the point.
pub fn run_window(
    facade: &QueryFacade,
    point_in_time: DateTime<Utc>,
) -> Result<RunWindow, RecorderError> {
    let point = Timestamp(point_in_time).epoch_seconds();
    let start = start_event_created(
        facade,
        "SELECT created FROM events WHERE event_type = ?1 AND created < ?2 \
         ORDER BY created DESC LIMIT 1",
        point,
    )?;

    // Seconds are coarse: a later start can share the point's second.
    let end = match start {
        Some(start) => start_event_created(
            facade,
            "SELECT created FROM events WHERE event_type = ?1 AND created > ?2 \
             ORDER BY created ASC LIMIT 1",
            start,
        )?,
        None => start_event_created(
            facade,
            "SELECT created FROM events WHERE event_type = ?1 AND created >= ?2 \
             ORDER BY created ASC LIMIT 1",
            point,
        )?,
    };
    Ok(RunWindow { start, end })
}

/// WHERE fragment limiting a query to one run. With no point in time this is
/// the current run, which began at `recording_start`.
pub fn limit_to_run(
    facade: &QueryFacade,
    recording_start: DateTime<Utc>,
    point_in_time: Option<DateTime<Utc>>,
) -> Result<String, RecorderError> {
    let window = match point_in_time {
        None => RunWindow {
            start: Some(adapt_datetime(&recording_start)),
            end: None,
        },
        Some(point) => run_window(facade, point)?,
    };
    Ok(window.to_sql())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn insert_event(facade: &QueryFacade, event_type: &str, created: i64) {
        facade
            .execute(
                "INSERT INTO events (event_type, event_data, origin, created) VALUES (?1, '{}', 'LOCAL', ?2)",
                &[&event_type, &created],
                ReturnMode::RowCount,
            )
            .unwrap();
    }

    fn facade_with_two_runs(dir: &TempDir) -> QueryFacade {
        let facade = QueryFacade::open(&dir.path().join("recorder.db")).unwrap();
        insert_event(&facade, EVENT_HOMEASSISTANT_START, 1_000);
        insert_event(&facade, "call_service", 1_050);
        insert_event(&facade, EVENT_HOMEASSISTANT_START, 2_000);
        insert_event(&facade, "call_service", 2_050);
        facade
    }

    #[test]
    fn window_renders_fragments() {
        let both = RunWindow { start: Some(1), end: Some(2) };
        assert_eq!(both.to_sql(), "created >= 1 AND created < 2");
        let open = RunWindow { start: Some(1), end: None };
        assert_eq!(open.to_string(), "created >= 1");
        let before = RunWindow { start: None, end: Some(2) };
        assert_eq!(before.to_sql(), "created < 2");
        let all = RunWindow { start: None, end: None };
        assert_eq!(all.to_sql(), "1 = 1");
    }

    #[test]
    fn current_run_scopes_from_recording_start() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);
        let fragment = limit_to_run(&facade, at(2_000), None).unwrap();
        assert_eq!(fragment, "created >= 2000");
    }

    #[test]
    fn point_between_two_starts_is_bounded_by_the_later_start() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);

        let fragment = limit_to_run(&facade, at(9_999), Some(at(1_500))).unwrap();
        assert_eq!(fragment, "created >= 1000 AND created < 2000");

        let scoped = facade
            .query(&format!("SELECT * FROM events WHERE {}", fragment), &[])
            .unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[test]
    fn point_in_the_same_second_as_a_start_stays_in_one_run() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);
        insert_event(&facade, EVENT_HOMEASSISTANT_START, 3_000);

        let window = run_window(&facade, at(2_000)).unwrap();
        assert_eq!(window, RunWindow { start: Some(1_000), end: Some(2_000) });
    }

    #[test]
    fn point_on_the_first_start_has_no_lower_bound() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);
        let window = run_window(&facade, at(1_000)).unwrap();
        assert_eq!(window, RunWindow { start: None, end: Some(1_000) });
    }

    #[test]
    fn point_in_last_run_is_open_ended() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);
        let window = run_window(&facade, at(2_500)).unwrap();
        assert_eq!(window, RunWindow { start: Some(2_000), end: None });
    }

    #[test]
    fn point_before_any_start_has_no_lower_bound() {
        let dir = TempDir::new().unwrap();
        let facade = facade_with_two_runs(&dir);
        let window = run_window(&facade, at(500)).unwrap();
        assert_eq!(window, RunWindow { start: None, end: Some(1_000) });
    }

    #[test]
    fn uninitialized_facade_is_a_usage_error() {
        let facade = QueryFacade::new();
        assert!(matches!(
            run_window(&facade, at(1)),
            Err(RecorderError::NotInitialized)
        ));
    }
}
