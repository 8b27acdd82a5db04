// ABOUTME: End-to-end smoke test for the full recorder lifecycle.
// ABOUTME: Records across two process lifetimes, including an unclean exit and corrupted rows.

use std::path::Path;

use recorder_core::{
    EVENT_HOMEASSISTANT_START, EVENT_HOMEASSISTANT_STOP, EVENT_STATE_CHANGED, EVENT_TIME_CHANGED,
    Event, State,
};
use recorder_store::{Recorder, RecorderConfig};
use serde_json::{Value, json};

/// Helper to build an event from a JSON object literal.
fn event(event_type: &str, data: Value) -> Event {
    let Value::Object(map) = data else {
        panic!("test payload must be an object");
    };
    Event::new(event_type, map)
}

/// Helper to count rows with a plain connection, outside the recorder.
fn count(db: &Path, table: &str) -> i64 {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.query_row(&format!("SELECT count(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

#[test]
fn smoke_test_full_lifecycle() {
    // 1. Fresh database in a temp dir
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("data").join("home-assistant.db");

    // 2. First run: the host start event starts recording
    let recorder = Recorder::new(RecorderConfig::for_path(&db));
    recorder
        .handle_bus_event(Event::bare(EVENT_HOMEASSISTANT_START))
        .unwrap();
    let first_run = recorder.current_run_id().unwrap();

    recorder.handle_bus_event(event(
        EVENT_STATE_CHANGED,
        json!({
            "entity_id": "light.kitchen",
            "new_state": {"state": "on", "attributes": {"brightness": 80}}
        }),
    ))
    .unwrap();
    recorder
        .handle_bus_event(event(EVENT_TIME_CHANGED, json!({"now": "2026-01-01T00:00:00Z"})))
        .unwrap();
    recorder
        .handle_bus_event(event(
            EVENT_STATE_CHANGED,
            json!({"entity_id": "light.porch", "new_state": null}),
        ))
        .unwrap();
    recorder.flush().unwrap();

    // 3. Kitchen light recorded with its attributes intact
    let kitchen: Vec<State> = recorder
        .query_states("SELECT * FROM states WHERE entity_id = ?1", &[&"light.kitchen"])
        .unwrap()
        .collect();
    assert_eq!(kitchen.len(), 1);
    assert_eq!(kitchen[0].state, "on");
    assert_eq!(
        Value::Object(kitchen[0].attributes.clone()),
        json!({"brightness": 80})
    );

    // 4. Removed entity stored as an empty state with one timestamp throughout
    let porch = recorder
        .query("SELECT * FROM states WHERE entity_id = 'light.porch'", &[])
        .unwrap();
    assert_eq!(porch.len(), 1);
    assert_eq!(porch[0].text("state").unwrap(), "");
    assert_eq!(porch[0].text("attributes").unwrap(), "{}");
    let created = porch[0].integer("created").unwrap();
    assert_eq!(porch[0].integer("last_changed").unwrap(), created);
    assert_eq!(porch[0].integer("last_updated").unwrap(), created);

    // 5. The tick left no trace; start + two state changes did
    let types: Vec<String> = recorder
        .query_events("SELECT * FROM events ORDER BY event_id", &[])
        .unwrap()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![EVENT_HOMEASSISTANT_START, EVENT_STATE_CHANGED, EVENT_STATE_CHANGED]
    );

    // 6. Current run scope starts at recording start
    assert_eq!(
        recorder.limit_to_run(None).unwrap(),
        format!("created >= {}", recorder.recording_start().timestamp())
    );

    // 7. The host stop event ends the run cleanly
    recorder
        .handle_bus_event(Event::bare(EVENT_HOMEASSISTANT_STOP))
        .unwrap();
    recorder.join().unwrap();
    drop(recorder);

    let schema_rows = count(&db, "schema_version");
    let master_rows = count(&db, "sqlite_master");

    // 8. Simulate an unclean exit and corrupt one row of each kind
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute(r#"UPDATE recorder_runs SET "end" = NULL"#, [])
            .unwrap();
        conn.execute(
            "INSERT INTO events (event_type, event_data, origin, created) \
             VALUES ('broken', '{}', 'SIDEWAYS', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO states (entity_id, state, attributes, last_changed, last_updated, created) \
             VALUES ('sensor.broken', 'x', 'not json', 1, 1, 1)",
            [],
        )
        .unwrap();
    }

    // 9. Second run repairs the first and adds no schema
    let recorder = Recorder::new(RecorderConfig::for_path(&db));
    recorder
        .handle_bus_event(Event::bare(EVENT_HOMEASSISTANT_START))
        .unwrap();
    recorder.flush().unwrap();
    let second_run = recorder.current_run_id().unwrap();
    assert_ne!(first_run, second_run);

    assert_eq!(count(&db, "schema_version"), schema_rows);
    assert_eq!(count(&db, "sqlite_master"), master_rows);

    let runs = recorder.runs().unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, second_run);
    assert!(runs[0].is_open());
    assert!(!runs[0].closed_incorrect);
    assert_eq!(runs[1].run_id, first_run);
    assert!(runs[1].closed_incorrect);
    assert!(runs[1].end.is_some());

    // 10. Corrupted rows are skipped, the rest still come back
    let events: Vec<Event> = recorder
        .query_events("SELECT * FROM events", &[])
        .unwrap()
        .collect();
    assert_eq!(events.len() as i64, count(&db, "events") - 1);
    assert!(events.iter().all(|e| e.event_type != "broken"));

    let states: Vec<State> = recorder
        .query_states("SELECT * FROM states", &[])
        .unwrap()
        .collect();
    assert_eq!(states.len() as i64, count(&db, "states") - 1);
    assert_eq!(states.len(), 2);

    // 11. Dropping a running recorder still closes its run
    drop(recorder);
    let open_runs = count(&db, r#"recorder_runs WHERE "end" IS NULL"#);
    assert_eq!(open_runs, 0);
}
