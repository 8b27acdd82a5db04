// ABOUTME: The persistence worker: the only writer, draining the ingest queue one item at a time.
// ABOUTME: Filters time ticks, writes a state row for state changes, and an event row for everything else.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use recorder_core::{Event, State, StateChange};

use crate::error::RecorderError;
use crate::facade::{ConnectionGuard, QueryFacade, ReturnMode, open_connection};
use crate::queue::{QueueItem, QueueReceiver};
use crate::row::Timestamp;
use crate::runs;
use crate::schema;

const INSERT_STATE: &str = "INSERT INTO states \
    (entity_id, state, attributes, last_changed, last_updated, created) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_EVENT: &str = "INSERT INTO events \
    (event_type, event_data, origin, created) \
    VALUES (?1, ?2, ?3, ?4)";

/// Whether the loop keeps going after an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

pub(crate) struct PersistenceWorker {
    facade: Arc<QueryFacade>,
    run_id: i64,
}

impl PersistenceWorker {
    /// Open the database, bring the schema up to date, repair and open runs,
    /// and only then hand the connection to the facade.
    pub(crate) fn start(
        db_path: &Path,
        facade: Arc<QueryFacade>,
        recording_start: chrono::DateTime<Utc>,
    ) -> Result<(Self, ConnectionGuard), RecorderError> {
        let mut conn = open_connection(db_path)?;

        let report = schema::migrate(&mut conn)?;
        if report.applied.is_empty() {
            tracing::debug!("schema already at version {}", report.to);
        }

        let run_id = runs::setup_run(&conn, recording_start)?;
        let guard = facade.install(conn);

        Ok((Self { facade, run_id }, guard))
    }

    pub(crate) fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Drain the queue until the shutdown item arrives or every producer is gone.
    pub(crate) fn run(self, guard: ConnectionGuard, mut queue: QueueReceiver) {
        while let Some(item) = queue.dequeue() {
            if self.handle(item) == Step::Stop {
                self.close(guard);
                return;
            }
        }

        tracing::warn!("ingest queue closed without a shutdown signal");
        self.close(guard);
    }

    pub(crate) fn handle(&self, item: QueueItem) -> Step {
        match item {
            QueueItem::Shutdown => Step::Stop,
            QueueItem::Barrier(ack) => {
                // The waiter may have given up.
                let _ = ack.send(());
                Step::Continue
            }
            QueueItem::Event(event) => {
                self.process(&event);
                Step::Continue
            }
        }
    }

    fn process(&self, event: &Event) {
        if event.is_time_tick() {
            return;
        }

        if event.is_state_change() {
            match StateChange::from_event(event) {
                Ok(change) => {
                    if let Err(e) = self.record_state(&change.entity_id, change.new_state.as_ref()) {
                        tracing::error!("failed to record state of {}: {}", change.entity_id, e);
                    }
                }
                Err(e) => tracing::warn!("not recording state for malformed state change: {}", e),
            }
        }

        if let Err(e) = self.record_event(event) {
            tracing::error!("failed to record {} event: {}", event.event_type, e);
        }
    }

    /// Save a state. A removed entity is saved as an empty state stamped now.
    fn record_state(&self, entity_id: &str, state: Option<&State>) -> Result<(), RecorderError> {
        let now = Timestamp(Utc::now());

        match state {
            None => {
                self.facade.execute(
                    INSERT_STATE,
                    &[&entity_id, &"", &"{}", &now, &now, &now],
                    ReturnMode::RowCount,
                )?;
            }
            Some(state) => {
                let attributes = serde_json::to_string(&state.attributes)?;
                self.facade.execute(
                    INSERT_STATE,
                    &[
                        &entity_id,
                        &state.state,
                        &attributes,
                        &Timestamp(state.last_changed),
                        &Timestamp(state.last_updated),
                        &now,
                    ],
                    ReturnMode::RowCount,
                )?;
            }
        }
        Ok(())
    }

    fn record_event(&self, event: &Event) -> Result<(), RecorderError> {
        let event_data = serde_json::to_string(&event.data)?;
        self.facade.execute(
            INSERT_EVENT,
            &[
                &event.event_type,
                &event_data,
                &event.origin.as_str(),
                &Timestamp(Utc::now()),
            ],
            ReturnMode::RowCount,
        )?;
        Ok(())
    }

    /// Record the end of the run and close the connection. Runs once.
    fn close(self, guard: ConnectionGuard) {
        guard.disarm();
        let run_id = self.run_id;
        self.facade
            .close_with(|conn| runs::close_run(conn, run_id, Utc::now()).map(|_| ()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::IngestQueue;
    use recorder_core::{EVENT_STATE_CHANGED, EVENT_TIME_CHANGED};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn event(event_type: &str, data: Value) -> Event {
        let Value::Object(map) = data else {
            panic!("test payload must be an object");
        };
        Event::new(event_type, map)
    }

    fn count(facade: &QueryFacade, table: &str) -> i64 {
        facade
            .query(&format!("SELECT count(*) AS n FROM {}", table), &[])
            .unwrap()[0]
            .integer("n")
            .unwrap()
    }

    fn started(dir: &TempDir) -> (PersistenceWorker, ConnectionGuard, Arc<QueryFacade>) {
        let facade = Arc::new(QueryFacade::new());
        let (worker, guard) =
            PersistenceWorker::start(&dir.path().join("recorder.db"), Arc::clone(&facade), Utc::now())
                .unwrap();
        (worker, guard, facade)
    }

    #[test]
    fn time_ticks_are_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, facade) = started(&dir);

        for _ in 0..3 {
            let step = worker.handle(QueueItem::Event(event(EVENT_TIME_CHANGED, json!({"now": 1}))));
            assert_eq!(step, Step::Continue);
        }

        assert_eq!(count(&facade, "events"), 0);
        assert_eq!(count(&facade, "states"), 0);
    }

    #[test]
    fn state_change_writes_state_and_event() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, facade) = started(&dir);

        worker.handle(QueueItem::Event(event(
            EVENT_STATE_CHANGED,
            json!({
                "entity_id": "light.kitchen",
                "new_state": {"state": "on", "attributes": {"brightness": 80}}
            }),
        )));

        assert_eq!(count(&facade, "states"), 1);
        assert_eq!(count(&facade, "events"), 1);

        let states: Vec<State> = facade
            .query_states("SELECT * FROM states", &[])
            .unwrap()
            .collect();
        assert_eq!(states[0].entity_id, "light.kitchen");
        assert_eq!(states[0].state, "on");
        assert_eq!(Value::Object(states[0].attributes.clone()), json!({"brightness": 80}));
    }

    #[test]
    fn removed_entity_writes_empty_state_stamped_now() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, facade) = started(&dir);

        worker.handle(QueueItem::Event(event(
            EVENT_STATE_CHANGED,
            json!({"entity_id": "light.porch", "new_state": null}),
        )));

        let rows = facade.query("SELECT * FROM states", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.text("state").unwrap(), "");
        assert_eq!(row.text("attributes").unwrap(), "{}");
        let created = row.integer("created").unwrap();
        assert_eq!(row.integer("last_changed").unwrap(), created);
        assert_eq!(row.integer("last_updated").unwrap(), created);
        assert_eq!(count(&facade, "events"), 1);
    }

    #[test]
    fn malformed_state_change_still_records_event() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, facade) = started(&dir);

        worker.handle(QueueItem::Event(event(EVENT_STATE_CHANGED, json!({"new_state": null}))));

        assert_eq!(count(&facade, "states"), 0);
        assert_eq!(count(&facade, "events"), 1);
    }

    #[test]
    fn event_row_stores_type_payload_and_origin() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, facade) = started(&dir);

        let remote = event("call_service", json!({"domain": "light", "service": "turn_on"}))
            .with_origin(recorder_core::EventOrigin::Remote);
        worker.handle(QueueItem::Event(remote));

        let rows = facade.query("SELECT * FROM events", &[]).unwrap();
        assert_eq!(rows[0].text("event_type").unwrap(), "call_service");
        assert_eq!(rows[0].text("origin").unwrap(), "REMOTE");
        let data: Value = serde_json::from_str(rows[0].text("event_data").unwrap()).unwrap();
        assert_eq!(data, json!({"domain": "light", "service": "turn_on"}));
    }

    #[test]
    fn run_drains_queue_in_order_and_closes_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let (worker, guard, facade) = started(&dir);
        let run_id = worker.run_id();
        let (queue, rx) = IngestQueue::new(0);

        for n in 0..3 {
            queue.enqueue(event("numbered", json!({"n": n})));
        }
        queue.shutdown();
        queue.enqueue(event("after_shutdown", json!({})));

        worker.run(guard, rx);

        assert!(!facade.is_open());
        let conn = rusqlite::Connection::open(dir.path().join("recorder.db")).unwrap();
        let payloads: Vec<String> = conn
            .prepare("SELECT event_data FROM events ORDER BY event_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(payloads, vec![r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":2}"#]);

        let (end, closed_incorrect): (Option<i64>, i64) = conn
            .query_row(
                r#"SELECT "end", closed_incorrect FROM recorder_runs WHERE run_id = ?1"#,
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(end.is_some());
        assert_eq!(closed_incorrect, 0);
    }

    #[test]
    fn barrier_is_acknowledged() {
        let dir = TempDir::new().unwrap();
        let (worker, _guard, _facade) = started(&dir);
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        assert_eq!(worker.handle(QueueItem::Barrier(tx)), Step::Continue);
        assert!(rx.try_recv().is_ok());
    }
}
