// ABOUTME: The Recorder handle: constructed once, shared by the host and every reader.
// ABOUTME: Wires host lifecycle events to the writer thread and exposes the query facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use recorder_core::{EVENT_HOMEASSISTANT_START, EVENT_HOMEASSISTANT_STOP, Event, State};
use rusqlite::ToSql;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::facade::{QueryFacade, QueryOutcome, ReturnMode};
use crate::queue::{IngestQueue, QueueItem, QueueReceiver};
use crate::row::Row;
use crate::runs::RecorderRun;
use crate::scope::limit_to_run;
use crate::worker::PersistenceWorker;

/// Records every event on the host's bus, and the state history carried by
/// state changes, into SQLite. Share it behind an `Arc`.
pub struct Recorder {
    config: RecorderConfig,
    facade: Arc<QueryFacade>,
    queue: IngestQueue,
    receiver: Mutex<Option<QueueReceiver>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    recording_start: DateTime<Utc>,
    run_id: OnceLock<i64>,
    stopping: AtomicBool,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("db_path", &self.config.db_path())
            .field("recording_start", &self.recording_start)
            .field("run_id", &self.run_id.get())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create the recorder. Nothing touches the database until `start`.
    pub fn new(config: RecorderConfig) -> Self {
        let (queue, receiver) = IngestQueue::new(config.queue_capacity);
        Self {
            config,
            facade: Arc::new(QueryFacade::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            recording_start: Utc::now(),
            run_id: OnceLock::new(),
            stopping: AtomicBool::new(false),
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the writer thread and wait until the schema is current and the
    /// run is recorded. Calling it again after a successful start is a no-op;
    /// after a failed start it tries again.
    pub fn start(&self) -> Result<(), RecorderError> {
        // Held for the whole startup so concurrent starts see its outcome.
        let mut slot = Self::lock(&self.receiver);
        let Some(receiver) = slot.take() else {
            if self.run_id.get().is_none() {
                return Err(RecorderError::Worker(
                    "recorder worker was lost during an earlier start".to_string(),
                ));
            }
            tracing::warn!("recorder already started");
            return Ok(());
        };

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let facade = Arc::clone(&self.facade);
        let db_path = self.config.db_path();
        let recording_start = self.recording_start;

        let spawned = std::thread::Builder::new()
            .name("recorder-worker".to_string())
            .spawn(move || {
                match PersistenceWorker::start(&db_path, facade, recording_start) {
                    Ok((worker, guard)) => {
                        let _ = ready_tx.send(Ok(worker.run_id()));
                        worker.run(guard, receiver);
                    }
                    Err(e) => {
                        tracing::error!("recorder failed to start: {}", e);
                        // Hand the queue back so a later start can retry.
                        let _ = ready_tx.send(Err((e, receiver)));
                    }
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The closure, and the receiver with it, is gone.
                tracing::error!("failed to spawn recorder worker: {}", e);
                return Err(e.into());
            }
        };

        match ready_rx.recv() {
            Ok(Ok(run_id)) => {
                let _ = self.run_id.set(run_id);
                *Self::lock(&self.worker) = Some(handle);
                tracing::info!("recorder started, writing to {}", self.config.db_path().display());
                Ok(())
            }
            Ok(Err((e, receiver))) => {
                *slot = Some(receiver);
                if handle.join().is_err() {
                    tracing::error!("recorder worker thread panicked");
                }
                Err(e)
            }
            Err(_) => {
                *Self::lock(&self.worker) = Some(handle);
                Err(RecorderError::Worker(
                    "worker exited during startup".to_string(),
                ))
            }
        }
    }

    /// Queue an event for recording. Never blocks.
    pub fn record(&self, event: Event) -> bool {
        self.queue.enqueue(event)
    }

    /// Tell the writer to finish what is queued, close the run, and stop.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.queue.shutdown() {
            tracing::debug!("recorder writer already gone");
        }
    }

    /// Wait for the writer thread to exit.
    pub fn join(&self) -> Result<(), RecorderError> {
        let handle = Self::lock(&self.worker).take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| RecorderError::Worker("worker thread panicked".to_string())),
            None => Ok(()),
        }
    }

    /// Block until every event queued before this call has been written.
    pub fn flush(&self) -> Result<(), RecorderError> {
        if Self::lock(&self.worker).is_none() {
            return Err(match self.run_id.get() {
                Some(_) => RecorderError::Closed,
                None => RecorderError::NotInitialized,
            });
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        if !self.queue.enqueue_control(QueueItem::Barrier(tx)) {
            return Err(RecorderError::Closed);
        }
        rx.recv().map_err(|_| RecorderError::Closed)
    }

    /// Route one bus event: every event is queued, the host start event also
    /// starts recording and the host stop event also stops it.
    pub fn handle_bus_event(&self, event: Event) -> Result<(), RecorderError> {
        match event.event_type.as_str() {
            EVENT_HOMEASSISTANT_START => {
                self.record(event);
                self.start()
            }
            EVENT_HOMEASSISTANT_STOP => {
                self.record(event);
                self.stop();
                Ok(())
            }
            _ => {
                self.record(event);
                Ok(())
            }
        }
    }

    /// Follow a broadcast event bus until the host stops or the bus closes.
    pub async fn listen(
        self: Arc<Self>,
        bus: broadcast::Receiver<Event>,
    ) -> Result<(), RecorderError> {
        let mut events = BroadcastStream::new(bus);

        while let Some(received) = events.next().await {
            let event = match received {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!("recorder lagged behind the event bus, {} events missed", missed);
                    continue;
                }
            };

            match event.event_type.as_str() {
                // Starting blocks on database setup.
                EVENT_HOMEASSISTANT_START => {
                    let recorder = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || recorder.handle_bus_event(event))
                        .await
                        .map_err(|e| RecorderError::Worker(e.to_string()))??;
                }
                EVENT_HOMEASSISTANT_STOP => {
                    self.handle_bus_event(event)?;
                    break;
                }
                _ => self.handle_bus_event(event)?,
            }
        }

        Ok(())
    }

    pub fn recording_start(&self) -> DateTime<Utc> {
        self.recording_start
    }

    /// The run row opened by this recorder, once started.
    pub fn current_run_id(&self) -> Option<i64> {
        self.run_id.get().copied()
    }

    /// The shared query facade, for callers that need it directly.
    pub fn facade(&self) -> &Arc<QueryFacade> {
        &self.facade
    }

    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        mode: ReturnMode,
    ) -> Result<QueryOutcome, RecorderError> {
        self.facade.execute(sql, params, mode)
    }

    pub fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, RecorderError> {
        self.facade.query(sql, params)
    }

    pub fn query_states(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<impl Iterator<Item = State> + use<>, RecorderError> {
        self.facade.query_states(sql, params)
    }

    pub fn query_events(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<impl Iterator<Item = Event> + use<>, RecorderError> {
        self.facade.query_events(sql, params)
    }

    /// WHERE fragment limiting a query to the run active at `point_in_time`,
    /// or to the current run.
    pub fn limit_to_run(&self, point_in_time: Option<DateTime<Utc>>) -> Result<String, RecorderError> {
        if !self.facade.is_open() && self.run_id.get().is_none() {
            return Err(RecorderError::NotInitialized);
        }
        limit_to_run(&self.facade, self.recording_start, point_in_time)
    }

    /// All recorded runs, newest first.
    pub fn runs(&self) -> Result<Vec<RecorderRun>, RecorderError> {
        self.facade
            .query("SELECT * FROM recorder_runs ORDER BY run_id DESC", &[])?
            .iter()
            .map(|row| RecorderRun::from_row(row).map_err(RecorderError::from))
            .collect()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let handle = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        if !self.stopping.load(Ordering::Acquire) {
            tracing::warn!("recorder dropped while running, shutting down");
            self.queue.shutdown();
        }
        if handle.join().is_err() {
            tracing::error!("recorder worker thread panicked");
        }
    }
}
