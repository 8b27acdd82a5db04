// ABOUTME: Persistence engine for the recorder, writing events and entity states to SQLite.
// ABOUTME: Provides schema migrations, run tracking, the ingest queue, the writer, and the query facade.

pub mod config;
pub mod error;
pub mod facade;
pub mod queue;
pub mod recorder;
pub mod row;
pub mod runs;
pub mod schema;
pub mod scope;
mod worker;

pub use config::{ConfigError, RecorderConfig};
pub use error::RecorderError;
pub use facade::{ConnectionGuard, QueryFacade, QueryOutcome, ReturnMode};
pub use queue::{IngestQueue, QueueItem, QueueReceiver};
pub use recorder::Recorder;
pub use row::{
    ConversionError, EventRow, Row, StateRow, Timestamp, adapt_datetime, from_epoch, row_to_event,
    row_to_state,
};
pub use runs::RecorderRun;
pub use schema::{MigrationReport, migrate};
pub use scope::{RunWindow, limit_to_run, run_window};
