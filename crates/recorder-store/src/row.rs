// ABOUTME: Owned row model returned by the query facade and typed mappings for each table.
// ABOUTME: Converts rows back into Events and States, logging and eliding rows that fail to parse.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recorder_core::{Event, EventOrigin, ParseOriginError, State};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value};
use serde_json::Map;
use thiserror::Error;

/// Turn a datetime into the integer stored in the database (seconds since the epoch).
pub fn adapt_datetime(datetime: &DateTime<Utc>) -> i64 {
    datetime.timestamp()
}

/// Inverse of [`adapt_datetime`]. Returns None for values outside chrono's range.
pub fn from_epoch(seconds: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
}

/// Binds a datetime as whole seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn epoch_seconds(&self) -> i64 {
        adapt_datetime(&self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.epoch_seconds()))
    }
}

/// Errors raised while mapping a row onto a typed row struct or domain object.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("column {column} is not {expected}")]
    UnexpectedType {
        column: String,
        expected: &'static str,
    },

    #[error("column {column} holds malformed json: {source}")]
    Json {
        column: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Origin(#[from] ParseOriginError),

    #[error("column {column} holds an out of range timestamp: {value}")]
    Timestamp { column: String, value: i64 },
}

/// A row read through the query facade. Column names are shared between all
/// rows of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column with the given name.
    pub fn get_named(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|index| self.values.get(index))
    }

    fn required(&self, column: &str) -> Result<&Value, ConversionError> {
        self.get_named(column)
            .ok_or_else(|| ConversionError::MissingColumn(column.to_string()))
    }

    pub fn text(&self, column: &str) -> Result<&str, ConversionError> {
        match self.required(column)? {
            Value::Text(text) => Ok(text),
            _ => Err(ConversionError::UnexpectedType {
                column: column.to_string(),
                expected: "text",
            }),
        }
    }

    pub fn integer(&self, column: &str) -> Result<i64, ConversionError> {
        self.optional_integer(column)?
            .ok_or_else(|| ConversionError::UnexpectedType {
                column: column.to_string(),
                expected: "an integer",
            })
    }

    /// Integer column that may be NULL or absent from the result set.
    /// Real values written by older databases are truncated to whole seconds.
    pub fn optional_integer(&self, column: &str) -> Result<Option<i64>, ConversionError> {
        match self.get_named(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Integer(value)) => Ok(Some(*value)),
            Some(Value::Real(value)) => Ok(Some(*value as i64)),
            Some(_) => Err(ConversionError::UnexpectedType {
                column: column.to_string(),
                expected: "an integer",
            }),
        }
    }

    fn datetime(&self, column: &str) -> Result<DateTime<Utc>, ConversionError> {
        let value = self.integer(column)?;
        from_epoch(value).ok_or_else(|| ConversionError::Timestamp {
            column: column.to_string(),
            value,
        })
    }
}

fn parse_object(column: &str, raw: &str) -> Result<Map<String, serde_json::Value>, ConversionError> {
    serde_json::from_str(raw).map_err(|source| ConversionError::Json {
        column: column.to_string(),
        source,
    })
}

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub event_id: Option<i64>,
    pub event_type: String,
    pub event_data: String,
    pub origin: String,
    pub created: i64,
}

impl EventRow {
    pub fn from_row(row: &Row) -> Result<Self, ConversionError> {
        Ok(Self {
            event_id: row.optional_integer("event_id")?,
            event_type: row.text("event_type")?.to_string(),
            event_data: row.text("event_data")?.to_string(),
            origin: row.text("origin")?.to_string(),
            created: row.integer("created")?,
        })
    }

    /// Rebuild the event. The recorded time is the write time, at whole-second precision.
    pub fn into_event(self) -> Result<Event, ConversionError> {
        let data = parse_object("event_data", &self.event_data)?;
        let origin: EventOrigin = self.origin.parse()?;
        let time_fired = from_epoch(self.created).ok_or(ConversionError::Timestamp {
            column: "created".to_string(),
            value: self.created,
        })?;
        Ok(Event {
            event_type: self.event_type,
            data,
            origin,
            time_fired,
        })
    }
}

/// A row of the `states` table.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub state_id: Option<i64>,
    pub entity_id: String,
    pub state: String,
    pub attributes: String,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub created: Option<i64>,
}

impl StateRow {
    pub fn from_row(row: &Row) -> Result<Self, ConversionError> {
        let last_changed = row.datetime("last_changed")?;
        let last_updated = match row.optional_integer("last_updated")? {
            Some(_) => row.datetime("last_updated")?,
            None => last_changed,
        };
        Ok(Self {
            state_id: row.optional_integer("state_id")?,
            entity_id: row.text("entity_id")?.to_string(),
            state: row.text("state")?.to_string(),
            attributes: row.text("attributes")?.to_string(),
            last_changed,
            last_updated,
            created: row.optional_integer("created")?,
        })
    }

    pub fn into_state(self) -> Result<State, ConversionError> {
        let attributes = parse_object("attributes", &self.attributes)?;
        Ok(State {
            entity_id: self.entity_id,
            state: self.state,
            attributes,
            last_changed: self.last_changed,
            last_updated: self.last_updated,
        })
    }
}

/// Convert a database row to a state, or log and return None if it is malformed.
pub fn row_to_state(row: &Row) -> Option<State> {
    match StateRow::from_row(row).and_then(StateRow::into_state) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!("error converting row to state: {} ({:?})", e, row.values);
            None
        }
    }
}

/// Convert a database row to an event, or log and return None if it is malformed.
pub fn row_to_event(row: &Row) -> Option<Event> {
    match EventRow::from_row(row).and_then(EventRow::into_event) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("error converting row to event: {} ({:?})", e, row.values);
            None
        }
    }
}
