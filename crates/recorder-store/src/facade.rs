// ABOUTME: Query facade that owns the single SQLite connection behind a mutex.
// ABOUTME: Every read and write, from the writer or from callers, is serialized through execute().

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use recorder_core::{Event, State};
use rusqlite::{Connection, ErrorCode, Statement, ToSql};

use crate::error::RecorderError;
use crate::row::{Row, row_to_event, row_to_state};
use crate::schema::migrate;

/// What `execute` should hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMode {
    AllRows,
    RowCount,
    LastInsertId,
    OneRow,
}

/// Result of `execute`, shaped by the requested [`ReturnMode`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    RowCount(usize),
    LastInsertId(Option<i64>),
    OneRow(Option<Row>),
}

impl QueryOutcome {
    /// The result reported when a statement hit an integrity violation.
    fn empty(mode: ReturnMode) -> Self {
        match mode {
            ReturnMode::AllRows => QueryOutcome::Rows(Vec::new()),
            ReturnMode::RowCount => QueryOutcome::RowCount(0),
            ReturnMode::LastInsertId => QueryOutcome::LastInsertId(None),
            ReturnMode::OneRow => QueryOutcome::OneRow(None),
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutcome::Rows(rows) => rows,
            QueryOutcome::OneRow(row) => row.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            QueryOutcome::Rows(rows) => rows.len(),
            QueryOutcome::RowCount(count) => *count,
            QueryOutcome::LastInsertId(id) => usize::from(id.is_some()),
            QueryOutcome::OneRow(row) => usize::from(row.is_some()),
        }
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        match self {
            QueryOutcome::LastInsertId(id) => *id,
            _ => None,
        }
    }
}

enum Slot {
    Uninitialized,
    Open(Connection),
    Closed,
}

/// Serialized access to the recorder database.
pub struct QueryFacade {
    slot: Mutex<Slot>,
}

impl Default for QueryFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            Slot::Uninitialized => "uninitialized",
            Slot::Open(_) => "open",
            Slot::Closed => "closed",
        };
        f.debug_struct("QueryFacade").field("state", &state).finish()
    }
}

/// Open the database file with the pragmas the recorder relies on.
pub fn open_connection(path: &Path) -> Result<Connection, RecorderError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    tracing::info!("opened recorder database at {}", path.display());
    Ok(conn)
}

fn is_integrity_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn column_names(stmt: &Statement<'_>) -> Arc<[String]> {
    stmt.column_names().into_iter().map(String::from).collect()
}

fn read_row(row: &rusqlite::Row<'_>, columns: &Arc<[String]>) -> rusqlite::Result<Row> {
    let values = (0..columns.len())
        .map(|index| row.get(index))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
    mode: ReturnMode,
) -> rusqlite::Result<QueryOutcome> {
    let mut stmt = conn.prepare(sql)?;

    match mode {
        ReturnMode::AllRows => {
            let columns = column_names(&stmt);
            let mut rows = stmt.query(params)?;
            let mut collected = Vec::new();
            while let Some(row) = rows.next()? {
                collected.push(read_row(row, &columns)?);
            }
            Ok(QueryOutcome::Rows(collected))
        }
        ReturnMode::OneRow => {
            let columns = column_names(&stmt);
            let mut rows = stmt.query(params)?;
            let first = match rows.next()? {
                Some(row) => Some(read_row(row, &columns)?),
                None => None,
            };
            Ok(QueryOutcome::OneRow(first))
        }
        ReturnMode::RowCount => Ok(QueryOutcome::RowCount(stmt.execute(params)?)),
        ReturnMode::LastInsertId => {
            stmt.execute(params)?;
            Ok(QueryOutcome::LastInsertId(Some(conn.last_insert_rowid())))
        }
    }
}

impl QueryFacade {
    /// A facade with no connection yet. Queries fail with NotInitialized until
    /// the writer installs one.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Uninitialized),
        }
    }

    /// Open a database directly for inspection, bringing its schema up to date.
    /// Does not record a run.
    pub fn open(path: &Path) -> Result<Self, RecorderError> {
        let mut conn = open_connection(path)?;
        migrate(&mut conn)?;
        Ok(Self {
            slot: Mutex::new(Slot::Open(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.lock(), Slot::Open(_))
    }

    /// Hand a ready connection to the facade. The returned guard closes the
    /// connection when dropped unless it is disarmed first.
    pub fn install(self: &Arc<Self>, conn: Connection) -> ConnectionGuard {
        *self.lock() = Slot::Open(conn);
        ConnectionGuard {
            facade: Arc::clone(self),
            armed: true,
        }
    }

    /// Run `finish` against the connection, then close it. Later queries fail
    /// with Closed. Returns false if there was no open connection.
    pub fn close_with<F>(&self, finish: F) -> bool
    where
        F: FnOnce(&Connection) -> rusqlite::Result<()>,
    {
        let mut slot = self.lock();
        if !matches!(&*slot, Slot::Open(_)) {
            return false;
        }
        let Slot::Open(conn) = std::mem::replace(&mut *slot, Slot::Closed) else {
            return false;
        };

        if let Err(e) = finish(&conn) {
            tracing::error!("error before closing recorder database: {}", e);
        }

        tracing::info!("closing recorder database");
        if let Err((_, e)) = conn.close() {
            tracing::error!("error closing recorder database: {}", e);
        }
        true
    }

    pub fn close(&self) -> bool {
        self.close_with(|_| Ok(()))
    }

    /// Execute one statement under the connection lock.
    ///
    /// Integrity violations are logged and reported as the mode's empty
    /// result instead of an error.
    pub fn execute(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        mode: ReturnMode,
    ) -> Result<QueryOutcome, RecorderError> {
        let slot = self.lock();
        let conn = match &*slot {
            Slot::Open(conn) => conn,
            Slot::Uninitialized => return Err(RecorderError::NotInitialized),
            Slot::Closed => return Err(RecorderError::Closed),
        };

        tracing::debug!("running query {}", sql);

        match run_statement(conn, sql, params, mode) {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_integrity_violation(&e) => {
                tracing::error!("error querying the database using {}: {}", sql, e);
                Ok(QueryOutcome::empty(mode))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Query the database and return every row.
    pub fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, RecorderError> {
        Ok(self.execute(sql, params, ReturnMode::AllRows)?.into_rows())
    }

    /// Query the database and return the states; malformed rows are skipped.
    pub fn query_states(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<impl Iterator<Item = State> + use<>, RecorderError> {
        let rows = self.query(sql, params)?;
        Ok(rows.into_iter().filter_map(|row| row_to_state(&row)))
    }

    /// Query the database and return the events; malformed rows are skipped.
    pub fn query_events(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<impl Iterator<Item = Event> + use<>, RecorderError> {
        let rows = self.query(sql, params)?;
        Ok(rows.into_iter().filter_map(|row| row_to_event(&row)))
    }
}

/// Closes the facade's connection if dropped while armed. Dropping happens
/// when the writer exits without passing through its shutdown path.
pub struct ConnectionGuard {
    facade: Arc<QueryFacade>,
    armed: bool,
}

impl ConnectionGuard {
    /// Release the guard without closing anything.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.armed && self.facade.close() {
            tracing::warn!("recorder database closed without a clean shutdown");
        }
    }
}
