// ABOUTME: Schema manager that creates and upgrades the recorder database.
// ABOUTME: Applies numbered migrations once each, in order, recording them in schema_version.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::row::Timestamp;

/// A numbered schema change. Each one is applied at most once, inside a
/// transaction together with its schema_version record.
#[derive(Debug)]
pub struct Migration {
    pub id: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const SCHEMA_VERSION_DDL: &str = "CREATE TABLE schema_version (
    migration_id INTEGER PRIMARY KEY,
    performed INTEGER
);";

/// All migrations, in the order they must be applied.
pub const MIGRATIONS: &[Migration] = &[Migration {
    id: 1,
    description: "create recorder_runs, events and states",
    sql: r#"
        CREATE TABLE recorder_runs (
            run_id INTEGER PRIMARY KEY,
            start INTEGER,
            "end" INTEGER,
            closed_incorrect INTEGER DEFAULT 0,
            created INTEGER
        );

        CREATE TABLE events (
            event_id INTEGER PRIMARY KEY,
            event_type TEXT,
            event_data TEXT,
            origin TEXT,
            created INTEGER
        );
        CREATE INDEX events__event_type ON events(event_type);

        CREATE TABLE states (
            state_id INTEGER PRIMARY KEY,
            entity_id TEXT,
            state TEXT,
            attributes TEXT,
            last_changed INTEGER,
            last_updated INTEGER,
            created INTEGER
        );
        CREATE INDEX states__entity_id ON states(entity_id);
    "#,
}];

/// What a call to [`migrate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Highest migration id applied before this call (0 for a fresh database).
    pub from: i64,
    /// Highest migration id applied after this call.
    pub to: i64,
    /// Ids applied by this call, in order. Empty when already current.
    pub applied: Vec<i64>,
}

/// The schema version this build expects.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.id).unwrap_or(0)
}

fn schema_version_exists(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Read the highest applied migration id, or None when schema_version is absent.
pub fn current_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    if !schema_version_exists(conn)? {
        return Ok(None);
    }
    let version: Option<i64> =
        conn.query_row("SELECT max(migration_id) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    Ok(Some(version.unwrap_or(0)))
}

/// Bring the database up to the latest schema. Safe to call on every startup:
/// an up-to-date database is left untouched.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<MigrationReport> {
    let from = match current_version(conn)? {
        Some(version) => version,
        None => {
            tracing::info!("schema_version table not found, creating it");
            conn.execute_batch(SCHEMA_VERSION_DDL)?;
            0
        }
    };

    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.id > from) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (migration_id, performed) VALUES (?1, ?2)",
            params![migration.id, Timestamp(Utc::now())],
        )?;
        tx.commit()?;

        tracing::info!(
            "database migrated to version {} ({})",
            migration.id,
            migration.description
        );
        applied.push(migration.id);
    }

    let to = applied.last().copied().unwrap_or(from);
    Ok(MigrationReport { from, to, applied })
}
