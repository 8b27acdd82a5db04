// ABOUTME: Entry point for the recorder binary.
// ABOUTME: Records JSON-lines events from stdin into SQLite, or dumps what was recorded.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use recorder_core::{EVENT_HOMEASSISTANT_START, EVENT_HOMEASSISTANT_STOP, Event};
use recorder_store::{QueryFacade, Recorder, RecorderConfig, RecorderRun, run_window};
use rusqlite::ToSql;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;

/// Messages the bus holds before the recorder's listener has to catch up.
const BUS_CAPACITY: usize = 4096;

/// Recorder - event and state history in SQLite
#[derive(Parser, Debug)]
#[command(name = "recorder", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read one JSON event per line from stdin and record it
    Record,
    /// Print recorded rows as JSON lines
    Dump {
        #[arg(value_enum)]
        table: Table,

        /// Only rows from the run that was active at this instant (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Only states of this entity
        #[arg(long)]
        entity: Option<String>,

        /// Only events of this type
        #[arg(long)]
        event_type: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Table {
    Events,
    States,
    Runs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recorder=info,recorder_store=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RecorderConfig::from_env().context("invalid recorder configuration")?;
    tracing::info!("database: {}", config.db_path().display());

    match cli.command {
        Command::Record => record(config).await,
        Command::Dump {
            table,
            at,
            entity,
            event_type,
        } => dump(&config, table, at, entity, event_type),
    }
}

/// Publish stdin onto a bus the recorder listens to, bracketed by the start
/// and stop events a host would fire.
async fn record(config: RecorderConfig) -> anyhow::Result<()> {
    let recorder = Arc::new(Recorder::new(config));
    let (bus, rx) = broadcast::channel::<Event>(BUS_CAPACITY);
    let listener = tokio::spawn(Arc::clone(&recorder).listen(rx));

    bus.send(Event::bare(EVENT_HOMEASSISTANT_START))?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => {
                bus.send(event)?;
                published += 1;
            }
            Err(e) => tracing::warn!("skipping malformed event line: {}", e),
        }
        // Keep the bus from lapping the listener.
        while bus.len() >= BUS_CAPACITY / 2 {
            tokio::task::yield_now().await;
        }
    }

    bus.send(Event::bare(EVENT_HOMEASSISTANT_STOP))?;
    listener.await.context("recorder listener panicked")??;

    let joiner = Arc::clone(&recorder);
    tokio::task::spawn_blocking(move || joiner.join())
        .await
        .context("recorder worker panicked")??;

    tracing::info!(
        "recorded {} event(s), {} dropped",
        published,
        recorder.dropped_events()
    );
    Ok(())
}

fn dump(
    config: &RecorderConfig,
    table: Table,
    at: Option<DateTime<Utc>>,
    entity: Option<String>,
    event_type: Option<String>,
) -> anyhow::Result<()> {
    let facade = QueryFacade::open(&config.db_path())
        .with_context(|| format!("failed to open {}", config.db_path().display()))?;

    if let Table::Runs = table {
        for row in facade.query("SELECT * FROM recorder_runs ORDER BY run_id", &[])? {
            let run = RecorderRun::from_row(&row)?;
            println!("{}", serde_json::to_string(&run)?);
        }
        return Ok(());
    }

    let mut clauses = Vec::new();
    if let Some(at) = at {
        clauses.push(run_window(&facade, at)?.to_sql());
    }

    let mut params: Vec<&dyn ToSql> = Vec::new();
    let filter = match table {
        Table::States => entity.as_ref().map(|e| ("entity_id", e)),
        _ => event_type.as_ref().map(|t| ("event_type", t)),
    };
    if let Some((column, value)) = filter {
        params.push(value);
        clauses.push(format!("{} = ?{}", column, params.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    match table {
        Table::Events => {
            let sql = format!("SELECT * FROM events{} ORDER BY event_id", where_clause);
            for event in facade.query_events(&sql, &params)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Table::States => {
            let sql = format!("SELECT * FROM states{} ORDER BY state_id", where_clause);
            for state in facade.query_states(&sql, &params)? {
                println!("{}", serde_json::to_string(&state)?);
            }
        }
        Table::Runs => {}
    }

    facade.close();
    Ok(())
}
