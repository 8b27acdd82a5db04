// ABOUTME: Configuration loading for the recorder: database location and ingest queue capacity.
// ABOUTME: Reads environment variables with defaults; tests and embedders use for_path.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default database file name, kept compatible with existing history databases.
pub const DEFAULT_DB_FILE: &str = "home-assistant.db";

/// Default number of undelivered events the ingest queue holds before dropping.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RECORDER_QUEUE_CAPACITY is not a non-negative integer: {0}")]
    InvalidQueueCapacity(String),

    #[error("RECORDER_DB_FILE must be a plain file name, got: {0}")]
    InvalidDbFile(String),
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    pub home: PathBuf,
    pub db_file: String,
    /// Zero means unbounded.
    pub queue_capacity: usize,
}

impl RecorderConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - RECORDER_HOME: data directory (default: ~/.recorder)
    /// - RECORDER_DB_FILE: database file name inside the home (default: home-assistant.db)
    /// - RECORDER_QUEUE_CAPACITY: ingest queue capacity, 0 for unbounded (default: 100000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("RECORDER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".recorder")
            });

        let db_file = std::env::var("RECORDER_DB_FILE")
            .ok()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
        if Path::new(&db_file).components().count() != 1 {
            return Err(ConfigError::InvalidDbFile(db_file));
        }

        let queue_capacity = match std::env::var("RECORDER_QUEUE_CAPACITY") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidQueueCapacity(raw))?,
            Err(_) => DEFAULT_QUEUE_CAPACITY,
        };

        Ok(Self {
            home,
            db_file,
            queue_capacity,
        })
    }

    /// Build a configuration that stores the database at exactly `path`.
    pub fn for_path(path: &Path) -> Self {
        let home = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let db_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
        Self {
            home,
            db_file,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join(&self.db_file)
    }
}
