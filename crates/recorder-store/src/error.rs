// ABOUTME: Error type shared by the query facade, the writer, and the recorder handle.
// ABOUTME: Only NotInitialized is a usage error; everything else wraps a storage or worker failure.

use thiserror::Error;

/// Errors that can occur in the recorder's persistence engine.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("row conversion error: {0}")]
    Conversion(#[from] crate::row::ConversionError),

    #[error("recorder not initialized")]
    NotInitialized,

    #[error("recorder connection is closed")]
    Closed,

    #[error("recorder worker failed: {0}")]
    Worker(String),
}
