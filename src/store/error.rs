use std::io;
use std::path::Path;

use thiserror::Error;

/// Persistence failures for the config and state files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry '{id}' not found")]
    NotFound { id: String },

    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{path}: missing required column '{column}'")]
    MissingColumn { path: String, column: &'static str },

    #[error("{path} is locked by another writer")]
    Locked { path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to encode row: {0}")]
    Encode(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Locked { .. } => true,
            StoreError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}
