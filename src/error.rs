use std::io;
use std::path::{Path, PathBuf};

use arrow::error::ArrowError;
use thiserror::Error;

/// Errors surfaced by the bridge.
///
/// A missing CSV source and a table-name conflict are reported through
/// [`crate::sqlite::CsvLoadOutcome`] instead of this type.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("i/o error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid null token pattern: {0}")]
    NullPattern(#[from] regex::Error),

    #[error("expected exactly one SQL statement, found more in: {0}")]
    MultipleStatements(String),

    #[error("CSV file '{}' has no columns", .0.display())]
    EmptyCsv(PathBuf),

    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),
}

impl BridgeError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        BridgeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the error is a missing file on disk.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
