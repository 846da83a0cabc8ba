//! Build failures a caller needs to tell apart.
//!
//! Everything else travels as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Ideation produced nothing parseable; there is nothing to build.
    #[error("could not infer build tasks from description (response began: {preview:?})")]
    NoTasksInferred { preview: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint store: {0}")]
    Checkpoint(String),
}

impl From<rusqlite::Error> for BuildError {
    fn from(e: rusqlite::Error) -> Self {
        BuildError::Checkpoint(e.to_string())
    }
}
