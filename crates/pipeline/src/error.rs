use std::path::PathBuf;

/// Errors that abort a run before or outside per-cell processing.
///
/// Failures inside a cell's generation or download phase never surface
/// here; they are captured at the worker boundary and persisted as
/// `failed` metadata records.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad run configuration; fatal at startup, before any dispatch.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A filesystem operation on run artifacts failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized for the ledger.
    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] gridgen_core::error::CoreError),

    #[error(transparent)]
    Workflow(#[from] gridgen_core::workflow::WorkflowError),

    /// A dispatcher invariant broke (worker channels closed early).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
