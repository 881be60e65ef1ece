use std::path::PathBuf;

/// Errors from the pure domain layer.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// User-supplied input (flags, index lists, templates) failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A tag asset file did not match the expected JSON shape.
    #[error("Invalid asset {path}: {reason}")]
    InvalidAsset { path: PathBuf, reason: String },

    /// A filesystem read failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
