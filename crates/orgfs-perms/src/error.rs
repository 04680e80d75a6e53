//! Error types for the reconciler and verifier.

use std::path::PathBuf;

use orgfs_core::ModelError;
use thiserror::Error;

/// Result type alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// A filesystem syscall failed.
    #[error("{op} `{path}`: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A driver subprocess could not run or exited nonzero.
    #[error("failed to run `{what}`: {detail}")]
    Command { what: String, detail: String },

    /// The pure model rejected the inputs.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// An error annotated with the subtree it occurred in.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    pub fn io(op: &'static str, path: &std::path::Path, source: std::io::Error) -> FsError {
        FsError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Wraps the error with a subtree context, e.g. `service dirs`.
    pub fn context(self, context: impl Into<String>) -> FsError {
        FsError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
