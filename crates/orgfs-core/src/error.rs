//! Error types for the permission-model compiler.

use thiserror::Error;

/// Result type alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Error variants produced by the pure compiler stages.
///
/// The compiler short-circuits: the first error encountered is returned and
/// no partial plan is produced.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The configuration violates a structural or semantic rule.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// The group table conflicts with itself or with the configuration.
    #[error("inconsistent groups: {0}")]
    GroupsInconsistent(String),

    /// The sharing block failed to compile.
    #[error("invalid sharing config: {0}")]
    SharingInvalid(String),
}
