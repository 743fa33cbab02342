//! Error types for loadcast.

use thiserror::Error;

/// Result type alias for loadcast operations.
pub type Result<T> = std::result::Result<T, LoadcastError>;

/// Errors that can occur during adapter injection, windowing, or checkpointing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LoadcastError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No parameters live under the requested dotted submodule path.
    #[error("submodule not found: '{path}'")]
    SubmoduleNotFound {
        /// The dotted path that resolved to nothing
        path: String,
    },

    /// A parameter path was registered twice.
    #[error("parameter already registered: '{path}'")]
    DuplicateParameter {
        /// The conflicting parameter path
        path: String,
    },

    /// A parameter path was looked up but does not exist.
    #[error("parameter not found: '{path}'")]
    ParameterNotFound {
        /// The missing parameter path
        path: String,
    },

    /// Selective extraction matched nothing; an empty checkpoint must
    /// never be written silently.
    #[error("selective state dict is empty, no parameter matched {patterns:?}")]
    EmptyStateDict {
        /// The substring patterns that matched nothing
        patterns: Vec<String>,
    },

    /// More entities requested than the data array contains.
    #[error("requested {requested} entities but data contains only {available}")]
    EntityCountExceeded {
        /// Entities requested
        requested: usize,
        /// Entities present in the array
        available: usize,
    },

    /// The train split of a ratio split contains no timesteps.
    #[error("train split is empty: empty data matrix or zero train ratio")]
    EmptyTrainSplit,

    /// A flat sample index fell outside the dataset.
    #[error("sample index {index} out of range for dataset of length {len}")]
    IndexOutOfRange {
        /// The offending index
        index: usize,
        /// Dataset length
        len: usize,
    },

    /// File I/O or serialization error.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
