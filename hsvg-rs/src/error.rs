//! Error types for hsvg-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! problems surface as [`HsvgError::Config`] or [`HsvgError::UnknownOptimizer`]
//! at startup; everything that goes wrong inside a training step propagates
//! and halts the run.
//!
//! # Example
//!
//! ```rust
//! use hsvg_rs::{HsvgError, config::OptimizerKind};
//!
//! match "adagrad".parse::<OptimizerKind>() {
//!     Ok(kind) => println!("optimizer: {kind}"),
//!     Err(HsvgError::UnknownOptimizer(name)) => eprintln!("no optimizer called {name}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for hsvg-rs operations.
pub type Result<T> = std::result::Result<T, HsvgError>;

/// Errors that can occur in hsvg-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HsvgError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Optimizer name not in `adam|rmsprop|sgd`.
    #[error("unknown optimizer: {0} (expected adam, rmsprop or sgd)")]
    UnknownOptimizer(String),

    /// Sequence shorter than the configured past/future split.
    #[error("sequence too short: need at least {required} frames, got {actual}")]
    SequenceTooShort {
        /// Frames the configuration needs.
        required: usize,
        /// Frames in the batch.
        actual: usize,
    },

    /// Model stepped before `init_states` was called for the sequence.
    #[error("hierarchy state not initialized: call init_states(x0) first")]
    NotInitialized,

    /// Model construction or forward error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for HsvgError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        HsvgError::Template(err.to_string())
    }
}
