//! Source Error Types

use thiserror::Error;

/// Errors raised while evaluating alert sources
#[derive(Debug, Error)]
pub enum SourceError {
    /// An aggregator was asked to evaluate with nothing registered
    #[error("No sources registered")]
    NoSources,

    /// The source ran but could not produce a result
    #[error("Evaluation failed: {0}")]
    EvaluationFailed(String),

    /// Evaluation was abandoned because of cancellation
    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
