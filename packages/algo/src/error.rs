//! Error types for the EBARS core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EbarsError>;

/// Errors raised by the EBARS core.
///
/// Every variant describes rejected input or configuration. Arithmetic inside
/// the feedback processor and difficulty mapper never produces an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EbarsError {
    /// Feedback symbol outside the four-symbol alphabet.
    #[error("unrecognized emoji feedback: {0:?}")]
    InvalidEmoji(String),

    /// Score outside [0, 100] or not finite.
    #[error("comprehension score {0} is outside [0, 100]")]
    InvalidScore(f64),

    /// Learner or session identifier is empty.
    #[error("invalid state key: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second initial assessment was submitted for the same learner and session.
    #[error("initial assessment already completed")]
    AlreadyCompleted,

    #[error("malformed assessment submission: {0}")]
    MalformedSubmission(String),

    /// Session content yields no usable sentences for question generation.
    #[error("session content is empty or has no usable sentences")]
    EmptyContent,

    /// Interaction log could not be read or written.
    #[error("interchange format error: {0}")]
    Interchange(String),
}
