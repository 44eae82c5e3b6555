use thiserror::Error;

/// Errors raised by the operation model and the transformation engine.
///
/// All of them describe a malformed or mismatched operation; none of them
/// leave partially applied state behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    #[error("operation expects a document of {expected} characters, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("cannot compose: first operation yields {first} characters, second expects {second}")]
    ComposeMismatch { first: usize, second: usize },

    #[error("cannot transform operations over different base lengths ({left} vs {right})")]
    NotConcurrent { left: usize, right: usize },

    #[error("operation contains a zero-length component")]
    EmptyComponent,
}
