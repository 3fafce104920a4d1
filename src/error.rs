use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// Argument and state violations always propagate. Serialization problems
/// only propagate when a store is configured with
/// `throw_on_serialization_error`; the default is to recover locally (reads
/// miss, writes report failure).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Raised only when `throw_on_max_entry_size_exceeded` is configured;
    /// otherwise oversize writes return their failure value.
    #[error("entry of type {type_name} is {size} bytes which exceeds the maximum of {max_size}")]
    MaxEntrySizeExceeded {
        size: usize,
        max_size: usize,
        type_name: &'static str,
    },

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Wraps internal failures (size calculator, message bus delivery) that
    /// cannot be recovered locally.
    #[error("cache failure: {0}")]
    Failure(String),
}

impl CacheError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        CacheError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        CacheError::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
