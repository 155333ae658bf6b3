use thiserror::Error;

/// Alias for `core::result::Result<T, Error>`.
pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for checkpoint and restart operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration: zero chunk size, target id out of range,
    /// region length changed mid-sequence.
    #[error("config error: {0}")]
    Config(String),

    /// A diff file could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A diff's header or tables are inconsistent with its byte length.
    #[error("format error: {0}")]
    Format(String),

    /// A restart walked off the provided snapshot chain, or a reference
    /// could not be resolved after exhausting it.
    #[error("corrupt chain error: {0}")]
    CorruptChain(String),

    /// A pre-sized map or vector could not hold the required entries.
    #[error("resource error: {0}")]
    Resource(String),
}

impl From<statediff_primitives::CapacityError> for Error {
    fn from(err: statediff_primitives::CapacityError) -> Self {
        Error::Resource(err.to_string())
    }
}
