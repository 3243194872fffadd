use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Permanent(String),

    #[error("operation canceled")]
    Canceled,

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("wrong password or no key found")]
    WrongPassword,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Whether the retry wrapper may re-attempt the failed operation.
    /// Only transient I/O is retried; everything else propagates.
    pub fn is_transient(&self) -> bool {
        match self {
            CairnError::Transient(_) => true,
            CairnError::Io(e) => is_retryable_io(e),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CairnError::NotFound(_))
            || matches!(self, CairnError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}
