use std::fmt;
use std::io;

use thiserror::Error;

pub type DumpsealResult<T> = Result<T, DumpsealError>;

/// Coarse classification of a failure, used by job state machines and the CLI
/// exit path. Every [`DumpsealError`] maps to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    AuthenticationFailure,
    TruncatedStream,
    UnsupportedFormat,
    UpstreamIo,
    ProcessFailure,
    ChecksumMismatch,
    Config,
    Cancelled,
}

impl ErrorKind {
    /// Integrity failures are never retried and always abandon the stream.
    pub fn is_integrity(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthenticationFailure | ErrorKind::TruncatedStream | ErrorKind::ChecksumMismatch
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::AuthenticationFailure => "authentication failure",
            ErrorKind::TruncatedStream => "truncated stream",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::UpstreamIo => "upstream I/O error",
            ErrorKind::ProcessFailure => "process failure",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::Config => "config error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DumpsealError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("authentication failed at chunk {chunk}: {reason}")]
    AuthenticationFailure { chunk: u64, reason: String },

    #[error("truncated stream: {0}")]
    TruncatedStream(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailure {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} failed for {target}: {source}")]
    Job {
        operation: &'static str,
        target: String,
        #[source]
        source: Box<DumpsealError>,
    },
}

impl DumpsealError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DumpsealError::InvalidInput(_) => ErrorKind::InvalidInput,
            DumpsealError::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
            DumpsealError::TruncatedStream(_) => ErrorKind::TruncatedStream,
            DumpsealError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            DumpsealError::Io(_) => ErrorKind::UpstreamIo,
            DumpsealError::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            DumpsealError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            DumpsealError::Config(_) => ErrorKind::Config,
            DumpsealError::Cancelled => ErrorKind::Cancelled,
            DumpsealError::Job { source, .. } => source.kind(),
        }
    }

    /// Wrap this error with the operation and target it happened in.
    pub fn in_job(self, operation: &'static str, target: impl Into<String>) -> Self {
        DumpsealError::Job {
            operation,
            target: target.into(),
            source: Box::new(self),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::Config => io::ErrorKind::InvalidInput,
            ErrorKind::AuthenticationFailure
            | ErrorKind::UnsupportedFormat
            | ErrorKind::ChecksumMismatch => io::ErrorKind::InvalidData,
            ErrorKind::TruncatedStream => io::ErrorKind::UnexpectedEof,
            // never Interrupted: std retry loops would spin on it
            ErrorKind::Cancelled | ErrorKind::UpstreamIo | ErrorKind::ProcessFailure => {
                io::ErrorKind::Other
            }
        }
    }
}

/// Stages speak `std::io`, so typed errors travel inside `io::Error` and are
/// recovered here. Plain I/O failures become [`DumpsealError::Io`].
impl From<io::Error> for DumpsealError {
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<DumpsealError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(typed) = inner.downcast::<DumpsealError>() {
                    return *typed;
                }
            }
            return DumpsealError::Io(io::Error::other("typed stage error lost in transit"));
        }
        DumpsealError::Io(err)
    }
}

impl From<DumpsealError> for io::Error {
    fn from(err: DumpsealError) -> Self {
        match err {
            DumpsealError::Io(inner) => inner,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}
