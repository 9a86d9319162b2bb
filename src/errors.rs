use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("Stream is closed")]
    Closed,
    #[error("Position out of range: {0}")]
    OutOfRange(String),
    #[error("Invalid range: start {start} is past end {end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Operation not supported on a read-only stream: {0}")]
    Unsupported(&'static str),
    #[error("Fetch of segment {index} failed: {reason}")]
    FetchFailed { index: usize, reason: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

impl StreamError {
    pub fn fetch_failed(index: usize, err: &anyhow::Error) -> Self {
        Self::FetchFailed {
            index,
            reason: format!("{:#}", err),
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        let kind = match &e {
            StreamError::Timeout(..) => io::ErrorKind::TimedOut,
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            StreamError::OutOfRange(_) | StreamError::InvalidRange { .. } => {
                io::ErrorKind::InvalidInput
            }
            StreamError::Unsupported(_) => io::ErrorKind::Unsupported,
            StreamError::Io(inner) => inner.kind(),
            StreamError::FetchFailed { .. } | StreamError::Config(_) => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, e)
    }
}
