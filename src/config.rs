use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StreamError};

const KILOBYTE: usize = 1024;

pub const DEFAULT_BUFFER_CAPACITY: usize = 128 * KILOBYTE;
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * KILOBYTE;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Tuning knobs for a [`SegmentStream`](crate::SegmentStream) and the
/// buffer behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Label for logging
    pub label: String,
    /// Fixed capacity of the transport buffer in bytes
    pub buffer_capacity: usize,
    /// How long a reader waits on an empty buffer
    pub read_timeout: Duration,
    /// How long the fetch worker waits on a full buffer
    pub write_timeout: Duration,
    /// Size of the chunks copied from a byte source into the buffer
    pub copy_chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            label: "stream".to_owned(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }
}

impl StreamConfig {
    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn low_bandwidth() -> Self {
        Self {
            buffer_capacity: 32 * KILOBYTE,
            copy_chunk_size: 16 * KILOBYTE,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            buffer_capacity: 4 * 1024 * KILOBYTE,
            copy_chunk_size: 256 * KILOBYTE,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Reads a JSON config file. Missing fields fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: StreamConfig =
            serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;

        log::debug!(
            "config/{}: loaded from {}",
            config.label,
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(StreamError::Config(
                "buffer capacity can't be zero".to_owned(),
            ));
        }
        if self.copy_chunk_size == 0 {
            return Err(StreamError::Config(
                "copy chunk size can't be zero".to_owned(),
            ));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(StreamError::Config(
                "timeouts can't be zero".to_owned(),
            ));
        }
        // The label names the worker thread
        if self.label.contains('\0') {
            return Err(StreamError::Config(
                "label can't contain NUL bytes".to_owned(),
            ));
        }
        Ok(())
    }
}
