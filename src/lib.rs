//! A single seekable, read-only byte stream over an object stored as an
//! ordered list of independently fetchable segments.
//!
//! ```no_run
//! use std::io::Read;
//! use part_stream::{FileFetcher, RequestedRange, SegmentStream, StreamConfig};
//!
//! let segments = FileFetcher::segments(&["video.part1", "video.part2"])?;
//! let mut stream = SegmentStream::new(
//!     segments,
//!     RequestedRange::bounded(1024, 4095),
//!     FileFetcher,
//!     StreamConfig::default().with_label("video"),
//! )?;
//!
//! let mut bytes = Vec::new();
//! stream.read_to_end(&mut bytes)?;
//! assert_eq!(bytes.len(), 3072);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod notify;
pub mod segment;
pub mod stream;

pub use buffer::BoundedStreamBuffer;
pub use config::StreamConfig;
pub use errors::{Result, StreamError};
#[cfg(feature = "http")]
pub use fetch::HttpRangeFetcher;
pub use fetch::{ByteSource, FileFetcher, SegmentFetcher};
pub use notify::Completion;
pub use segment::{FetchSpec, RequestedRange, ResolvedRange, Segment};
pub use stream::{SegmentStream, StreamState};
