//! Capabilities that retrieve a local byte range of one segment.

use std::io::Read;

use crate::segment::Segment;

mod file;
#[cfg(feature = "http")]
mod http;

pub use file::FileFetcher;
#[cfg(feature = "http")]
pub use http::{range_header, HttpRangeFetcher};

/// Readable bytes of one fetched range, positioned at its first byte.
pub type ByteSource = Box<dyn Read + Send>;

/// Retrieves the inclusive local range `[local_start, local_end]` of a
/// segment. Retries, if any, are the implementation's business.
pub trait SegmentFetcher<H>: Send + Sync {
    fn fetch(
        &self,
        local_start: u64,
        local_end: u64,
        segment: &Segment<H>,
    ) -> anyhow::Result<ByteSource>;
}

impl<H, F> SegmentFetcher<H> for F
where
    F: Fn(u64, u64, &Segment<H>) -> anyhow::Result<ByteSource> + Send + Sync,
{
    fn fetch(
        &self,
        local_start: u64,
        local_end: u64,
        segment: &Segment<H>,
    ) -> anyhow::Result<ByteSource> {
        self(local_start, local_end, segment)
    }
}
