//! Mapping of a requested global byte range onto segment-local fetches.
//!
//! A logical object is the ordered concatenation of its segments. A request
//! over the object is resolved once against the total length and then split
//! into one [`FetchSpec`] per segment it touches, in increasing global order.

use crate::errors::{Result, StreamError};

/// One physical part of a logical object.
///
/// The handle is opaque here: it is only ever passed back to the fetch
/// capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<H> {
    pub size: u64,
    pub handle: H,
}

impl<H> Segment<H> {
    pub fn new(size: u64, handle: H) -> Self {
        Self { size, handle }
    }
}

pub fn total_length<H>(segments: &[Segment<H>]) -> u64 {
    segments.iter().map(|segment| segment.size).sum()
}

/// Optional inclusive `[start, end]` request over the logical object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl RequestedRange {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self::new(Some(start), Some(end))
    }

    pub fn starting_at(start: u64) -> Self {
        Self::new(Some(start), None)
    }

    /// `[0, 0]` selects the whole object instead of the first byte.
    /// Callers use it to say "no range".
    pub fn is_degenerate(&self) -> bool {
        self.start == Some(0) && self.end == Some(0)
    }

    /// Clamps the request against `total` and turns it into a half-open
    /// global range.
    ///
    /// The length of the result is the number of bytes delivered, not
    /// `end - start + 1`: `[0, 0]` yields `total` and a start-only request
    /// yields `total - start`.
    pub fn resolve(&self, total: u64) -> Result<ResolvedRange> {
        let end = self
            .end
            .map(|end| end.min(total.saturating_sub(1)));

        if let (Some(start), Some(end)) = (self.start, end) {
            if start > end {
                return Err(StreamError::InvalidRange { start, end });
            }
        }

        let start = self.start.unwrap_or(0);
        let end = match end {
            None => total,
            Some(_) if self.is_degenerate() => total,
            Some(end) => (end + 1).min(total),
        };

        Ok(ResolvedRange {
            start,
            end: end.max(start),
        })
    }
}

/// Half-open global range `[start, end)` after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Inclusive local byte range to fetch from the segment at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSpec {
    pub index: usize,
    pub local_start: u64,
    pub local_end: u64,
}

impl FetchSpec {
    pub fn len(&self) -> u64 {
        self.local_end - self.local_start + 1
    }
}

/// Splits `range` into per-segment fetches, skipping segments entirely
/// outside of it. Every byte of the range is covered by exactly one spec.
pub fn plan_fetches<H>(
    segments: &[Segment<H>],
    range: ResolvedRange,
) -> Vec<FetchSpec> {
    let mut specs = Vec::new();
    let mut segment_start = 0u64;

    for (index, segment) in segments.iter().enumerate() {
        let segment_end = segment_start + segment.size;

        if segment.size == 0
            || range.start >= segment_end
            || range.end <= segment_start
        {
            segment_start = segment_end;
            continue;
        }

        let local_start = range.start.saturating_sub(segment_start);
        let local_end = (range.end - segment_start).min(segment.size) - 1;
        specs.push(FetchSpec {
            index,
            local_start,
            local_end,
        });

        segment_start = segment_end;
    }

    specs
}
