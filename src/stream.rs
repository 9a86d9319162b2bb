//! Read-only, seekable byte stream over a segmented logical object.
//!
//! Nothing is fetched until the first read. Opening allocates the transport
//! buffer and starts one worker thread that walks the fetch plan strictly in
//! order, copying each segment's byte source into the buffer. The reader
//! drains the buffer from the caller's thread.

use std::cell::Cell;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::buffer::BoundedStreamBuffer;
use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};
use crate::fetch::{ByteSource, SegmentFetcher};
use crate::notify::Completion;
use crate::segment::{
    plan_fetches, total_length, FetchSpec, RequestedRange, ResolvedRange,
    Segment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Constructed, nothing fetched yet
    Unopened,
    /// The worker is still issuing fetches
    Fetching,
    /// Every fetch finished; buffered bytes may still be read
    Draining,
    Closed,
}

struct Inner {
    buffer: Option<Arc<BoundedStreamBuffer>>,
    worker: Option<JoinHandle<()>>,
}

pub struct SegmentStream<H> {
    config: StreamConfig,
    segments: Arc<[Segment<H>]>,
    fetcher: Arc<dyn SegmentFetcher<H>>,
    range: ResolvedRange,
    state: Arc<Mutex<StreamState>>,
    inner: Mutex<Inner>,
    completion: Completion,
}

impl<H> SegmentStream<H>
where
    H: Send + Sync + 'static,
{
    /// Creates a stream over `segments` restricted to `range`.
    ///
    /// Fails with [`StreamError::InvalidRange`] if the clamped start lies
    /// past the clamped end.
    pub fn new<F>(
        segments: impl Into<Arc<[Segment<H>]>>,
        range: RequestedRange,
        fetcher: F,
        config: StreamConfig,
    ) -> Result<Self>
    where
        F: SegmentFetcher<H> + 'static,
    {
        Self::with_shared_fetcher(segments, range, Arc::new(fetcher), config)
    }

    /// Same as [`SegmentStream::new`] for a fetcher shared between streams.
    pub fn with_shared_fetcher(
        segments: impl Into<Arc<[Segment<H>]>>,
        range: RequestedRange,
        fetcher: Arc<dyn SegmentFetcher<H>>,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;

        let segments = segments.into();
        let total = total_length(&segments);
        if range.is_degenerate() && total > 1 {
            log::warn!(
                "stream/{}: range [0, 0] selects the whole object ({} bytes)",
                config.label,
                total
            );
        }
        let range = range.resolve(total)?;

        log::debug!(
            "stream/{}: {} segments, {} bytes total, range {}..{}",
            config.label,
            segments.len(),
            total,
            range.start,
            range.end
        );

        Ok(Self {
            config,
            segments,
            fetcher,
            range,
            state: Arc::new(Mutex::new(StreamState::Unopened)),
            inner: Mutex::new(Inner {
                buffer: None,
                worker: None,
            }),
            completion: Completion::new(),
        })
    }

    /// Stream over a single, non-partitioned object.
    pub fn from_file<F>(
        file: Segment<H>,
        range: RequestedRange,
        fetcher: F,
        config: StreamConfig,
    ) -> Result<Self>
    where
        F: SegmentFetcher<H> + 'static,
    {
        Self::new(vec![file], range, fetcher, config)
    }

    /// Allocates the buffer and starts the worker on first use.
    pub fn open(&self) -> Result<Arc<BoundedStreamBuffer>> {
        let mut inner = self.lock_inner();
        if let Some(buffer) = &inner.buffer {
            return Ok(buffer.clone());
        }

        let mut state = lock(&self.state);
        if *state == StreamState::Closed {
            return Err(StreamError::Closed);
        }

        let buffer = Arc::new(BoundedStreamBuffer::from_config(&self.config));
        let worker = FetchWorker {
            label: self.config.label.clone(),
            segments: self.segments.clone(),
            fetcher: self.fetcher.clone(),
            plan: plan_fetches(&self.segments, self.range),
            buffer: buffer.clone(),
            state: self.state.clone(),
            chunk_size: self.config.copy_chunk_size,
            current: Cell::new(0),
        };

        log::debug!(
            "stream/{}: opening with {} fetches",
            self.config.label,
            worker.plan.len()
        );
        *state = StreamState::Fetching;
        drop(state);

        let spawned = thread::Builder::new()
            .name(format!("segment-fetch-{}", self.config.label))
            .spawn(move || worker.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                *lock(&self.state) = StreamState::Unopened;
                return Err(err.into());
            }
        };

        inner.buffer = Some(buffer.clone());
        inner.worker = Some(handle);
        Ok(buffer)
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` means the requested range was
    /// delivered completely.
    ///
    /// A read timeout terminates the stream: every later read returns the
    /// same timeout and the worker stops at its next write.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let buffer = self.open()?;
        match buffer.read(buf) {
            Err(err @ StreamError::Timeout(..)) => {
                log::warn!(
                    "stream/{}: terminated at offset {}: {}",
                    self.config.label,
                    buffer.position(),
                    err
                );
                buffer.abort(err.clone());
                Err(err)
            }
            result => result,
        }
    }

    /// Moves the read position. Only positions still retained by the buffer
    /// are reachable; `End` is relative to [`SegmentStream::len`].
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let buffer = self.open()?;
        match pos {
            SeekFrom::End(delta) => {
                let target = i128::from(self.len()) + i128::from(delta);
                let target = u64::try_from(target).map_err(|_| {
                    StreamError::OutOfRange(format!(
                        "offset {} is before the start of the stream",
                        target
                    ))
                })?;
                buffer.seek(SeekFrom::Start(target))
            }
            pos => buffer.seek(pos),
        }
    }
}

impl<H> SegmentStream<H> {
    /// Number of bytes the stream delivers.
    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Global offsets `[start, end)` of the logical object being streamed.
    pub fn range(&self) -> ResolvedRange {
        self.range
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Offset of the next byte to be read, relative to the range start.
    pub fn position(&self) -> u64 {
        self.lock_inner()
            .buffer
            .as_ref()
            .map_or(0, |buffer| buffer.position())
    }

    pub fn can_read(&self) -> bool {
        true
    }

    pub fn can_seek(&self) -> bool {
        true
    }

    pub fn can_write(&self) -> bool {
        false
    }

    pub fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(StreamError::Unsupported("write"))
    }

    pub fn flush(&self) -> Result<()> {
        Err(StreamError::Unsupported("flush"))
    }

    pub fn set_len(&self, _len: u64) -> Result<()> {
        Err(StreamError::Unsupported("set_len"))
    }

    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.completion.on_finished(callback)
    }

    /// Resolves once the stream is closed.
    pub fn finished(&self) -> oneshot::Receiver<()> {
        self.completion.finished()
    }

    /// Closes the buffer, which wakes any blocked reader or writer, and
    /// raises the completion notification. Safe to call any number of
    /// times, from any thread, opened or not.
    pub fn close(&self) {
        let buffer = {
            let mut inner = self.lock_inner();
            *lock(&self.state) = StreamState::Closed;
            // The worker notices the closed buffer on its next write and
            // exits on its own; joining here would wait on the network.
            inner.worker.take();
            inner.buffer.clone()
        };

        // A single critical section: a woken reader must see `closed`, never
        // a flushed and empty buffer.
        if let Some(buffer) = buffer {
            buffer.close();
        }

        if self.completion.fire() {
            log::debug!("stream/{}: closed", self.config.label);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

impl<H> Drop for SegmentStream<H> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<H> Read for SegmentStream<H>
where
    H: Send + Sync + 'static,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SegmentStream::read(self, buf).map_err(Into::into)
    }
}

impl<H> Read for &SegmentStream<H>
where
    H: Send + Sync + 'static,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SegmentStream::read(*self, buf).map_err(Into::into)
    }
}

impl<H> Seek for SegmentStream<H>
where
    H: Send + Sync + 'static,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        SegmentStream::seek(self, pos).map_err(Into::into)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Everything the background thread needs, moved into it on open.
struct FetchWorker<H> {
    label: String,
    segments: Arc<[Segment<H>]>,
    fetcher: Arc<dyn SegmentFetcher<H>>,
    plan: Vec<FetchSpec>,
    buffer: Arc<BoundedStreamBuffer>,
    state: Arc<Mutex<StreamState>>,
    chunk_size: usize,
    /// Segment index of the fetch in progress
    current: Cell<usize>,
}

impl<H> FetchWorker<H> {
    fn run(self) {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.copy_segments()));

        // Before the buffer reports end of data, so a reader seeing it also
        // sees the stream draining.
        {
            let mut state = lock(&self.state);
            if *state == StreamState::Fetching {
                *state = StreamState::Draining;
            }
        }

        match outcome {
            Ok(Ok(())) => {
                self.buffer.flush();
                log::debug!("stream/{}: all fetches done", self.label);
            }
            Ok(Err(StreamError::Closed)) => {
                log::debug!(
                    "stream/{}: closed while fetching segment {}, stopping",
                    self.label,
                    self.current.get()
                );
            }
            Ok(Err(err)) => {
                log::error!("stream/{}: {}", self.label, err);
                self.buffer.fail(err);
            }
            Err(_) => {
                log::error!(
                    "stream/{}: worker panicked on segment {}",
                    self.label,
                    self.current.get()
                );
                self.buffer.fail(StreamError::FetchFailed {
                    index: self.current.get(),
                    reason: "fetch worker panicked".to_owned(),
                });
            }
        }
    }

    fn copy_segments(&self) -> Result<()> {
        for spec in &self.plan {
            if self.buffer.is_closed() {
                return Err(StreamError::Closed);
            }
            self.current.set(spec.index);

            log::debug!(
                "stream/{}: fetching segment {} bytes {}-{}",
                self.label,
                spec.index,
                spec.local_start,
                spec.local_end
            );
            let segment = &self.segments[spec.index];
            let mut source = self
                .fetcher
                .fetch(spec.local_start, spec.local_end, segment)
                .map_err(|err| StreamError::fetch_failed(spec.index, &err))?;

            self.copy(spec, &mut source)?;
        }
        Ok(())
    }

    /// Copies exactly `spec.len()` bytes. Extra bytes from a source that
    /// ignored the range are dropped; a source ending early is a failure.
    fn copy(&self, spec: &FetchSpec, source: &mut ByteSource) -> Result<()> {
        let expected = spec.len();
        let mut chunk = vec![0u8; self.chunk_size];
        let mut copied = 0u64;

        while copied < expected {
            let count = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    continue
                }
                Err(err) => {
                    return Err(StreamError::fetch_failed(
                        spec.index,
                        &anyhow::Error::new(err).context(format!(
                            "reading segment after {} bytes",
                            copied
                        )),
                    ))
                }
            };

            let remaining =
                usize::try_from(expected - copied).unwrap_or(usize::MAX);
            let count = count.min(remaining);
            self.buffer.write_all(&chunk[..count])?;
            copied += count as u64;
        }

        if copied < expected {
            return Err(StreamError::FetchFailed {
                index: spec.index,
                reason: format!(
                    "source ended after {} of {} bytes",
                    copied, expected
                ),
            });
        }

        log::trace!(
            "stream/{}: copied {} bytes of segment {}",
            self.label,
            copied,
            spec.index
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn fixed_fetcher(
        data: Vec<u8>,
    ) -> impl Fn(u64, u64, &Segment<()>) -> anyhow::Result<ByteSource> {
        move |start: u64, end: u64, _segment: &Segment<()>| {
            let bytes = data[start as usize..=end as usize].to_vec();
            Ok(Box::new(Cursor::new(bytes)) as ByteSource)
        }
    }

    fn config() -> StreamConfig {
        StreamConfig::default()
            .with_label("unit")
            .with_capacity(16)
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[test]
    fn lifecycle_moves_through_states() {
        let stream = SegmentStream::from_file(
            Segment::new(8, ()),
            RequestedRange::full(),
            fixed_fetcher(b"abcdefgh".to_vec()),
            config(),
        )
        .unwrap();
        assert_eq!(stream.state(), StreamState::Unopened);
        assert_eq!(stream.position(), 0);

        let mut out = Vec::new();
        (&stream).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefgh");
        assert_eq!(stream.position(), 8);
        assert_eq!(stream.state(), StreamState::Draining);

        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(matches!(
            stream.read(&mut [0u8; 4]),
            Err(StreamError::Closed)
        ));
    }

    #[test]
    fn read_only_surface() {
        let stream = SegmentStream::from_file(
            Segment::new(8, ()),
            RequestedRange::full(),
            fixed_fetcher(vec![0; 8]),
            config(),
        )
        .unwrap();

        assert!(stream.can_read() && stream.can_seek() && !stream.can_write());
        assert!(matches!(
            stream.write(b"x"),
            Err(StreamError::Unsupported("write"))
        ));
        assert!(matches!(
            stream.flush(),
            Err(StreamError::Unsupported("flush"))
        ));
        assert!(matches!(
            stream.set_len(3),
            Err(StreamError::Unsupported("set_len"))
        ));
        assert_eq!(stream.state(), StreamState::Unopened);
    }

    #[test]
    fn open_after_close_fails() {
        let stream = SegmentStream::from_file(
            Segment::new(4, ()),
            RequestedRange::full(),
            fixed_fetcher(vec![1; 4]),
            config(),
        )
        .unwrap();
        stream.close();
        assert!(matches!(stream.open(), Err(StreamError::Closed)));
    }

    #[test]
    fn seek_end_is_relative_to_length() {
        let stream = SegmentStream::from_file(
            Segment::new(8, ()),
            RequestedRange::bounded(2, 7),
            fixed_fetcher(b"abcdefgh".to_vec()),
            config(),
        )
        .unwrap();
        assert_eq!(stream.len(), 6);

        let mut out = Vec::new();
        (&stream).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"cdefgh");

        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 4);
        let mut tail = [0u8; 2];
        assert_eq!(stream.read(&mut tail).unwrap(), 2);
        assert_eq!(&tail, b"gh");

        assert!(matches!(
            stream.seek(SeekFrom::End(-7)),
            Err(StreamError::OutOfRange(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SegmentStream::from_file(
            Segment::new(4, ()),
            RequestedRange::full(),
            fixed_fetcher(vec![1; 4]),
            config().with_capacity(0),
        );
        assert!(matches!(result, Err(StreamError::Config(_))));

        let result = SegmentStream::from_file(
            Segment::new(4, ()),
            RequestedRange::full(),
            fixed_fetcher(vec![1; 4]),
            config().with_label("bad\0label"),
        );
        assert!(matches!(result, Err(StreamError::Config(_))));
    }
}
