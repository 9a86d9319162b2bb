//! Fixed-capacity FIFO byte buffer between one producer and one consumer.
//!
//! The buffer is a sliding window over a strictly increasing byte stream.
//! Offsets are absolute: `window_start` is the offset of the first retained
//! byte, `read_pos` the next byte handed to the reader and `written` the end
//! of everything admitted so far.
//!
//! # Invariants
//! - `window_start <= read_pos <= written`
//! - `written - window_start <= capacity`
//! - Bytes already read stay retained (and seekable) until a write needs
//!   their room.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};

struct BufferState {
    data: VecDeque<u8>,
    window_start: u64,
    read_pos: u64,
    flushed: bool,
    closed: bool,
    failure: Option<StreamError>,
}

impl BufferState {
    fn written(&self) -> u64 {
        self.window_start + self.data.len() as u64
    }

    fn unread(&self) -> usize {
        (self.written() - self.read_pos) as usize
    }
}

pub struct BoundedStreamBuffer {
    /// Label for logging
    label: String,
    capacity: usize,
    read_timeout: Duration,
    write_timeout: Duration,
    state: Mutex<BufferState>,
    readable: Condvar,
    writable: Condvar,
}

impl BoundedStreamBuffer {
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn new(
        label: String,
        capacity: usize,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        assert!(capacity > 0, "Buffer capacity can't be zero");

        log::trace!("buffer/{}: allocated {} bytes", label, capacity);
        Self {
            label,
            capacity,
            read_timeout,
            write_timeout,
            state: Mutex::new(BufferState {
                data: VecDeque::with_capacity(capacity),
                window_start: 0,
                read_pos: 0,
                flushed: false,
                closed: false,
                failure: None,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.label.clone(),
            config.buffer_capacity,
            config.read_timeout,
            config.write_timeout,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written but not read yet.
    pub fn len(&self) -> usize {
        self.lock().unread()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.lock().read_pos
    }

    /// Absolute offsets `[start, end)` that are currently retained.
    pub fn window(&self) -> (u64, u64) {
        let state = self.lock();
        (state.window_start, state.written())
    }

    pub fn is_flushed(&self) -> bool {
        self.lock().flushed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Admits as many bytes of `data` as currently fit and returns how many
    /// were taken. Blocks while the buffer is full, up to the write timeout.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.write_timeout;
        let mut state = self.lock();
        let free = loop {
            if state.closed || state.flushed {
                return Err(StreamError::Closed);
            }

            let free = self.capacity - state.unread();
            if free > 0 {
                break free;
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "buffer/{}: write timed out with {} unread bytes",
                    self.label,
                    self.capacity
                );
                return Err(StreamError::Timeout("write", self.write_timeout));
            }
            state = self
                .writable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };

        let count = free.min(data.len());

        // Make room by dropping bytes the reader has already consumed
        let overflow = (state.data.len() + count).saturating_sub(self.capacity);
        if overflow > 0 {
            state.data.drain(..overflow);
            state.window_start += overflow as u64;
        }
        state
            .data
            .extend(data[..count].iter().copied());

        self.readable.notify_all();
        Ok(count)
    }

    /// Writes the whole chunk, waiting for room as often as needed.
    /// Each wait is bounded by the write timeout.
    pub fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let count = self.write(data)?;
            data = &data[count..];
        }
        Ok(())
    }

    /// Moves up to `buf.len()` bytes into `buf`, in the order they were
    /// written. Returns `0` only once the producer flushed and every byte
    /// was read; blocks otherwise, up to the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(StreamError::Closed);
            }

            let unread = state.unread();
            if unread > 0 {
                let count = unread.min(buf.len());
                let offset = (state.read_pos - state.window_start) as usize;
                for (dst, src) in buf
                    .iter_mut()
                    .zip(state.data.range(offset..offset + count))
                {
                    *dst = *src;
                }
                state.read_pos += count as u64;

                self.writable.notify_all();
                return Ok(count);
            }

            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            if state.flushed {
                return Ok(0);
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "buffer/{}: read timed out at offset {}",
                    self.label,
                    state.read_pos
                );
                return Err(StreamError::Timeout("read", self.read_timeout));
            }
            state = self
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Producer-side end of data. Idempotent.
    pub fn flush(&self) {
        let mut state = self.lock();
        if !state.flushed {
            state.flushed = true;
            log::trace!(
                "buffer/{}: flushed at offset {}",
                self.label,
                state.written()
            );
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Ends the data with an error. Readers get the bytes buffered so far
    /// and then `err` instead of end-of-stream. Only the first failure is
    /// kept.
    pub fn fail(&self, err: StreamError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            log::debug!("buffer/{}: producer failed: {}", self.label, err);
            state.failure = Some(err);
        }
        state.flushed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Terminates the data with `err`. Unlike [`BoundedStreamBuffer::fail`],
    /// retained bytes are dropped, so every later read returns the error and
    /// the producer's next write is rejected.
    pub fn abort(&self, err: StreamError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            log::debug!("buffer/{}: aborted: {}", self.label, err);
            state.failure = Some(err);
        }
        let written = state.written();
        state.data = VecDeque::new();
        state.window_start = written;
        state.read_pos = written;
        state.flushed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Moves the read position inside the retained window. `End` is relative
    /// to the last written byte.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }

        let written = state.written();
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => {
                i128::from(state.read_pos) + i128::from(delta)
            }
            SeekFrom::End(delta) => i128::from(written) + i128::from(delta),
        };

        if target < i128::from(state.window_start) || target > i128::from(written)
        {
            return Err(StreamError::OutOfRange(format!(
                "offset {} is outside of retained window {}..{}",
                target, state.window_start, written
            )));
        }

        state.read_pos = target as u64;
        self.writable.notify_all();
        Ok(state.read_pos)
    }

    /// Releases the retained bytes and wakes every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.data = VecDeque::new();
            log::trace!("buffer/{}: closed", self.label);
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // No method panics while holding the lock, so the state stays
        // consistent even if a caller's thread was poisoned elsewhere.
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn buffer(capacity: usize, timeout_ms: u64) -> BoundedStreamBuffer {
        BoundedStreamBuffer::new(
            "test".to_owned(),
            capacity,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn delivers_bytes_in_order_across_threads() {
        let buffer = Arc::new(buffer(64, 5_000));
        let data = pattern(10_000);

        let producer = {
            let buffer = buffer.clone();
            let data = data.clone();
            thread::spawn(move || {
                for chunk in data.chunks(37) {
                    buffer.write_all(chunk).unwrap();
                }
                buffer.flush();
            })
        };

        let mut received = Vec::new();
        let mut chunk = [0u8; 23];
        loop {
            let count = buffer.read(&mut chunk).unwrap();
            if count == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..count]);
        }
        producer.join().unwrap();

        assert_eq!(received, data);
    }

    #[test]
    fn end_of_data_only_after_flush_and_drain() {
        let buffer = buffer(16, 50);
        buffer.write_all(b"abc").unwrap();
        buffer.flush();

        let mut out = [0u8; 2];
        assert_eq!(buffer.read(&mut out).unwrap(), 2);
        assert_eq!(&out, b"ab");
        assert_eq!(buffer.read(&mut out).unwrap(), 1);
        assert_eq!(out[0], b'c');
        assert_eq!(buffer.read(&mut out).unwrap(), 0);
        assert_eq!(buffer.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn read_times_out_on_empty_buffer() {
        let buffer = buffer(16, 30);
        let started = Instant::now();
        let mut out = [0u8; 4];

        match buffer.read(&mut out) {
            Err(StreamError::Timeout("read", _)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn write_is_partial_then_times_out_when_full() {
        let buffer = buffer(8, 30);
        assert_eq!(buffer.write(&pattern(12)).unwrap(), 8);
        assert_eq!(buffer.len(), 8);

        match buffer.write(b"x") {
            Err(StreamError::Timeout("write", _)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // capacity never grows
        assert_eq!(buffer.len(), buffer.capacity());
    }

    #[test]
    fn write_after_flush_or_close_fails() {
        let buffer = buffer(8, 30);
        buffer.flush();
        buffer.flush();
        assert!(matches!(buffer.write(b"a"), Err(StreamError::Closed)));

        let buffer = self::buffer(8, 30);
        buffer.close();
        buffer.close();
        assert!(matches!(buffer.write(b"a"), Err(StreamError::Closed)));
        assert!(buffer.is_closed());
    }

    #[test]
    fn close_unblocks_waiting_reader() {
        let buffer = Arc::new(buffer(8, 10_000));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let mut out = [0u8; 4];
                (buffer.read(&mut out), started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        buffer.close();

        let (result, elapsed) = reader.join().unwrap();
        assert!(matches!(result, Err(StreamError::Closed)));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn close_unblocks_waiting_writer() {
        let buffer = Arc::new(buffer(4, 10_000));
        buffer.write_all(b"full").unwrap();

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.write(b"more"))
        };

        thread::sleep(Duration::from_millis(50));
        buffer.close();
        assert!(matches!(writer.join().unwrap(), Err(StreamError::Closed)));
    }

    #[test]
    fn failure_is_replayed_after_buffered_bytes() {
        let buffer = buffer(16, 30);
        buffer.write_all(b"ok").unwrap();
        buffer.fail(StreamError::FetchFailed {
            index: 1,
            reason: "boom".to_owned(),
        });
        buffer.fail(StreamError::Closed);

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).unwrap(), 2);
        for _ in 0..2 {
            match buffer.read(&mut out) {
                Err(StreamError::FetchFailed { index: 1, .. }) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
    }

    #[test]
    fn abort_drops_retained_bytes_and_sticks() {
        let buffer = buffer(16, 30);
        buffer.write_all(b"pending").unwrap();
        buffer.abort(StreamError::Timeout("read", Duration::from_millis(30)));

        let mut out = [0u8; 8];
        for _ in 0..2 {
            match buffer.read(&mut out) {
                Err(StreamError::Timeout("read", _)) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(matches!(buffer.write(b"late"), Err(StreamError::Closed)));
        assert!(matches!(
            buffer.seek(SeekFrom::Start(0)),
            Err(StreamError::OutOfRange(_))
        ));
    }

    #[test]
    fn reader_woken_by_close_never_sees_end_of_data() {
        for _ in 0..100 {
            let buffer = Arc::new(buffer(8, 10_000));
            let reader = {
                let buffer = buffer.clone();
                thread::spawn(move || buffer.read(&mut [0u8; 4]))
            };

            thread::sleep(Duration::from_millis(1));
            buffer.close();
            assert!(matches!(
                reader.join().unwrap(),
                Err(StreamError::Closed)
            ));
        }
    }

    #[test]
    fn seek_within_retained_window() {
        let buffer = buffer(8, 30);
        buffer.write_all(b"abcdef").unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        assert_eq!(buffer.seek(SeekFrom::Current(-3)).unwrap(), 1);
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"bcde");

        assert_eq!(buffer.seek(SeekFrom::End(0)).unwrap(), 6);
        assert_eq!(buffer.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert!(matches!(
            buffer.seek(SeekFrom::Start(7)),
            Err(StreamError::OutOfRange(_))
        ));
    }

    #[test]
    fn seek_fails_once_bytes_slide_out() {
        let buffer = buffer(4, 30);
        buffer.write_all(b"abcd").unwrap();

        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        buffer.write_all(b"ef").unwrap();
        assert_eq!(buffer.window(), (2, 6));

        assert!(matches!(
            buffer.seek(SeekFrom::Start(1)),
            Err(StreamError::OutOfRange(_))
        ));
        assert_eq!(buffer.seek(SeekFrom::Start(2)).unwrap(), 2);
        assert_eq!(buffer.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"cdef");
    }
}
