//! Chunked, buffered input stream over a remote range.
//!
//! Bytes are fetched `chunk_size` at a time through
//! [`ChunkReader::dispatch_read`] and served from the current window.
//! `mark`/`reset` and `skip` reposition the stream without discarding data
//! physically. Either one disables content-MD5 validation, because the
//! digest only holds for one uninterrupted sequential pass.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::{Buf, Bytes};
use md5::{Digest, Md5};
use metrics::counter;
use tracing::{debug, warn};

use super::dispatch::{Blocker, ChunkReader};
use crate::errors::{Result, StorageIoError};
use crate::metrics::STREAM_DISPATCHES_TOTAL;

struct Md5Validation {
    hasher: Md5,
    expected: [u8; 16],
}

/// Buffered reader over `[range_offset, range_offset + stream_length)` of
/// a remote resource.
pub struct StorageInputStream<R> {
    reader: R,
    blocker: Blocker,
    chunk_size: usize,
    range_offset: u64,
    stream_length: u64,
    content_length: u64,
    /// Unconsumed bytes of the most recent dispatch.
    window: Bytes,
    current_absolute_read_position: u64,
    mark_position: u64,
    mark_limit: u64,
    md5: Option<Md5Validation>,
    fault: Option<Arc<StorageIoError>>,
    closed: bool,
}

impl<R: ChunkReader> StorageInputStream<R> {
    /// Open a stream over `range_length` bytes (or the rest of the content
    /// when `None`) starting at `range_offset`.
    pub fn new(
        reader: R,
        range_offset: u64,
        range_length: Option<u64>,
        chunk_size: usize,
        content_length: u64,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(StorageIoError::invalid_argument(
                "stream chunk size must be at least 1",
            ));
        }
        if range_offset > content_length {
            return Err(StorageIoError::invalid_argument(format!(
                "range offset {range_offset} is past the end of {content_length}-byte content"
            )));
        }
        let available = content_length - range_offset;
        let stream_length = range_length.map_or(available, |len| len.min(available));

        Ok(Self {
            reader,
            blocker: Blocker::new(),
            chunk_size,
            range_offset,
            stream_length,
            content_length,
            window: Bytes::new(),
            current_absolute_read_position: range_offset,
            mark_position: range_offset,
            mark_limit: 0,
            md5: None,
            fault: None,
            closed: false,
        })
    }

    /// Verify the MD5 of the content once it has been read end to end.
    ///
    /// Only applies when the stream covers the whole content.
    pub fn with_content_md5(mut self, expected: [u8; 16]) -> Self {
        if self.range_offset == 0 && self.stream_length == self.content_length {
            self.md5 = Some(Md5Validation {
                hasher: Md5::new(),
                expected,
            });
        } else {
            debug!(
                range_offset = self.range_offset,
                stream_length = self.stream_length,
                "content MD5 ignored for partial range"
            );
        }
        self
    }

    /// Like [`with_content_md5`](Self::with_content_md5), taking the
    /// base64 form carried in a `Content-MD5` header.
    pub fn with_content_md5_base64(self, header: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(header.trim())
            .map_err(|e| StorageIoError::invalid_argument(format!("invalid Content-MD5: {e}")))?;
        let expected: [u8; 16] = decoded.try_into().map_err(|_| {
            StorageIoError::invalid_argument("Content-MD5 must decode to 16 bytes")
        })?;
        Ok(self.with_content_md5(expected))
    }

    /// Absolute position of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.current_absolute_read_position
    }

    /// Number of bytes this stream covers.
    pub fn stream_length(&self) -> u64 {
        self.stream_length
    }

    /// `true` while content-MD5 validation is still armed.
    pub fn validates_md5(&self) -> bool {
        self.md5.is_some()
    }

    fn end(&self) -> u64 {
        self.range_offset + self.stream_length
    }

    fn check_state(&self) -> Result<()> {
        if self.closed {
            return Err(StorageIoError::StreamClosed);
        }
        if let Some(fault) = &self.fault {
            return Err(StorageIoError::StreamFault(Arc::clone(fault)));
        }
        Ok(())
    }

    /// Remember `err` as the stream's permanent fault.
    fn record_fault(&mut self, err: StorageIoError) -> StorageIoError {
        warn!(error = %err, position = self.current_absolute_read_position, "input stream faulted");
        let fault = Arc::new(err);
        self.fault = Some(Arc::clone(&fault));
        StorageIoError::StreamFault(fault)
    }

    /// Read up to `dst.len()` bytes. Returns 0 at the end of the range.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.check_state()?;
        if dst.is_empty() {
            return Ok(0);
        }
        if self.current_absolute_read_position >= self.end() {
            self.verify_md5()?;
            return Ok(0);
        }
        if self.window.is_empty() {
            self.fill()?;
        }

        let n = self.window.len().min(dst.len());
        dst[..n].copy_from_slice(&self.window[..n]);
        if let Some(md5) = &mut self.md5 {
            md5.hasher.update(&dst[..n]);
        }
        self.window.advance(n);
        self.current_absolute_read_position += n as u64;

        if self.current_absolute_read_position == self.end() {
            self.verify_md5()?;
        }
        Ok(n)
    }

    /// Dispatch the next chunk into the window.
    fn fill(&mut self) -> Result<()> {
        let offset = self.current_absolute_read_position;
        let remaining = self.end() - offset;
        let len = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));

        counter!(STREAM_DISPATCHES_TOTAL, "direction" => "read").increment(1);
        let result = self.blocker.block_on(self.reader.dispatch_read(len, offset))?;
        match result {
            Ok(bytes) if bytes.len() == len => {
                self.window = bytes;
                Ok(())
            }
            Ok(bytes) => Err(self.record_fault(StorageIoError::UnexpectedLength {
                expected: len as u64,
                actual: bytes.len() as u64,
            })),
            Err(e) => Err(self.record_fault(StorageIoError::Transfer(e))),
        }
    }

    fn verify_md5(&mut self) -> Result<()> {
        let Some(md5) = self.md5.take() else {
            return Ok(());
        };
        let actual: [u8; 16] = md5.hasher.finalize().into();
        if actual != md5.expected {
            return Err(self.record_fault(StorageIoError::Md5Mismatch {
                expected: hex::encode(md5.expected),
                actual: hex::encode(actual),
            }));
        }
        debug!("content MD5 verified");
        Ok(())
    }

    /// Bytes that can be read without another dispatch.
    pub fn available(&self) -> Result<usize> {
        if self.closed {
            return Err(StorageIoError::StreamClosed);
        }
        Ok(self.window.len())
    }

    /// Remember the current position. `reset` may return to it as long as
    /// no more than `read_limit` bytes have been read since.
    pub fn mark(&mut self, read_limit: u64) {
        self.mark_position = self.current_absolute_read_position;
        self.mark_limit = read_limit;
    }

    /// Return to the last mark.
    pub fn reset(&mut self) -> Result<()> {
        self.check_state()?;
        if self.mark_position.saturating_add(self.mark_limit) < self.current_absolute_read_position {
            return Err(StorageIoError::MarkExpired);
        }
        self.md5 = None;
        self.reposition(self.mark_position);
        Ok(())
    }

    /// Skip `n` bytes without reading them. Returns `n`.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.check_state()?;
        if n == 0 {
            return Ok(0);
        }
        let remaining = self.end() - self.current_absolute_read_position;
        if n > remaining {
            return Err(StorageIoError::invalid_argument(format!(
                "cannot skip {n} bytes with only {remaining} remaining"
            )));
        }
        self.md5 = None;
        match usize::try_from(n) {
            Ok(within) if within <= self.window.len() => {
                self.window.advance(within);
                self.current_absolute_read_position += n;
            }
            _ => self.reposition(self.current_absolute_read_position + n),
        }
        Ok(n)
    }

    fn reposition(&mut self, absolute_position: u64) {
        self.current_absolute_read_position = absolute_position;
        self.window = Bytes::new();
    }

    /// Close the stream. Later calls are no-ops.
    pub fn close(&mut self) {
        self.closed = true;
        self.window = Bytes::new();
    }
}

impl<R: ChunkReader> io::Read for StorageInputStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StorageInputStream::read(self, buf).map_err(Into::into)
    }
}

// -- Tests --------------------------------------------------------------------
