//! Buffered seekable byte channel over a remote resource.
//!
//! A channel is opened either for reading or for writing, never both. Reads
//! are served from a fixed-size buffer that is refilled on demand through
//! the [`ReadBehavior`]. Seeking inside the buffered span moves the cursor
//! without I/O, and seeking outside it invalidates the buffer. Writes
//! accumulate in the buffer and are flushed through the [`WriteBehavior`]
//! each time it fills, and once more on close.

use std::io::{self, SeekFrom};

use metrics::counter;
use tracing::{debug, trace};

use super::behavior::{ReadBehavior, WriteBehavior};
use crate::errors::{Result, StorageIoError};
use crate::metrics::{CHANNEL_FLUSHES_TOTAL, CHANNEL_REFILLS_TOTAL};

/// Direction a channel was opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Read,
    Write,
}

enum Behavior {
    Read(Box<dyn ReadBehavior>),
    Write(Box<dyn WriteBehavior>),
}

/// Fixed-capacity buffer with a cursor and a fill limit.
struct ChannelBuffer {
    data: Box<[u8]>,
    position: usize,
    limit: usize,
}

impl ChannelBuffer {
    fn new(capacity: usize, limit: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            position: 0,
            limit,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn remaining(&self) -> usize {
        self.limit - self.position
    }

    fn invalidate(&mut self) {
        self.position = 0;
        self.limit = 0;
    }
}

/// Random-access channel over a remote resource.
pub struct StorageSeekableByteChannel {
    behavior: Behavior,
    /// Released on close.
    buffer: Option<ChannelBuffer>,
    /// Absolute offset of the buffer's first byte within the resource.
    buffer_absolute_position: u64,
    /// Caller-visible cursor (read mode).
    absolute_position: u64,
}

impl StorageSeekableByteChannel {
    /// Open a read-mode channel. The first read triggers a refill.
    pub fn open_read(chunk_size: usize, reader: Box<dyn ReadBehavior>) -> Result<Self> {
        check_chunk_size(chunk_size)?;
        Ok(Self {
            behavior: Behavior::Read(reader),
            buffer: Some(ChannelBuffer::new(chunk_size, 0)),
            buffer_absolute_position: 0,
            absolute_position: 0,
        })
    }

    /// Open a write-mode channel with an empty buffer.
    pub fn open_write(chunk_size: usize, writer: Box<dyn WriteBehavior>) -> Result<Self> {
        check_chunk_size(chunk_size)?;
        Ok(Self {
            behavior: Behavior::Write(writer),
            buffer: Some(ChannelBuffer::new(chunk_size, chunk_size)),
            buffer_absolute_position: 0,
            absolute_position: 0,
        })
    }

    pub fn mode(&self) -> ChannelMode {
        match self.behavior {
            Behavior::Read(_) => ChannelMode::Read,
            Behavior::Write(_) => ChannelMode::Write,
        }
    }

    pub fn is_open(&self) -> bool {
        self.buffer.is_some()
    }

    /// Copy buffered bytes into `dst`, refilling the buffer first when it is
    /// exhausted. Returns 0 at the end of the resource.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let Behavior::Read(reader) = &mut self.behavior else {
            return Err(StorageIoError::NonReadableChannel);
        };
        let buffer = self.buffer.as_mut().ok_or(StorageIoError::ClosedChannel)?;
        if dst.is_empty() {
            return Ok(0);
        }

        if buffer.remaining() == 0 {
            let n = reader.read(&mut buffer.data, self.absolute_position)?;
            // Behaviors report their own count; reject one larger than the buffer.
            if n > buffer.capacity() {
                return Err(StorageIoError::UnexpectedLength {
                    expected: buffer.capacity() as u64,
                    actual: n as u64,
                });
            }
            counter!(CHANNEL_REFILLS_TOTAL).increment(1);
            trace!(offset = self.absolute_position, bytes = n, "channel buffer refilled");

            self.buffer_absolute_position = self.absolute_position;
            buffer.position = 0;
            buffer.limit = n;
            if n == 0 {
                return Ok(0);
            }
        }

        let n = buffer.remaining().min(dst.len());
        dst[..n].copy_from_slice(&buffer.data[buffer.position..buffer.position + n]);
        buffer.position += n;
        self.absolute_position += n as u64;
        Ok(n)
    }

    /// Buffer as much of `src` as fits, flushing when the buffer fills.
    /// Returns the number of bytes taken; callers loop for the rest.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        let Behavior::Write(writer) = &mut self.behavior else {
            return Err(StorageIoError::NonWritableChannel);
        };
        let buffer = self.buffer.as_mut().ok_or(StorageIoError::ClosedChannel)?;
        if src.is_empty() {
            return Ok(0);
        }

        let n = src.len().min(buffer.capacity() - buffer.position);
        buffer.data[buffer.position..buffer.position + n].copy_from_slice(&src[..n]);
        buffer.position += n;

        if buffer.position == buffer.capacity() {
            // On failure the bytes from `src` are not counted as accepted.
            if let Err(e) = flush_buffer(writer.as_mut(), buffer, &mut self.buffer_absolute_position) {
                buffer.position -= n;
                return Err(e);
            }
        }
        Ok(n)
    }

    /// Write all of `src`, looping over [`write`](Self::write).
    pub fn write_all(&mut self, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let n = self.write(src)?;
            src = &src[n..];
        }
        Ok(())
    }

    /// Caller-visible cursor. In write mode this is the number of bytes
    /// accepted so far.
    pub fn position(&self) -> Result<u64> {
        let buffer = self.buffer.as_ref().ok_or(StorageIoError::ClosedChannel)?;
        Ok(match self.behavior {
            Behavior::Read(_) => self.absolute_position,
            Behavior::Write(_) => self.buffer_absolute_position + buffer.position as u64,
        })
    }

    /// Move the read cursor. Positions inside the buffered span reuse the
    /// buffer; anything else invalidates it.
    pub fn set_position(&mut self, new_position: u64) -> Result<()> {
        let Behavior::Read(_) = self.behavior else {
            return Err(StorageIoError::NonReadableChannel);
        };
        let buffer = self.buffer.as_mut().ok_or(StorageIoError::ClosedChannel)?;

        let start = self.buffer_absolute_position;
        let end = start + buffer.limit as u64;
        if new_position < start || new_position > end {
            buffer.invalidate();
        } else {
            buffer.position = (new_position - start) as usize;
        }
        self.absolute_position = new_position;
        Ok(())
    }

    /// Read mode: the read behavior's cached length. Write mode: bytes
    /// accepted so far.
    pub fn size(&self) -> Result<u64> {
        let buffer = self.buffer.as_ref().ok_or(StorageIoError::ClosedChannel)?;
        Ok(match &self.behavior {
            Behavior::Read(reader) => reader.cached_length(),
            Behavior::Write(_) => self.buffer_absolute_position + buffer.position as u64,
        })
    }

    /// Resizing a storage resource through a channel is not supported.
    pub fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(StorageIoError::UnsupportedOperation(
            "storage channels cannot be truncated",
        ))
    }

    /// Close the channel, flushing buffered writes. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };
        if let Behavior::Write(writer) = &mut self.behavior {
            if buffer.position > 0 {
                flush_buffer(writer.as_mut(), &mut buffer, &mut self.buffer_absolute_position)?;
            }
            debug!(bytes = self.buffer_absolute_position, "write channel closed");
        }
        Ok(())
    }
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(StorageIoError::invalid_argument(
            "channel chunk size must be at least 1",
        ));
    }
    Ok(())
}

/// Hand the buffered bytes to `writer` and empty the buffer.
fn flush_buffer(
    writer: &mut dyn WriteBehavior,
    buffer: &mut ChannelBuffer,
    buffer_absolute_position: &mut u64,
) -> Result<()> {
    let len = buffer.position;
    writer.write(&buffer.data[..len], *buffer_absolute_position)?;
    counter!(CHANNEL_FLUSHES_TOTAL).increment(1);
    trace!(offset = *buffer_absolute_position, bytes = len, "channel buffer flushed");
    *buffer_absolute_position += len as u64;
    buffer.position = 0;
    Ok(())
}

impl io::Read for StorageSeekableByteChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StorageSeekableByteChannel::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for StorageSeekableByteChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StorageSeekableByteChannel::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        let Behavior::Write(writer) = &mut self.behavior else {
            return Ok(());
        };
        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| io::Error::from(StorageIoError::ClosedChannel))?;
        if buffer.position > 0 {
            flush_buffer(writer.as_mut(), buffer, &mut self.buffer_absolute_position)?;
        }
        Ok(())
    }
}

impl io::Seek for StorageSeekableByteChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.position()?.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size()?.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::from(StorageIoError::invalid_argument(
                "seek position out of range",
            ))
        })?;
        self.set_position(target)?;
        Ok(target)
    }
}

// -- Tests --------------------------------------------------------------------
