//! Chunked, buffered output stream.
//!
//! Writes accumulate until `write_threshold` bytes are buffered. Each full
//! chunk is then handed to [`ChunkWriter::dispatch_write`], and the stream
//! waits for it to finish before accepting more data. The first failure is
//! kept and re-raised from every later call. Once closed, the stream
//! rejects further writes.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use metrics::counter;
use tracing::{debug, warn};

use super::dispatch::{Blocker, ChunkWriter};
use crate::errors::{Result, StorageIoError};
use crate::metrics::STREAM_DISPATCHES_TOTAL;

/// Buffered writer that uploads in `write_threshold`-sized chunks.
#[derive(Debug)]
pub struct StorageOutputStream<W> {
    writer: W,
    blocker: Blocker,
    write_threshold: usize,
    buffer: BytesMut,
    /// Bytes successfully dispatched so far; offset of the next chunk.
    offset: u64,
    last_error: Option<Arc<StorageIoError>>,
    closed: bool,
}

impl<W: ChunkWriter> StorageOutputStream<W> {
    pub fn new(writer: W, write_threshold: usize) -> Result<Self> {
        if write_threshold == 0 {
            return Err(StorageIoError::invalid_argument(
                "write threshold must be at least 1",
            ));
        }
        Ok(Self {
            writer,
            blocker: Blocker::new(),
            write_threshold,
            buffer: BytesMut::with_capacity(write_threshold),
            offset: 0,
            last_error: None,
            closed: false,
        })
    }

    /// Total bytes handed to the writer so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_state(&self) -> Result<()> {
        if self.closed {
            return Err(StorageIoError::StreamClosed);
        }
        if let Some(err) = &self.last_error {
            return Err(StorageIoError::StreamFault(Arc::clone(err)));
        }
        Ok(())
    }

    fn record_fault(&mut self, err: StorageIoError) -> StorageIoError {
        warn!(error = %err, offset = self.offset, "output stream faulted");
        let fault = Arc::new(err);
        self.last_error = Some(Arc::clone(&fault));
        StorageIoError::StreamFault(fault)
    }

    /// Buffer all of `src`, dispatching every full chunk along the way.
    pub fn write(&mut self, mut src: &[u8]) -> Result<()> {
        self.check_state()?;
        while !src.is_empty() {
            let n = src.len().min(self.write_threshold - self.buffer.len());
            self.buffer.extend_from_slice(&src[..n]);
            src = &src[n..];
            if self.buffer.len() == self.write_threshold {
                self.dispatch()?;
            }
        }
        Ok(())
    }

    /// Dispatch any buffered partial chunk.
    pub fn flush(&mut self) -> Result<()> {
        self.check_state()?;
        if !self.buffer.is_empty() {
            self.dispatch()?;
        }
        Ok(())
    }

    /// Flush, commit, and close. The stream is closed afterwards even if
    /// this fails. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.blocker.check_context()?;
        let result = self.flush().and_then(|()| self.commit());
        self.closed = true;
        self.buffer = BytesMut::new();
        if result.is_ok() {
            debug!(bytes = self.offset, "output stream closed");
        }
        result
    }

    fn commit(&mut self) -> Result<()> {
        match self.blocker.block_on(self.writer.commit())? {
            Ok(()) => Ok(()),
            Err(e) => Err(self.record_fault(StorageIoError::Transfer(e))),
        }
    }

    /// Hand the buffered bytes to the writer and wait for completion.
    fn dispatch(&mut self) -> Result<()> {
        // Checked before the buffer is handed off so nothing is lost.
        self.blocker.check_context()?;
        let data = self.buffer.split().freeze();
        let len = data.len();
        counter!(STREAM_DISPATCHES_TOTAL, "direction" => "write").increment(1);
        match self
            .blocker
            .block_on(self.writer.dispatch_write(data, len, self.offset))?
        {
            Ok(()) => {
                self.offset += len as u64;
                Ok(())
            }
            Err(e) => Err(self.record_fault(StorageIoError::Transfer(e))),
        }
    }
}

impl<W> Drop for StorageOutputStream<W> {
    fn drop(&mut self) {
        if !self.closed && !self.buffer.is_empty() {
            warn!(
                pending = self.buffer.len(),
                "output stream dropped without close; buffered bytes discarded"
            );
        }
    }
}

impl<W: ChunkWriter> io::Write for StorageOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StorageOutputStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        StorageOutputStream::flush(self).map_err(Into::into)
    }
}

// -- Tests --------------------------------------------------------------------
