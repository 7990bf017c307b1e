//! Read/write behaviors backing a [`StorageSeekableByteChannel`].
//!
//! The channel never talks to a remote service itself. The transfer layer
//! supplies a [`ReadBehavior`] (for example a ranged download) or a
//! [`WriteBehavior`] (for example staged block uploads), and the channel
//! only buffers.
//!
//! Two ready-made resources live here: [`MemoryResource`] for tests and
//! embedding, and [`FileResource`] for local files.
//!
//! [`StorageSeekableByteChannel`]: super::seekable::StorageSeekableByteChannel

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Source of bytes for a read-mode channel.
pub trait ReadBehavior: Send {
    /// Fill as much of `dst` as possible with bytes starting at absolute
    /// `source_offset`. Returning 0 signals the end of the resource.
    fn read(&mut self, dst: &mut [u8], source_offset: u64) -> anyhow::Result<usize>;

    /// Most recently known total length of the resource.
    fn cached_length(&self) -> u64;
}

/// Sink of bytes for a write-mode channel.
///
/// Offsets presented by the channel are strictly increasing and never
/// overlap.
pub trait WriteBehavior: Send {
    fn write(&mut self, src: &[u8], dest_offset: u64) -> anyhow::Result<()>;
}

// -- In-memory resource -------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    reads: Vec<u64>,
    writes: Vec<(u64, usize)>,
}

/// Shared in-memory blob implementing both behaviors.
///
/// Clones share the same bytes, so one handle can be given to a channel
/// while another inspects the result. Every call is recorded, which lets
/// tests assert how many refills or flushes a channel issued.
#[derive(Debug, Clone, Default)]
pub struct MemoryResource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryResource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                data: data.into(),
                ..MemoryState::default()
            })),
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory resource lock poisoned"))
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().map(|s| s.data.clone()).unwrap_or_default()
    }

    /// Source offsets of every read issued so far.
    pub fn read_offsets(&self) -> Vec<u64> {
        self.lock().map(|s| s.reads.clone()).unwrap_or_default()
    }

    /// `(offset, length)` of every write issued so far.
    pub fn write_calls(&self) -> Vec<(u64, usize)> {
        self.lock().map(|s| s.writes.clone()).unwrap_or_default()
    }
}

impl ReadBehavior for MemoryResource {
    fn read(&mut self, dst: &mut [u8], source_offset: u64) -> anyhow::Result<usize> {
        let mut state = self.lock()?;
        state.reads.push(source_offset);
        let len = state.data.len() as u64;
        if source_offset >= len {
            return Ok(0);
        }
        let start = source_offset as usize;
        let n = dst.len().min(state.data.len() - start);
        dst[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    fn cached_length(&self) -> u64 {
        self.lock().map(|s| s.data.len() as u64).unwrap_or(0)
    }
}

impl WriteBehavior for MemoryResource {
    fn write(&mut self, src: &[u8], dest_offset: u64) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        state.writes.push((dest_offset, src.len()));
        let start = usize::try_from(dest_offset)?;
        let end = start + src.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(src);
        Ok(())
    }
}

// -- Local file resource ------------------------------------------------------

/// Positioned reads and writes against a local file.
#[derive(Debug)]
pub struct FileResource {
    file: File,
    cached_length: u64,
}

impl FileResource {
    /// Open an existing file for reading.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        let cached_length = file.metadata()?.len();
        Ok(Self {
            file,
            cached_length,
        })
    }

    /// Create (or truncate) a file for writing.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", path.display()))?;
        Ok(Self {
            file,
            cached_length: 0,
        })
    }

    /// Flush file contents to disk.
    pub fn sync(&self) -> anyhow::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl ReadBehavior for FileResource {
    fn read(&mut self, dst: &mut [u8], source_offset: u64) -> anyhow::Result<usize> {
        self.file.seek(SeekFrom::Start(source_offset))?;
        let mut filled = 0;
        while filled < dst.len() {
            match self.file.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn cached_length(&self) -> u64 {
        self.cached_length
    }
}

impl WriteBehavior for FileResource {
    fn write(&mut self, src: &[u8], dest_offset: u64) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(dest_offset))?;
        self.file.write_all(src)?;
        self.cached_length = self.cached_length.max(dest_offset + src.len() as u64);
        Ok(())
    }
}

// -- Tests --------------------------------------------------------------------
