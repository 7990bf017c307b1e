//! Dispatch hooks for the legacy chunked streams.
//!
//! The transfer layer implements these with async I/O (HTTP range GETs,
//! block uploads). Each stream blocks on one dispatch at a time, so chunk
//! N+1 is never issued before chunk N has completed.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

use crate::errors::{Result, StorageIoError};

/// Boxed future returned by dispatch hooks.
pub type DispatchFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Fetches ranges of a remote resource for [`StorageInputStream`].
///
/// [`StorageInputStream`]: super::input::StorageInputStream
pub trait ChunkReader: Send + Sync {
    /// Fetch `read_length` bytes starting at absolute `offset`.
    fn dispatch_read(&self, read_length: usize, offset: u64) -> DispatchFuture<'_, Bytes>;
}

/// Uploads chunks for [`StorageOutputStream`].
///
/// [`StorageOutputStream`]: super::output::StorageOutputStream
pub trait ChunkWriter: Send + Sync {
    /// Upload the first `write_length` bytes of `data` at absolute `offset`.
    fn dispatch_write(&self, data: Bytes, write_length: usize, offset: u64)
        -> DispatchFuture<'_, ()>;

    /// Finalize the upload once every chunk has been written.
    fn commit(&self) -> DispatchFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Turns dispatch futures into blocking calls.
///
/// Outside any async runtime the future runs on a private current-thread
/// runtime, built on first use. On a multi-thread runtime the worker thread
/// is handed over with `block_in_place`. A current-thread runtime cannot be
/// blocked, so calls made there fail with
/// [`StorageIoError::BlockingInAsyncContext`].
#[derive(Debug)]
pub(crate) struct Blocker {
    runtime: Option<Runtime>,
}

impl Blocker {
    pub(crate) fn new() -> Self {
        Self { runtime: None }
    }

    /// Fail early if the calling thread cannot block.
    pub(crate) fn check_context(&self) -> Result<()> {
        ambient_handle().map(|_| ())
    }

    /// Drive `future` to completion on the calling thread. The outer result
    /// reports whether blocking was possible; the inner one is the hook's.
    pub(crate) fn block_on<T>(
        &mut self,
        future: DispatchFuture<'_, T>,
    ) -> Result<anyhow::Result<T>> {
        if let Some(handle) = ambient_handle()? {
            return Ok(tokio::task::block_in_place(|| handle.block_on(future)));
        }
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| {
                    StorageIoError::Transfer(anyhow::anyhow!("failed to build dispatch runtime: {e}"))
                })?,
        };
        let output = runtime.block_on(future);
        self.runtime = Some(runtime);
        Ok(output)
    }
}

impl Drop for Blocker {
    fn drop(&mut self) {
        // Never blocks, so dropping a stream inside async code is safe.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// The surrounding runtime, if the caller is on a multi-thread one.
fn ambient_handle() -> Result<Option<Handle>> {
    match Handle::try_current() {
        Err(_) => Ok(None),
        Ok(handle) => match handle.runtime_flavor() {
            RuntimeFlavor::MultiThread => Ok(Some(handle)),
            _ => Err(StorageIoError::BlockingInAsyncContext),
        },
    }
}
