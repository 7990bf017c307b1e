//! Legacy chunked input/output streams over async dispatch hooks.

pub mod dispatch;
pub mod input;
pub mod output;

pub use dispatch::{ChunkReader, ChunkWriter, DispatchFuture};
pub use input::StorageInputStream;
pub use output::StorageOutputStream;
