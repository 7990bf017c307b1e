//! Seekable storage channels.
//!
//! The [`seekable::StorageSeekableByteChannel`] routes all of its I/O
//! through the [`behavior::ReadBehavior`] / [`behavior::WriteBehavior`]
//! seams, so the same channel works over memory, local files, or a remote
//! transfer layer.

pub mod behavior;
pub mod seekable;

pub use behavior::{FileResource, MemoryResource, ReadBehavior, WriteBehavior};
pub use seekable::{ChannelMode, StorageSeekableByteChannel};
