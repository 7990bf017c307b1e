//! blobio: structured message codec and seekable storage channels.
//!
//! This crate provides the transfer-side building blocks for blob uploads
//! and downloads: a segmented, CRC64-protected message envelope
//! ([`message`]), a buffered seekable channel over pluggable read/write
//! behaviors ([`channel`]), and the legacy chunked input/output streams that
//! drive async dispatch hooks ([`stream`]).

pub mod channel;
pub mod checksum;
pub mod config;
pub mod errors;
pub mod message;
pub mod metrics;
pub mod stream;

pub use channel::{ChannelMode, StorageSeekableByteChannel};
pub use errors::{ErrorKind, Result, StorageIoError};
pub use message::{MessageFlags, StructuredMessageDecoder, StructuredMessageEncoder};
pub use stream::{StorageInputStream, StorageOutputStream};
