//! Error types for the codec, channel, and stream layers.
//!
//! Every variant maps to one [`ErrorKind`] of the transfer taxonomy.
//! Collaborator failures (read/write behaviors, dispatch hooks) arrive as
//! `anyhow::Error` and are wrapped in [`StorageIoError::Transfer`], so
//! callers can simply `?` them.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageIoError>;

/// Coarse classification of a [`StorageIoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed construction parameters or call arguments.
    InvalidArgument,
    /// Structurally disallowed action.
    UnsupportedOperation,
    /// API misuse given the current state.
    IllegalState,
    /// A previously recorded failure that poisons the stream.
    StreamFault,
    /// Bytes transferred differ from the declared length.
    UnexpectedLength,
    /// Wire data failed structural or checksum validation.
    DataIntegrity,
    /// The underlying transfer layer failed.
    Transfer,
}

/// Errors raised by the structured message codec and storage channels.
#[derive(Debug, Error)]
pub enum StorageIoError {
    /// A construction parameter or argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The operation is not supported by this object.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Read attempted on a channel opened for writing.
    #[error("channel is not readable")]
    NonReadableChannel,

    /// Write attempted on a channel opened for reading.
    #[error("channel is not writable")]
    NonWritableChannel,

    /// The channel has been closed.
    #[error("channel is closed")]
    ClosedChannel,

    /// `reset()` called after the mark's read limit was exceeded.
    #[error("stream mark expired")]
    MarkExpired,

    /// The stream has been closed.
    #[error("stream is already closed")]
    StreamClosed,

    /// A blocking stream call was made on a current-thread async runtime.
    #[error("stream cannot block inside a current-thread async runtime")]
    BlockingInAsyncContext,

    /// A prior failure poisoned the stream; the original error is attached.
    #[error("stream faulted by an earlier error: {0}")]
    StreamFault(Arc<StorageIoError>),

    /// The number of bytes transferred does not match the declared length.
    #[error("unexpected length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: u64, actual: u64 },

    /// Structural corruption in an encoded message.
    #[error("corrupt structured message at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// CRC64 of a segment (`Some`) or of the whole message (`None`) differs
    /// from the value carried on the wire.
    #[error("{} CRC64 mismatch: wire {expected:#018x}, computed {actual:#018x}", describe_scope(.segment))]
    ChecksumMismatch {
        segment: Option<u16>,
        expected: u64,
        actual: u64,
    },

    /// The MD5 of sequentially read content differs from the expected digest.
    #[error("content MD5 mismatch: expected {expected}, computed {actual}")]
    Md5Mismatch { expected: String, actual: String },

    /// Catch-all for failures raised by read/write behaviors and dispatch hooks.
    #[error("transfer failed: {0}")]
    Transfer(#[from] anyhow::Error),
}

fn describe_scope(segment: &Option<u16>) -> String {
    match segment {
        Some(n) => format!("segment {n}"),
        None => "message".to_string(),
    }
}

impl StorageIoError {
    /// Shorthand for an [`StorageIoError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        StorageIoError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for a [`StorageIoError::Corrupt`].
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        StorageIoError::Corrupt {
            offset,
            reason: reason.into(),
        }
    }

    /// Return the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageIoError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            StorageIoError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            StorageIoError::NonReadableChannel
            | StorageIoError::NonWritableChannel
            | StorageIoError::ClosedChannel
            | StorageIoError::MarkExpired
            | StorageIoError::StreamClosed
            | StorageIoError::BlockingInAsyncContext => ErrorKind::IllegalState,
            StorageIoError::StreamFault(_) => ErrorKind::StreamFault,
            StorageIoError::UnexpectedLength { .. } => ErrorKind::UnexpectedLength,
            StorageIoError::Corrupt { .. }
            | StorageIoError::ChecksumMismatch { .. }
            | StorageIoError::Md5Mismatch { .. } => ErrorKind::DataIntegrity,
            StorageIoError::Transfer(_) => ErrorKind::Transfer,
        }
    }

    /// Return a stable machine-readable code string.
    pub fn code(&self) -> &'static str {
        match self {
            StorageIoError::InvalidArgument { .. } => "InvalidArgument",
            StorageIoError::UnsupportedOperation(_) => "UnsupportedOperation",
            StorageIoError::NonReadableChannel => "NonReadableChannel",
            StorageIoError::NonWritableChannel => "NonWritableChannel",
            StorageIoError::ClosedChannel => "ClosedChannel",
            StorageIoError::MarkExpired => "MarkExpired",
            StorageIoError::StreamClosed => "StreamClosed",
            StorageIoError::BlockingInAsyncContext => "BlockingInAsyncContext",
            StorageIoError::StreamFault(_) => "StreamFault",
            StorageIoError::UnexpectedLength { .. } => "UnexpectedLength",
            StorageIoError::Corrupt { .. } => "Corrupt",
            StorageIoError::ChecksumMismatch { .. } => "ChecksumMismatch",
            StorageIoError::Md5Mismatch { .. } => "Md5Mismatch",
            StorageIoError::Transfer(_) => "Transfer",
        }
    }
}

impl From<StorageIoError> for io::Error {
    fn from(err: StorageIoError) -> Self {
        let kind = match err.kind() {
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::UnsupportedOperation => io::ErrorKind::Unsupported,
            ErrorKind::IllegalState => io::ErrorKind::Other,
            ErrorKind::StreamFault | ErrorKind::Transfer => io::ErrorKind::Other,
            ErrorKind::UnexpectedLength => io::ErrorKind::UnexpectedEof,
            ErrorKind::DataIntegrity => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

impl From<io::Error> for StorageIoError {
    fn from(err: io::Error) -> Self {
        // Unwrap errors that round-tripped through an `io::Error` adapter.
        if !err
            .get_ref()
            .map_or(false, |inner| inner.is::<StorageIoError>())
        {
            return StorageIoError::Transfer(anyhow::Error::new(err));
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<StorageIoError>()) {
            Some(Ok(inner)) => *inner,
            _ => StorageIoError::Transfer(anyhow::anyhow!("i/o error ({kind:?})")),
        }
    }
}

// -- Tests --------------------------------------------------------------------
