//! Structured message codec.
//!
//! A structured message wraps blob content in a segmented, self-describing
//! envelope with optional CRC64 checksums per segment and for the whole
//! message. [`layout`] defines the wire shape and region state machine
//! shared by the [`decoder`] and [`encoder`].

pub mod decoder;
pub mod encoder;
pub mod layout;

pub use decoder::{decode_all, StructuredMessageDecoder};
pub use encoder::{encode_all, StructuredMessageEncoder};
pub use layout::{MessageFlags, MessageLayout, Region, RegionCursor};
