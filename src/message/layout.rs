//! Structured message V1 layout and region state machine.
//!
//! Both the encoder and the decoder drive a [`RegionCursor`] through the
//! same [`MessageLayout`], so region lengths and transitions are defined in
//! exactly one place.
//!
//! Wire layout (little-endian):
//!
//! ```text
//! message header   version u8 | message length u64 | flags u16 | segment count u16
//! segment header   segment number u16 | segment content length u64
//! segment content  opaque bytes
//! segment footer   crc64 u64                         (STORAGE_CRC64 only)
//! ...              repeated per segment
//! message footer   crc64 u64 over all content        (STORAGE_CRC64 only)
//! ```

use bitflags::bitflags;

use crate::errors::{Result, StorageIoError};

/// The only message version this crate reads or writes.
pub const MESSAGE_VERSION_1: u8 = 1;

/// Length of the V1 message header.
pub const V1_HEADER_LENGTH: u64 = 13;

/// Length of a V1 segment header.
pub const V1_SEGMENT_HEADER_LENGTH: u64 = 10;

/// Length of an embedded CRC64 footer.
pub const CRC64_LENGTH: u64 = 8;

/// Largest metadata region; sizes the staging buffers.
pub(crate) const MAX_METADATA_LENGTH: usize = V1_HEADER_LENGTH as usize;

bitflags! {
    /// Message-level feature bits carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u16 {
        /// Every segment and the message carry a CRC64 footer.
        const STORAGE_CRC64 = 0x0001;
    }
}

impl MessageFlags {
    /// No optional features.
    pub const NONE: Self = Self::empty();
}

/// What kind of bytes the codec is currently producing or consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    MessageHeader,
    SegmentHeader,
    SegmentContent,
    SegmentFooter,
    MessageFooter,
}

impl Region {
    /// Transition table. `more_segments` is only consulted when leaving a
    /// segment footer. `MessageFooter` is terminal.
    pub fn next(self, more_segments: bool) -> Option<Region> {
        match (self, more_segments) {
            (Region::MessageHeader, _) => Some(Region::SegmentHeader),
            (Region::SegmentHeader, _) => Some(Region::SegmentContent),
            (Region::SegmentContent, _) => Some(Region::SegmentFooter),
            (Region::SegmentFooter, true) => Some(Region::SegmentHeader),
            (Region::SegmentFooter, false) => Some(Region::MessageFooter),
            (Region::MessageFooter, _) => None,
        }
    }

    /// Everything except segment content is fixed-layout metadata.
    pub fn is_metadata(self) -> bool {
        self != Region::SegmentContent
    }
}

/// Position record driving an encode or decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionCursor {
    pub region: Region,
    pub region_length: u64,
    /// Bytes already produced/consumed within the current region.
    pub region_offset: u64,
    /// Content bytes produced/consumed overall.
    pub content_offset: u64,
    /// 1-based; 0 while still in the message header.
    pub segment_number: u16,
}

impl RegionCursor {
    pub fn region_remaining(&self) -> u64 {
        self.region_length - self.region_offset
    }

    pub fn region_complete(&self) -> bool {
        self.region_offset == self.region_length
    }
}

/// Derived shape of one structured message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLayout {
    content_length: u64,
    segment_size: u64,
    flags: MessageFlags,
    num_segments: u16,
    message_length: u64,
}

impl MessageLayout {
    /// Derive the layout for `content_length` bytes split into
    /// `segment_size`-byte segments.
    pub fn new(content_length: u64, segment_size: u64, flags: MessageFlags) -> Result<Self> {
        if segment_size == 0 {
            return Err(StorageIoError::invalid_argument(
                "segment size must be at least 1",
            ));
        }

        let segments = if content_length == 0 {
            1
        } else {
            content_length.div_ceil(segment_size)
        };
        let num_segments = u16::try_from(segments).map_err(|_| {
            StorageIoError::invalid_argument(format!(
                "{content_length} bytes in {segment_size}-byte segments needs {segments} segments, more than the {} a message can hold",
                u16::MAX
            ))
        })?;

        let footer = footer_length(flags);
        let message_length = segments
            .checked_mul(V1_SEGMENT_HEADER_LENGTH + footer)
            .and_then(|meta| meta.checked_add(V1_HEADER_LENGTH + footer))
            .and_then(|meta| meta.checked_add(content_length))
            .ok_or_else(|| StorageIoError::invalid_argument("message length overflows u64"))?;

        Ok(Self {
            content_length,
            segment_size,
            flags,
            num_segments,
            message_length,
        })
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn num_segments(&self) -> u16 {
        self.num_segments
    }

    /// Total encoded length, metadata included.
    pub fn message_length(&self) -> u64 {
        self.message_length
    }

    pub fn has_crc64(&self) -> bool {
        self.flags.contains(MessageFlags::STORAGE_CRC64)
    }

    /// Content length of segment `n` (1-based). The last segment holds the
    /// remainder.
    pub fn segment_content_length(&self, n: u16) -> u64 {
        if n == 0 || n > self.num_segments {
            return 0;
        }
        if n == self.num_segments {
            self.content_length - self.segment_start(n)
        } else {
            self.segment_size
        }
    }

    /// Content offset at which segment `n` begins.
    pub fn segment_start(&self, n: u16) -> u64 {
        u64::from(n.saturating_sub(1)) * self.segment_size
    }

    /// Byte length of `region` for segment `n`.
    pub fn region_length(&self, region: Region, n: u16) -> u64 {
        match region {
            Region::MessageHeader => V1_HEADER_LENGTH,
            Region::SegmentHeader => V1_SEGMENT_HEADER_LENGTH,
            Region::SegmentContent => self.segment_content_length(n),
            Region::SegmentFooter | Region::MessageFooter => footer_length(self.flags),
        }
    }

    /// Cursor at the very start of the message.
    pub fn start(&self) -> RegionCursor {
        RegionCursor {
            region: Region::MessageHeader,
            region_length: V1_HEADER_LENGTH,
            region_offset: 0,
            content_offset: 0,
            segment_number: 0,
        }
    }

    /// Move a completed cursor into the next region. Returns `false` once
    /// the message footer is done.
    pub fn advance(&self, cursor: &mut RegionCursor) -> bool {
        let more_segments = cursor.segment_number < self.num_segments;
        let Some(next) = cursor.region.next(more_segments) else {
            return false;
        };
        match (cursor.region, next) {
            (Region::MessageHeader, Region::SegmentHeader) => cursor.segment_number = 1,
            (Region::SegmentFooter, Region::SegmentHeader) => cursor.segment_number += 1,
            _ => {}
        }
        cursor.region = next;
        cursor.region_offset = 0;
        cursor.region_length = self.region_length(next, cursor.segment_number);
        true
    }

    /// Absolute message offset where segment `n`'s header begins.
    fn segment_offset(&self, n: u16) -> u64 {
        let before = u64::from(n.saturating_sub(1));
        V1_HEADER_LENGTH
            + before * (V1_SEGMENT_HEADER_LENGTH + footer_length(self.flags))
            + before * self.segment_size
    }

    /// Absolute message offset of `cursor`.
    pub fn tell(&self, cursor: &RegionCursor) -> u64 {
        let n = cursor.segment_number;
        let region_start = match cursor.region {
            Region::MessageHeader => 0,
            Region::SegmentHeader => self.segment_offset(n),
            Region::SegmentContent => self.segment_offset(n) + V1_SEGMENT_HEADER_LENGTH,
            Region::SegmentFooter => {
                self.segment_offset(n) + V1_SEGMENT_HEADER_LENGTH + self.segment_content_length(n)
            }
            Region::MessageFooter => self.message_length - footer_length(self.flags),
        };
        region_start + cursor.region_offset
    }

    /// Map an absolute message offset back to a cursor.
    pub fn locate(&self, position: u64) -> Result<RegionCursor> {
        if position > self.message_length {
            return Err(StorageIoError::invalid_argument(format!(
                "position {position} is past the end of a {}-byte message",
                self.message_length
            )));
        }
        let footer = footer_length(self.flags);

        if position < V1_HEADER_LENGTH {
            let mut cursor = self.start();
            cursor.region_offset = position;
            return Ok(cursor);
        }

        let footer_start = self.message_length - footer;
        if position >= footer_start {
            return Ok(RegionCursor {
                region: Region::MessageFooter,
                region_length: footer,
                region_offset: position - footer_start,
                content_offset: self.content_length,
                segment_number: self.num_segments,
            });
        }

        let stride = (V1_SEGMENT_HEADER_LENGTH + footer).saturating_add(self.segment_size);
        let index = ((position - V1_HEADER_LENGTH) / stride).min(u64::from(self.num_segments) - 1);
        // `index` < num_segments <= u16::MAX.
        let n = index as u16 + 1;
        let within = position - self.segment_offset(n);
        let start = self.segment_start(n);
        let content = self.segment_content_length(n);

        let cursor = if within < V1_SEGMENT_HEADER_LENGTH {
            RegionCursor {
                region: Region::SegmentHeader,
                region_length: V1_SEGMENT_HEADER_LENGTH,
                region_offset: within,
                content_offset: start,
                segment_number: n,
            }
        } else if within < V1_SEGMENT_HEADER_LENGTH + content {
            let into = within - V1_SEGMENT_HEADER_LENGTH;
            RegionCursor {
                region: Region::SegmentContent,
                region_length: content,
                region_offset: into,
                content_offset: start + into,
                segment_number: n,
            }
        } else {
            RegionCursor {
                region: Region::SegmentFooter,
                region_length: footer,
                region_offset: within - V1_SEGMENT_HEADER_LENGTH - content,
                content_offset: start + content,
                segment_number: n,
            }
        };
        Ok(cursor)
    }
}

fn footer_length(flags: MessageFlags) -> u64 {
    if flags.contains(MessageFlags::STORAGE_CRC64) {
        CRC64_LENGTH
    } else {
        0
    }
}

// -- Tests --------------------------------------------------------------------
