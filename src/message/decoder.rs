//! Incremental structured message decoder.
//!
//! Wire bytes may arrive in chunks of any size, including chunks that split a
//! metadata region. Partial metadata is staged until the region is complete.
//! Content bytes are emitted as soon as they arrive.
//!
//! Checksums are verified as the footers are read. A mismatch fails the
//! `decode` call that completed the footer. The on-wire values stay
//! available through [`StructuredMessageDecoder::segment_crc64s`] and
//! [`StructuredMessageDecoder::message_crc64`].

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use metrics::counter;
use tracing::{debug, trace, warn};

use super::layout::{
    MessageFlags, MessageLayout, Region, RegionCursor, MAX_METADATA_LENGTH, MESSAGE_VERSION_1,
};
use crate::checksum::Crc64;
use crate::errors::{Result, StorageIoError};
use crate::metrics::{CHECKSUM_MISMATCHES_TOTAL, DECODED_BYTES_TOTAL, DECODED_SEGMENTS_TOTAL};

/// Decodes one structured message into its content bytes.
#[derive(Debug)]
pub struct StructuredMessageDecoder {
    layout: MessageLayout,
    cursor: RegionCursor,
    /// Staging area for the metadata region currently being read.
    staged: [u8; MAX_METADATA_LENGTH],
    segment_crc: Crc64,
    message_crc: Crc64,
    segment_crc64s: BTreeMap<u16, u64>,
    message_crc64: Option<u64>,
    finished: bool,
}

impl StructuredMessageDecoder {
    /// Create a decoder for a message carrying `content_length` decoded
    /// bytes split into `segment_size` segments.
    pub fn new(content_length: u64, segment_size: u64, flags: MessageFlags) -> Result<Self> {
        let layout = MessageLayout::new(content_length, segment_size, flags)?;
        Ok(Self {
            cursor: layout.start(),
            layout,
            staged: [0; MAX_METADATA_LENGTH],
            segment_crc: Crc64::new(),
            message_crc: Crc64::new(),
            segment_crc64s: BTreeMap::new(),
            message_crc64: None,
            finished: false,
        })
    }

    pub fn layout(&self) -> &MessageLayout {
        &self.layout
    }

    /// Total encoded length the decoder expects to consume.
    pub fn message_length(&self) -> u64 {
        self.layout.message_length()
    }

    /// Absolute offset of the next wire byte to be consumed.
    pub fn tell(&self) -> u64 {
        self.layout.tell(&self.cursor)
    }

    /// Content bytes emitted so far.
    pub fn content_offset(&self) -> u64 {
        self.cursor.content_offset
    }

    pub fn region(&self) -> Region {
        self.cursor.region
    }

    /// `true` once the message footer has been consumed.
    pub fn is_complete(&self) -> bool {
        self.finished
    }

    /// On-wire CRC64 of each segment whose footer has been read.
    pub fn segment_crc64s(&self) -> &BTreeMap<u16, u64> {
        &self.segment_crc64s
    }

    /// On-wire CRC64 of the whole message, once its footer has been read.
    pub fn message_crc64(&self) -> Option<u64> {
        self.message_crc64
    }

    /// Decode one chunk of wire bytes, returning the content it carried.
    pub fn decode(&mut self, input: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(input.len());
        self.decode_into(input, &mut out)?;
        Ok(out.freeze())
    }

    /// Decode one chunk of wire bytes, appending content to `out`.
    ///
    /// The whole chunk is consumed. Returns the number of content bytes
    /// appended.
    pub fn decode_into(&mut self, mut input: &[u8], out: &mut BytesMut) -> Result<usize> {
        let mut emitted = 0usize;

        loop {
            if self.finished {
                if !input.is_empty() {
                    return Err(StorageIoError::UnexpectedLength {
                        expected: self.layout.message_length(),
                        actual: self.layout.message_length() + input.len() as u64,
                    });
                }
                break;
            }

            if self.cursor.region_complete() {
                self.complete_region()?;
                if !self.layout.advance(&mut self.cursor) {
                    self.finished = true;
                }
                continue;
            }

            if input.is_empty() {
                break;
            }

            let remaining = usize::try_from(self.cursor.region_remaining()).unwrap_or(usize::MAX);
            let take = input.len().min(remaining);
            let (chunk, rest) = input.split_at(take);
            if self.cursor.region == Region::SegmentContent {
                if self.layout.has_crc64() {
                    self.segment_crc.update(chunk);
                    self.message_crc.update(chunk);
                }
                out.extend_from_slice(chunk);
                counter!(DECODED_BYTES_TOTAL).increment(take as u64);
                self.cursor.content_offset += take as u64;
                emitted += take;
            } else {
                let at = self.cursor.region_offset as usize;
                self.staged[at..at + take].copy_from_slice(chunk);
            }
            self.cursor.region_offset += take as u64;
            input = rest;
        }

        Ok(emitted)
    }

    /// Fail unless the whole message has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.finished {
            Ok(())
        } else {
            Err(StorageIoError::UnexpectedLength {
                expected: self.layout.message_length(),
                actual: self.tell(),
            })
        }
    }

    /// Interpret the region the cursor just filled.
    fn complete_region(&mut self) -> Result<()> {
        let region_start = self.tell() - self.cursor.region_length;
        match self.cursor.region {
            Region::MessageHeader => self.read_message_header(region_start),
            Region::SegmentHeader => self.read_segment_header(region_start),
            Region::SegmentContent => Ok(()),
            Region::SegmentFooter => self.read_segment_footer(),
            Region::MessageFooter => self.read_message_footer(),
        }
    }

    fn read_message_header(&self, offset: u64) -> Result<()> {
        let header = &self.staged;
        let version = header[0];
        let message_length = u64::from_le_bytes(le_array(&header[1..9]));
        let raw_flags = u16::from_le_bytes(le_array(&header[9..11]));
        let num_segments = u16::from_le_bytes(le_array(&header[11..13]));

        if version != MESSAGE_VERSION_1 {
            return Err(StorageIoError::corrupt(
                offset,
                format!("unsupported message version {version}"),
            ));
        }
        if message_length != self.layout.message_length() {
            return Err(StorageIoError::corrupt(
                offset,
                format!(
                    "header declares message length {message_length}, expected {}",
                    self.layout.message_length()
                ),
            ));
        }
        let flags = MessageFlags::from_bits(raw_flags).ok_or_else(|| {
            StorageIoError::corrupt(offset, format!("unknown message flags {raw_flags:#06x}"))
        })?;
        if flags != self.layout.flags() {
            return Err(StorageIoError::corrupt(
                offset,
                format!(
                    "header declares flags {:#06x}, expected {:#06x}",
                    flags.bits(),
                    self.layout.flags().bits()
                ),
            ));
        }
        if num_segments != self.layout.num_segments() {
            return Err(StorageIoError::corrupt(
                offset,
                format!(
                    "header declares {num_segments} segments, expected {}",
                    self.layout.num_segments()
                ),
            ));
        }

        trace!(message_length, num_segments, "structured message header read");
        Ok(())
    }

    fn read_segment_header(&mut self, offset: u64) -> Result<()> {
        let number = u16::from_le_bytes(le_array(&self.staged[0..2]));
        let length = u64::from_le_bytes(le_array(&self.staged[2..10]));
        let expected_number = self.cursor.segment_number;
        let expected_length = self.layout.segment_content_length(expected_number);

        if number != expected_number {
            return Err(StorageIoError::corrupt(
                offset,
                format!("found segment number {number}, expected {expected_number}"),
            ));
        }
        if length != expected_length {
            return Err(StorageIoError::corrupt(
                offset,
                format!("segment {number} declares {length} bytes, expected {expected_length}"),
            ));
        }

        self.segment_crc.reset();
        Ok(())
    }

    fn read_segment_footer(&mut self) -> Result<()> {
        let segment = self.cursor.segment_number;
        if self.layout.has_crc64() {
            let wire = u64::from_le_bytes(le_array(&self.staged[0..8]));
            self.segment_crc64s.insert(segment, wire);
            let computed = self.segment_crc.value();
            if wire != computed {
                warn!(segment, wire, computed, "segment CRC64 mismatch");
                counter!(CHECKSUM_MISMATCHES_TOTAL).increment(1);
                return Err(StorageIoError::ChecksumMismatch {
                    segment: Some(segment),
                    expected: wire,
                    actual: computed,
                });
            }
        }

        counter!(DECODED_SEGMENTS_TOTAL).increment(1);
        debug!(
            segment,
            of = self.layout.num_segments(),
            content_offset = self.cursor.content_offset,
            "segment decoded"
        );
        Ok(())
    }

    fn read_message_footer(&mut self) -> Result<()> {
        if !self.layout.has_crc64() {
            return Ok(());
        }
        let wire = u64::from_le_bytes(le_array(&self.staged[0..8]));
        self.message_crc64 = Some(wire);
        let computed = self.message_crc.value();
        if wire != computed {
            warn!(wire, computed, "message CRC64 mismatch");
            counter!(CHECKSUM_MISMATCHES_TOTAL).increment(1);
            return Err(StorageIoError::ChecksumMismatch {
                segment: None,
                expected: wire,
                actual: computed,
            });
        }
        Ok(())
    }
}

/// Copy a fixed-width little-endian field out of a staged slice.
pub(crate) fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Decode a complete message held in memory.
pub fn decode_all(
    wire: &[u8],
    content_length: u64,
    segment_size: u64,
    flags: MessageFlags,
) -> Result<Bytes> {
    let mut decoder = StructuredMessageDecoder::new(content_length, segment_size, flags)?;
    let content = decoder.decode(wire)?;
    decoder.finish()?;
    Ok(content)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;

    /// Hand-assemble a V1 message so the decoder is tested independently of
    /// the encoder.
    fn assemble(content: &[u8], segment_size: usize, crc: bool) -> Vec<u8> {
        let chunks: Vec<&[u8]> = if content.is_empty() {
            vec![&[][..]]
        } else {
            content.chunks(segment_size).collect()
        };
        let footer = if crc { 8 } else { 0 };
        let message_length = 13 + chunks.len() * (10 + footer) + content.len() + footer;

        let mut wire = Vec::with_capacity(message_length);
        wire.push(1u8);
        wire.extend_from_slice(&(message_length as u64).to_le_bytes());
        wire.extend_from_slice(&(crc as u16).to_le_bytes());
        wire.extend_from_slice(&(chunks.len() as u16).to_le_bytes());
        for (i, chunk) in chunks.iter().enumerate() {
            wire.extend_from_slice(&(i as u16 + 1).to_le_bytes());
            wire.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
            wire.extend_from_slice(chunk);
            if crc {
                wire.extend_from_slice(&checksum::compute(chunk).to_le_bytes());
            }
        }
        if crc {
            wire.extend_from_slice(&checksum::compute(content).to_le_bytes());
        }
        assert_eq!(wire.len(), message_length);
        wire
    }

    #[test]
    fn test_decode_ten_bytes_three_segments() {
        let content = b"0123456789";
        let wire = assemble(content, 4, true);
        let mut decoder = StructuredMessageDecoder::new(10, 4, MessageFlags::STORAGE_CRC64).unwrap();
        assert_eq!(decoder.message_length(), wire.len() as u64);

        let out = decoder.decode(&wire).unwrap();
        assert_eq!(&out[..], content);
        assert!(decoder.is_complete());
        assert_eq!(decoder.tell(), decoder.message_length());
        assert_eq!(decoder.segment_crc64s().len(), 3);
        assert_eq!(decoder.segment_crc64s()[&1], checksum::compute(b"0123"));
        assert_eq!(decoder.segment_crc64s()[&2], checksum::compute(b"4567"));
        assert_eq!(decoder.segment_crc64s()[&3], checksum::compute(b"89"));
        assert_eq!(decoder.message_crc64(), Some(checksum::compute(content)));
    }

    #[test]
    fn test_decode_empty_content() {
        let wire = assemble(b"", 4, true);
        assert_eq!(wire.len(), 13 + 10 + 8 + 8);
        let mut decoder = StructuredMessageDecoder::new(0, 4, MessageFlags::STORAGE_CRC64).unwrap();
        assert_eq!(decoder.layout().num_segments(), 1);
        let out = decoder.decode(&wire).unwrap();
        assert!(out.is_empty());
        decoder.finish().unwrap();
        assert_eq!(decoder.segment_crc64s().keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_decode_without_crc() {
        let content = b"hello, structured world";
        let wire = assemble(content, 5, false);
        let out = decode_all(&wire, content.len() as u64, 5, MessageFlags::NONE).unwrap();
        assert_eq!(&out[..], content);
    }

    #[test]
    fn test_decode_byte_by_byte_cursor_is_monotonic() {
        let content: Vec<u8> = (0..37u8).collect();
        let wire = assemble(&content, 8, true);
        let mut decoder =
            StructuredMessageDecoder::new(content.len() as u64, 8, MessageFlags::STORAGE_CRC64)
                .unwrap();
        let mut out = BytesMut::new();
        let mut last = decoder.tell();
        for byte in &wire {
            decoder.decode_into(std::slice::from_ref(byte), &mut out).unwrap();
            let now = decoder.tell();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, decoder.message_length());
        assert!(decoder.is_complete());
        assert_eq!(&out[..], &content[..]);
    }

    #[test]
    fn test_decode_arbitrary_splits() {
        let content: Vec<u8> = (0..100u32).map(|i| (i * 7) as u8).collect();
        let wire = assemble(&content, 16, true);
        for chunk_size in [1usize, 2, 3, 9, 13, 17, 64, wire.len()] {
            let mut decoder = StructuredMessageDecoder::new(100, 16, MessageFlags::STORAGE_CRC64)
                .unwrap();
            let mut out = BytesMut::new();
            for piece in wire.chunks(chunk_size) {
                decoder.decode_into(piece, &mut out).unwrap();
            }
            decoder.finish().unwrap();
            assert_eq!(&out[..], &content[..], "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_segment_checksum_mismatch_is_reported() {
        let mut wire = assemble(b"0123456789", 4, true);
        // Flip a content byte in segment 2 (header 13 + seg1 22 + seg2 header 10).
        wire[13 + 22 + 10] ^= 0xff;
        let mut decoder = StructuredMessageDecoder::new(10, 4, MessageFlags::STORAGE_CRC64).unwrap();
        let err = decoder.decode(&wire).unwrap_err();
        match err {
            StorageIoError::ChecksumMismatch { segment, .. } => assert_eq!(segment, Some(2)),
            other => panic!("unexpected error: {other:?}"),
        }
        // The on-wire value is still recorded for the caller.
        assert!(decoder.segment_crc64s().contains_key(&2));
    }

    #[test]
    fn test_message_checksum_mismatch_is_reported() {
        let mut wire = assemble(b"0123456789", 4, true);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let err = decode_all(&wire, 10, 4, MessageFlags::STORAGE_CRC64).unwrap_err();
        assert!(matches!(
            err,
            StorageIoError::ChecksumMismatch { segment: None, .. }
        ));
    }

    #[test]
    fn test_bad_version_is_corrupt() {
        let mut wire = assemble(b"abc", 4, true);
        wire[0] = 2;
        let err = decode_all(&wire, 3, 4, MessageFlags::STORAGE_CRC64).unwrap_err();
        assert_eq!(err.code(), "Corrupt");
    }

    #[test]
    fn test_header_length_mismatch_is_corrupt() {
        let wire = assemble(b"abcdef", 4, true);
        // Declared content length disagrees with the header's message length.
        let err = decode_all(&wire, 5, 4, MessageFlags::STORAGE_CRC64).unwrap_err();
        assert_eq!(err.code(), "Corrupt");
    }

    #[test]
    fn test_flags_mismatch_is_corrupt() {
        let wire = assemble(b"abcdef", 4, false);
        let err = decode_all(&wire, 6, 4, MessageFlags::STORAGE_CRC64).unwrap_err();
        assert_eq!(err.code(), "Corrupt");
    }

    #[test]
    fn test_segment_number_out_of_order_is_corrupt() {
        let mut wire = assemble(b"0123456789", 4, false);
        // Segment 2 header starts at 13 + (10 + 4).
        wire[27] = 5;
        let err = decode_all(&wire, 10, 4, MessageFlags::NONE).unwrap_err();
        match err {
            StorageIoError::Corrupt { offset, .. } => assert_eq!(offset, 27),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut wire = assemble(b"abc", 4, true);
        wire.push(0);
        let err = decode_all(&wire, 3, 4, MessageFlags::STORAGE_CRC64).unwrap_err();
        assert_eq!(err.code(), "UnexpectedLength");
    }

    #[test]
    fn test_truncated_message_fails_finish() {
        let wire = assemble(b"abcdefgh", 4, true);
        let err = decode_all(&wire[..wire.len() - 3], 8, 4, MessageFlags::STORAGE_CRC64)
            .unwrap_err();
        assert_eq!(err.code(), "UnexpectedLength");
    }

    #[test]
    fn test_zero_segment_size_rejected() {
        let err = StructuredMessageDecoder::new(1, 0, MessageFlags::NONE).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn test_decoded_bytes_counted_when_call_fails() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let content = b"abcdefgh";
        let mut wire = assemble(content, 4, true);
        // Second segment footer sits just before the message footer.
        let second_footer = wire.len() - 16;
        wire[second_footer] ^= 0x01;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let mut out = BytesMut::new();
        let err = ::metrics::with_local_recorder(&recorder, || {
            let mut decoder =
                StructuredMessageDecoder::new(8, 4, MessageFlags::STORAGE_CRC64).unwrap();
            decoder.decode_into(&wire, &mut out).unwrap_err()
        });
        assert_eq!(err.code(), "ChecksumMismatch");
        assert_eq!(&out[..], content);
        assert!(handle.render().contains("blobio_decoded_bytes_total 8"));
    }
}
