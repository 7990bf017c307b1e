//! Structured message encoder.
//!
//! Wraps a content source and produces the encoded message through
//! [`std::io::Read`]. CRC64 footers are computed from the content as it
//! streams past.
//!
//! The encoder can rewind to any offset it has already produced so a failed
//! upload can retry from a position. Rewinding re-reads the source from the
//! start up to the target so the running checksums are rebuilt exactly.
//! Seeking forward is not supported.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use metrics::counter;
use tracing::debug;

use super::layout::{
    MessageFlags, MessageLayout, Region, RegionCursor, MAX_METADATA_LENGTH, MESSAGE_VERSION_1,
};
use crate::checksum::Crc64;
use crate::errors::{Result, StorageIoError};
use crate::metrics::ENCODED_BYTES_TOTAL;

/// Scratch size used when replaying content after a rewind.
const REPLAY_CHUNK: usize = 8 * 1024;

/// Encodes `content_length` bytes from `source` into a structured message.
pub struct StructuredMessageEncoder<R> {
    source: R,
    /// Source position that corresponds to content offset 0.
    source_origin: u64,
    layout: MessageLayout,
    cursor: RegionCursor,
    /// Rendered bytes of the current metadata region.
    staged: [u8; MAX_METADATA_LENGTH],
    segment_crc: Crc64,
    message_crc: Crc64,
}

impl<R: Read + Seek> StructuredMessageEncoder<R> {
    /// Create an encoder reading content from the current position of
    /// `source`.
    pub fn new(
        mut source: R,
        content_length: u64,
        segment_size: u64,
        flags: MessageFlags,
    ) -> Result<Self> {
        let layout = MessageLayout::new(content_length, segment_size, flags)?;
        let source_origin = source.stream_position()?;
        let mut encoder = Self {
            source,
            source_origin,
            cursor: layout.start(),
            layout,
            staged: [0; MAX_METADATA_LENGTH],
            segment_crc: Crc64::new(),
            message_crc: Crc64::new(),
        };
        encoder.render_region();
        Ok(encoder)
    }

    pub fn layout(&self) -> &MessageLayout {
        &self.layout
    }

    pub fn message_length(&self) -> u64 {
        self.layout.message_length()
    }

    /// Absolute offset of the next wire byte to be produced.
    pub fn tell(&self) -> u64 {
        self.layout.tell(&self.cursor)
    }

    /// Give back the content source.
    pub fn into_inner(self) -> R {
        self.source
    }

    /// Fill `buf` with the next encoded bytes. Returns 0 once the whole
    /// message has been produced.
    pub fn read_wire(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0usize;

        while written < buf.len() {
            if self.cursor.region_complete() {
                if !self.layout.advance(&mut self.cursor) {
                    break;
                }
                self.render_region();
                continue;
            }

            let remaining = usize::try_from(self.cursor.region_remaining()).unwrap_or(usize::MAX);
            let want = (buf.len() - written).min(remaining);
            let dst = &mut buf[written..written + want];

            let n = if self.cursor.region == Region::SegmentContent {
                let n = self.source.read(dst)?;
                if n == 0 {
                    return Err(StorageIoError::UnexpectedLength {
                        expected: self.layout.content_length(),
                        actual: self.cursor.content_offset,
                    });
                }
                if self.layout.has_crc64() {
                    self.segment_crc.update(&dst[..n]);
                    self.message_crc.update(&dst[..n]);
                }
                self.cursor.content_offset += n as u64;
                n
            } else {
                let at = self.cursor.region_offset as usize;
                dst.copy_from_slice(&self.staged[at..at + want]);
                want
            };

            self.cursor.region_offset += n as u64;
            written += n;
        }

        if written > 0 {
            counter!(ENCODED_BYTES_TOTAL).increment(written as u64);
        }
        Ok(written)
    }

    /// Rewind to absolute message offset `position`.
    ///
    /// `position` must not be ahead of [`tell`](Self::tell).
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        let current = self.tell();
        if position > current {
            return Err(StorageIoError::UnsupportedOperation(
                "structured message encoder cannot seek forward",
            ));
        }
        if position == current {
            return Ok(());
        }

        let target = self.layout.locate(position)?;
        debug!(from = current, to = position, "rewinding structured message encoder");

        self.source.seek(SeekFrom::Start(self.source_origin))?;
        self.segment_crc.reset();
        self.message_crc.reset();

        let segment_start = if target.segment_number == 0 {
            0
        } else {
            self.layout.segment_start(target.segment_number)
        };
        self.replay(segment_start, false)?;
        self.replay(target.content_offset - segment_start, true)?;

        self.cursor = target;
        self.render_region();
        Ok(())
    }

    /// Re-read `len` content bytes, folding them into the message checksum
    /// and, when `in_segment`, the segment checksum.
    fn replay(&mut self, mut len: u64, in_segment: bool) -> Result<()> {
        let mut scratch = [0u8; REPLAY_CHUNK];
        while len > 0 {
            let want = usize::try_from(len).unwrap_or(REPLAY_CHUNK).min(REPLAY_CHUNK);
            let n = self.source.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(StorageIoError::UnexpectedLength {
                    expected: self.layout.content_length(),
                    actual: self.layout.content_length() - len,
                });
            }
            if self.layout.has_crc64() {
                self.message_crc.update(&scratch[..n]);
                if in_segment {
                    self.segment_crc.update(&scratch[..n]);
                }
            }
            len -= n as u64;
        }
        Ok(())
    }

    /// Render the metadata bytes for the region the cursor is in.
    fn render_region(&mut self) {
        let staged = &mut self.staged;
        match self.cursor.region {
            Region::MessageHeader => {
                staged[0] = MESSAGE_VERSION_1;
                staged[1..9].copy_from_slice(&self.layout.message_length().to_le_bytes());
                staged[9..11].copy_from_slice(&self.layout.flags().bits().to_le_bytes());
                staged[11..13].copy_from_slice(&self.layout.num_segments().to_le_bytes());
            }
            Region::SegmentHeader => {
                let n = self.cursor.segment_number;
                staged[0..2].copy_from_slice(&n.to_le_bytes());
                staged[2..10].copy_from_slice(&self.layout.segment_content_length(n).to_le_bytes());
                // A rewind into the header restarts the segment checksum.
                if self.cursor.region_offset == 0 {
                    self.segment_crc.reset();
                }
            }
            Region::SegmentContent => {}
            Region::SegmentFooter => {
                if self.layout.has_crc64() {
                    staged[0..8].copy_from_slice(&self.segment_crc.value().to_le_bytes());
                }
            }
            Region::MessageFooter => {
                if self.layout.has_crc64() {
                    staged[0..8].copy_from_slice(&self.message_crc.value().to_le_bytes());
                }
            }
        }
    }
}

impl<R: Read + Seek> Read for StructuredMessageEncoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_wire(buf).map_err(Into::into)
    }
}

impl<R: Read + Seek> Seek for StructuredMessageEncoder<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(delta) => i128::from(self.tell()) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.message_length()) + i128::from(delta),
        };
        let target = u64::try_from(target).map_err(|_| {
            io::Error::from(StorageIoError::invalid_argument(
                "cannot seek before the start of the message",
            ))
        })?;
        self.seek_to(target)?;
        Ok(target)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.tell())
    }
}

/// Encode an in-memory buffer.
pub fn encode_all(content: &[u8], segment_size: u64, flags: MessageFlags) -> Result<Bytes> {
    let mut encoder = StructuredMessageEncoder::new(
        io::Cursor::new(content),
        content.len() as u64,
        segment_size,
        flags,
    )?;
    let mut wire = Vec::with_capacity(encoder.message_length() as usize);
    encoder.read_to_end(&mut wire)?;
    Ok(Bytes::from(wire))
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::message::decoder::{decode_all, StructuredMessageDecoder};

    #[test]
    fn test_encode_layout_bytes() {
        let wire = encode_all(b"0123456789", 4, MessageFlags::STORAGE_CRC64).unwrap();
        assert_eq!(wire.len(), 13 + 3 * 18 + 10 + 8);
        assert_eq!(wire[0], 1);
        assert_eq!(u64::from_le_bytes(wire[1..9].try_into().unwrap()), wire.len() as u64);
        assert_eq!(u16::from_le_bytes(wire[9..11].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(wire[11..13].try_into().unwrap()), 3);
        // First segment header and content.
        assert_eq!(u16::from_le_bytes(wire[13..15].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(wire[15..23].try_into().unwrap()), 4);
        assert_eq!(&wire[23..27], b"0123");
        assert_eq!(
            u64::from_le_bytes(wire[27..35].try_into().unwrap()),
            checksum::compute(b"0123")
        );
        let tail = wire.len() - 8;
        assert_eq!(
            u64::from_le_bytes(wire[tail..].try_into().unwrap()),
            checksum::compute(b"0123456789")
        );
    }

    #[test]
    fn test_round_trip_recovers_content_and_segment_crcs() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let len = rng.gen_range(0..300usize);
            let segment_size = rng.gen_range(1..64u64);
            let content: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let wire = encode_all(&content, segment_size, MessageFlags::STORAGE_CRC64).unwrap();
            let mut decoder = StructuredMessageDecoder::new(
                len as u64,
                segment_size,
                MessageFlags::STORAGE_CRC64,
            )
            .unwrap();
            let out = decoder.decode(&wire).unwrap();
            decoder.finish().unwrap();
            assert_eq!(&out[..], &content[..]);

            let chunks: Vec<&[u8]> = if content.is_empty() {
                vec![&[][..]]
            } else {
                content.chunks(segment_size as usize).collect()
            };
            assert_eq!(decoder.segment_crc64s().len(), chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(decoder.segment_crc64s()[&(i as u16 + 1)], checksum::compute(chunk));
            }
        }
    }

    #[test]
    fn test_round_trip_without_crc() {
        let content = vec![0xabu8; 1000];
        let wire = encode_all(&content, 100, MessageFlags::NONE).unwrap();
        assert_eq!(wire.len(), 13 + 10 * 10 + 1000);
        let out = decode_all(&wire, 1000, 100, MessageFlags::NONE).unwrap();
        assert_eq!(&out[..], &content[..]);
    }

    #[test]
    fn test_small_reads_match_bulk_encode() {
        let content: Vec<u8> = (0..77u8).collect();
        let bulk = encode_all(&content, 10, MessageFlags::STORAGE_CRC64).unwrap();
        let mut encoder = StructuredMessageEncoder::new(
            io::Cursor::new(&content[..]),
            77,
            10,
            MessageFlags::STORAGE_CRC64,
        )
        .unwrap();
        let mut wire = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = encoder.read_wire(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            wire.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&wire[..], &bulk[..]);
        assert_eq!(encoder.tell(), encoder.message_length());
    }

    #[test]
    fn test_rewind_reproduces_identical_bytes() {
        let content: Vec<u8> = (0..50u8).map(|b| b.wrapping_mul(13)).collect();
        let bulk = encode_all(&content, 8, MessageFlags::STORAGE_CRC64).unwrap();

        for target in 0..=bulk.len() as u64 {
            let mut encoder = StructuredMessageEncoder::new(
                io::Cursor::new(&content[..]),
                50,
                8,
                MessageFlags::STORAGE_CRC64,
            )
            .unwrap();
            let mut sink = Vec::new();
            encoder.read_to_end(&mut sink).unwrap();
            encoder.seek_to(target).unwrap();
            assert_eq!(encoder.tell(), target);

            let mut rest = Vec::new();
            encoder.read_to_end(&mut rest).unwrap();
            assert_eq!(&rest[..], &bulk[target as usize..], "rewind to {target}");
        }
    }

    #[test]
    fn test_forward_seek_is_unsupported() {
        let mut encoder = StructuredMessageEncoder::new(
            io::Cursor::new(b"abcdef".to_vec()),
            6,
            4,
            MessageFlags::STORAGE_CRC64,
        )
        .unwrap();
        let mut buf = [0u8; 5];
        encoder.read_wire(&mut buf).unwrap();
        let err = encoder.seek_to(6).unwrap_err();
        assert_eq!(err.code(), "UnsupportedOperation");
        encoder.seek_to(5).unwrap();
        encoder.seek_to(0).unwrap();

        let io_err = Seek::seek(&mut encoder, SeekFrom::Current(1)).unwrap_err();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_source_offset_is_respected() {
        let mut source = io::Cursor::new(b"xxxxhello".to_vec());
        source.set_position(4);
        let mut encoder =
            StructuredMessageEncoder::new(source, 5, 2, MessageFlags::STORAGE_CRC64).unwrap();
        let mut wire = Vec::new();
        encoder.read_to_end(&mut wire).unwrap();
        encoder.seek_to(0).unwrap();
        let mut again = Vec::new();
        encoder.read_to_end(&mut again).unwrap();
        assert_eq!(wire, again);
        assert_eq!(&decode_all(&wire, 5, 2, MessageFlags::STORAGE_CRC64).unwrap()[..], b"hello");
    }

    #[test]
    fn test_short_source_is_unexpected_length() {
        let mut encoder = StructuredMessageEncoder::new(
            io::Cursor::new(b"abc".to_vec()),
            10,
            4,
            MessageFlags::NONE,
        )
        .unwrap();
        let mut buf = vec![0u8; 128];
        let err = encoder.read_wire(&mut buf).unwrap_err();
        assert_eq!(err.code(), "UnexpectedLength");
    }

    #[test]
    fn test_rewind_with_maximal_segment_size() {
        let content = b"0123456789";
        let mut encoder = StructuredMessageEncoder::new(
            io::Cursor::new(content.to_vec()),
            10,
            u64::MAX,
            MessageFlags::STORAGE_CRC64,
        )
        .unwrap();
        let mut head = vec![0u8; 30];
        encoder.read_exact(&mut head).unwrap();
        encoder.seek_to(25).unwrap();
        assert_eq!(encoder.tell(), 25);

        let mut rest = Vec::new();
        encoder.read_to_end(&mut rest).unwrap();
        let mut wire = head[..25].to_vec();
        wire.extend_from_slice(&rest);
        let decoded = decode_all(&wire, 10, u64::MAX, MessageFlags::STORAGE_CRC64).unwrap();
        assert_eq!(&decoded[..], content);
    }
}
