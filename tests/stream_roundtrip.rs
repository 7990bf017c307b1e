//! Upload through the output stream, then download through the input stream.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use md5::{Digest, Md5};
use rand::{rngs::StdRng, Rng, SeedableRng};

use blobio::message::{decode_all, MessageFlags, StructuredMessageEncoder};
use blobio::stream::{
    ChunkReader, ChunkWriter, DispatchFuture, StorageInputStream, StorageOutputStream,
};

/// Minimal blob service: appends uploaded blocks, serves range reads.
#[derive(Clone, Default)]
struct Blob {
    data: Arc<Mutex<Vec<u8>>>,
    committed: Arc<AtomicBool>,
}

impl Blob {
    fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }
}

impl ChunkWriter for Blob {
    fn dispatch_write(&self, data: Bytes, write_length: usize, offset: u64) -> DispatchFuture<'_, ()> {
        Box::pin(async move {
            let mut blob = self.data.lock().unwrap();
            anyhow::ensure!(
                blob.len() as u64 == offset,
                "block at {offset} does not follow {}",
                blob.len()
            );
            blob.extend_from_slice(&data[..write_length]);
            Ok(())
        })
    }

    fn commit(&self) -> DispatchFuture<'_, ()> {
        Box::pin(async move {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl ChunkReader for Blob {
    fn dispatch_read(&self, read_length: usize, offset: u64) -> DispatchFuture<'_, Bytes> {
        Box::pin(async move {
            let blob = self.data.lock().unwrap();
            let start = offset as usize;
            let end = (start + read_length).min(blob.len());
            Ok(Bytes::copy_from_slice(&blob[start..end]))
        })
    }
}

fn random_content(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn test_upload_then_download() {
    let content = random_content(1, 10_000);
    let blob = Blob::default();

    let mut upload = StorageOutputStream::new(blob.clone(), 1024).unwrap();
    for piece in content.chunks(333) {
        upload.write(piece).unwrap();
    }
    upload.close().unwrap();
    assert!(blob.committed.load(Ordering::SeqCst));
    assert_eq!(upload.bytes_written(), 10_000);

    let expected_md5: [u8; 16] = Md5::digest(&content).into();
    let mut download = StorageInputStream::new(blob.clone(), 0, None, 700, blob.len())
        .unwrap()
        .with_content_md5(expected_md5);
    let mut out = Vec::new();
    download.read_to_end(&mut out).unwrap();
    assert_eq!(out, content);
}

#[test]
fn test_ranged_download() {
    let content = random_content(2, 4096);
    let blob = Blob::default();
    let mut upload = StorageOutputStream::new(blob.clone(), 4096).unwrap();
    upload.write(&content).unwrap();
    upload.close().unwrap();

    let mut download = StorageInputStream::new(blob.clone(), 1000, Some(500), 128, 4096).unwrap();
    let mut out = Vec::new();
    download.read_to_end(&mut out).unwrap();
    assert_eq!(out, &content[1000..1500]);
}

#[test]
fn test_structured_message_upload() {
    let content = random_content(3, 2500);
    let blob = Blob::default();

    let mut encoder = StructuredMessageEncoder::new(
        std::io::Cursor::new(content.clone()),
        2500,
        1000,
        MessageFlags::STORAGE_CRC64,
    )
    .unwrap();
    let mut upload = StorageOutputStream::new(blob.clone(), 512).unwrap();
    std::io::copy(&mut encoder, &mut upload).unwrap();
    upload.close().unwrap();

    let wire = blob.data.lock().unwrap().clone();
    let decoded = decode_all(&wire, 2500, 1000, MessageFlags::STORAGE_CRC64).unwrap();
    assert_eq!(&decoded[..], &content[..]);
}

#[test]
fn test_mark_and_reset_replays_bytes() {
    let content = random_content(4, 300);
    let blob = Blob::default();
    let mut upload = StorageOutputStream::new(blob.clone(), 64).unwrap();
    upload.write(&content).unwrap();
    upload.close().unwrap();

    let mut download = StorageInputStream::new(blob.clone(), 0, None, 50, 300).unwrap();
    let mut head = [0u8; 20];
    download.read_exact(&mut head).unwrap();
    download.mark(200);
    let mut first = [0u8; 120];
    download.read_exact(&mut first).unwrap();
    download.reset().unwrap();
    let mut again = [0u8; 120];
    download.read_exact(&mut again).unwrap();
    assert_eq!(first, again);
    assert_eq!(&again[..], &content[20..140]);
}
