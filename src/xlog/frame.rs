//! Frame codec.
//!
//! A frame is the on-disk batch unit: a 4-byte magic marker, a fixed-size
//! header (payload length, row count, server time, flags), the payload of
//! one-or-more encoded rows (optionally zlib-compressed), and a trailing
//! CRC32 over header and payload. A zero-payload frame with a distinct magic
//! marks clean end-of-file.
//!
//! Verification either yields every row of the frame intact or a
//! `CorruptFrame` error; the read side treats a truncated tail as
//! end-of-file, never as corruption.

use std::io::{Cursor, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::row::Row;

/// Marker opening every data frame.
pub const FRAME_MAGIC: u32 = 0xd50b_ab1e;
/// Marker of the clean end-of-file frame (no header, no payload).
pub const EOF_MAGIC: u32 = 0x1e0f_bad5;

/// Magic (4) + payload length (4) + row count (4) + timestamp (8) + flags (1).
pub const FRAME_HEADER_SIZE: usize = 21;

/// Flag bit: payload is zlib-compressed.
pub const FLAG_ZLIB: u8 = 0x01;

/// Payloads at least this large are considered for compression.
pub const COMPRESS_THRESHOLD: usize = 8 * 1024;

/// An encoded frame kept as separate parts so the file layer can hand them
/// to a single vectored write.
pub struct EncodedFrame {
    pub head: [u8; FRAME_HEADER_SIZE],
    pub payload: Vec<u8>,
    pub crc: [u8; 4],
}

impl EncodedFrame {
    /// Total size of the frame on disk.
    pub fn len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + 4
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Builds a frame around an already-encoded row payload.
pub fn encode_frame(mut payload: Vec<u8>, n_rows: u32, tm: u64) -> Result<EncodedFrame> {
    let mut flags = 0u8;
    if payload.len() >= COMPRESS_THRESHOLD {
        let compressed = compress(&payload)?;
        if compressed.len() < payload.len() {
            payload = compressed;
            flags |= FLAG_ZLIB;
        }
    }

    let mut head = [0u8; FRAME_HEADER_SIZE];
    head[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
    head[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    head[8..12].copy_from_slice(&n_rows.to_le_bytes());
    head[12..20].copy_from_slice(&tm.to_le_bytes());
    head[20] = flags;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&head);
    hasher.update(&payload);
    let crc = hasher.finalize().to_le_bytes();

    Ok(EncodedFrame { head, payload, crc })
}

/// The end-of-file marker bytes.
pub fn eof_marker() -> [u8; 4] {
    EOF_MAGIC.to_le_bytes()
}

/// Checks the stored checksum of a frame read back from disk.
pub fn verify_crc(head: &[u8; FRAME_HEADER_SIZE], payload: &[u8], stored: u32) -> bool {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(head);
    hasher.update(payload);
    hasher.finalize() == stored
}

/// Decodes `n_rows` rows out of a (already decompressed) frame payload.
/// The payload must be consumed exactly.
pub fn parse_rows(payload: &[u8], n_rows: u32) -> Result<Vec<Row>> {
    let mut cursor = Cursor::new(payload);
    let mut rows = Vec::with_capacity(n_rows as usize);
    for _ in 0..n_rows {
        let row: Row = bincode::deserialize_from(&mut cursor)
            .map_err(|e| Error::Codec(format!("bad row in frame payload: {e}")))?;
        rows.push(row);
    }
    if cursor.position() as usize != payload.len() {
        return Err(Error::Codec("trailing bytes in frame payload".into()));
    }
    Ok(rows)
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::OpKind;
    use bytes::Bytes;

    fn sample_rows(n: usize) -> (Vec<u8>, Vec<Row>) {
        let mut payload = Vec::new();
        let mut rows = Vec::new();
        for i in 0..n {
            let mut row = Row::new(OpKind::Insert, vec![Bytes::from(vec![i as u8; 16])]);
            row.replica_id = 1;
            row.lsn = i as i64 + 1;
            payload.extend_from_slice(&row.encode().unwrap());
            rows.push(row);
        }
        (payload, rows)
    }

    #[test]
    fn test_frame_round_trip() {
        let (payload, rows) = sample_rows(3);
        let frame = encode_frame(payload, 3, 99).unwrap();
        assert_eq!(&frame.head[0..4], &FRAME_MAGIC.to_le_bytes());
        let stored = u32::from_le_bytes(frame.crc);
        assert!(verify_crc(&frame.head, &frame.payload, stored));
        let decoded = parse_rows(&frame.payload, 3).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_corruption_is_detected() {
        let (payload, _) = sample_rows(2);
        let mut frame = encode_frame(payload, 2, 0).unwrap();
        frame.payload[0] ^= 0xff;
        let stored = u32::from_le_bytes(frame.crc);
        assert!(!verify_crc(&frame.head, &frame.payload, stored));
    }

    #[test]
    fn test_large_payload_is_compressed() {
        // Highly repetitive payload well above the threshold.
        let (payload, rows) = sample_rows(600);
        assert!(payload.len() >= COMPRESS_THRESHOLD);
        let frame = encode_frame(payload.clone(), rows.len() as u32, 0).unwrap();
        assert_ne!(frame.head[20] & FLAG_ZLIB, 0);
        assert!(frame.payload.len() < payload.len());
        let restored = decompress(&frame.payload).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_partial_payload_is_codec_error() {
        let (payload, _) = sample_rows(2);
        assert!(parse_rows(&payload[..payload.len() - 1], 2).is_err());
        // Declaring fewer rows than encoded leaves trailing bytes.
        assert!(parse_rows(&payload, 1).is_err());
    }
}
