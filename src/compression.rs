//! Payload compression for compressed message sets.
//!
//! Gzip is a plain gzip stream. Snappy comes in two shapes: a single raw
//! snappy block, or the xerial stream written by the JVM client
//! (`0x82 SNAPPY 0x00`, version, compatible version, then length-prefixed
//! chunks of at most [`XERIAL_BLOCK_SIZE`] uncompressed bytes each).
//! [`snappy_decode`] accepts both.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{
    XERIAL_BLOCK_SIZE, XERIAL_HEADER_SIZE, XERIAL_MAGIC, XERIAL_MIN_COMPAT_VERSION, XERIAL_VERSION,
};
use crate::error::{Error, Result};
use crate::types::CodecKind;

/// Compress `payload` with `codec`. `CodecKind::None` returns the input untouched.
pub fn compress(codec: CodecKind, payload: &[u8], xerial: bool) -> Result<Bytes> {
    match codec {
        CodecKind::None => Ok(Bytes::copy_from_slice(payload)),
        CodecKind::Gzip => gzip_encode(payload),
        CodecKind::Block => {
            if xerial {
                snappy_encode_xerial(payload, XERIAL_BLOCK_SIZE)
            } else {
                snappy_encode(payload)
            }
        }
    }
}

/// Inverse of [`compress`]; snappy framing is detected from the payload.
pub fn decompress(codec: CodecKind, payload: &[u8]) -> Result<Bytes> {
    match codec {
        CodecKind::None => Ok(Bytes::copy_from_slice(payload)),
        CodecKind::Gzip => gzip_decode(payload),
        CodecKind::Block => snappy_decode(payload),
    }
}

#[cfg(feature = "gzip")]
pub fn gzip_encode(payload: &[u8]) -> Result<Bytes> {
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    let mut encoder = GzEncoder::new(BytesMut::new().writer(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| Error::Compression(format!("gzip: {}", e)))?;
    let writer = encoder
        .finish()
        .map_err(|e| Error::Compression(format!("gzip: {}", e)))?;
    Ok(writer.into_inner().freeze())
}

#[cfg(not(feature = "gzip"))]
pub fn gzip_encode(_payload: &[u8]) -> Result<Bytes> {
    Err(Error::UnsupportedCodec(CodecKind::Gzip.attribute()))
}

#[cfg(feature = "gzip")]
pub fn gzip_decode(payload: &[u8]) -> Result<Bytes> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(format!("gzip: {}", e)))?;
    Ok(Bytes::from(out))
}

#[cfg(not(feature = "gzip"))]
pub fn gzip_decode(_payload: &[u8]) -> Result<Bytes> {
    Err(Error::UnsupportedCodec(CodecKind::Gzip.attribute()))
}

/// Compress `payload` as one raw snappy block.
#[cfg(feature = "snappy")]
pub fn snappy_encode(payload: &[u8]) -> Result<Bytes> {
    snap::raw::Encoder::new()
        .compress_vec(payload)
        .map(Bytes::from)
        .map_err(|e| Error::Compression(format!("snappy: {}", e)))
}

#[cfg(not(feature = "snappy"))]
pub fn snappy_encode(_payload: &[u8]) -> Result<Bytes> {
    Err(Error::UnsupportedCodec(CodecKind::Block.attribute()))
}

/// Compress `payload` as a xerial stream, splitting it into `block_size` chunks.
pub fn snappy_encode_xerial(payload: &[u8], block_size: usize) -> Result<Bytes> {
    if block_size == 0 {
        return Err(Error::InvalidArgument("xerial block size must be positive".into()));
    }

    let mut out = BytesMut::with_capacity(XERIAL_HEADER_SIZE + payload.len());
    out.put_slice(&XERIAL_MAGIC);
    out.put_i32(XERIAL_VERSION);
    out.put_i32(XERIAL_MIN_COMPAT_VERSION);

    for chunk in payload.chunks(block_size) {
        let block = snappy_encode(chunk)?;
        out.put_i32(block.len() as i32);
        out.put_slice(&block);
    }

    Ok(out.freeze())
}

/// Whether `payload` starts with a version 1 xerial header.
pub fn is_xerial_stream(payload: &[u8]) -> bool {
    if payload.len() <= XERIAL_HEADER_SIZE {
        return false;
    }
    let mut header = &payload[..XERIAL_HEADER_SIZE];
    let magic = header.copy_to_bytes(XERIAL_MAGIC.len());
    magic[..] == XERIAL_MAGIC[..]
        && header.get_i32() == XERIAL_VERSION
        && header.get_i32() == XERIAL_MIN_COMPAT_VERSION
}

/// Decompress a raw snappy block or a xerial stream.
pub fn snappy_decode(payload: &[u8]) -> Result<Bytes> {
    if !is_xerial_stream(payload) {
        return snappy_decode_raw(payload);
    }

    let mut cursor = &payload[XERIAL_HEADER_SIZE..];
    let mut out = BytesMut::new();
    while cursor.has_remaining() {
        if cursor.remaining() < 4 {
            return Err(Error::Compression("snappy: truncated xerial chunk header".into()));
        }
        let block_size = cursor.get_i32();
        if block_size < 0 || block_size as usize > cursor.remaining() {
            return Err(Error::Compression(format!(
                "snappy: xerial chunk of {} bytes exceeds remaining {}",
                block_size,
                cursor.remaining()
            )));
        }
        let (block, rest) = cursor.split_at(block_size as usize);
        out.put_slice(&snappy_decode_raw(block)?);
        cursor = rest;
    }

    Ok(out.freeze())
}

#[cfg(feature = "snappy")]
fn snappy_decode_raw(payload: &[u8]) -> Result<Bytes> {
    snap::raw::Decoder::new()
        .decompress_vec(payload)
        .map(Bytes::from)
        .map_err(|e| Error::Compression(format!("snappy: {}", e)))
}

#[cfg(not(feature = "snappy"))]
fn snappy_decode_raw(_payload: &[u8]) -> Result<Bytes> {
    Err(Error::UnsupportedCodec(CodecKind::Block.attribute()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_round_trip() {
        let payload = b"gzip me, gzip me, gzip me".to_vec();
        let compressed = gzip_encode(&payload).unwrap();
        assert_ne!(compressed.as_ref(), payload.as_slice());
        assert_eq!(gzip_decode(&compressed).unwrap().as_ref(), payload.as_slice());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_decode_garbage() {
        assert!(matches!(
            gzip_decode(b"definitely not gzip"),
            Err(Error::Compression(_))
        ));
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_snappy_raw_round_trip() {
        let payload = sample(5000);
        let compressed = snappy_encode(&payload).unwrap();
        assert!(!is_xerial_stream(&compressed));
        assert_eq!(snappy_decode(&compressed).unwrap().as_ref(), payload.as_slice());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_xerial_header_layout() {
        let encoded = snappy_encode_xerial(b"abc", XERIAL_BLOCK_SIZE).unwrap();
        assert_eq!(&encoded[..8], &XERIAL_MAGIC);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 1]);
        assert_eq!(&encoded[12..16], &[0, 0, 0, 1]);
        assert!(is_xerial_stream(&encoded));
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_xerial_round_trip_single_chunk() {
        let payload = sample(20_000);
        let encoded = snappy_encode_xerial(&payload, XERIAL_BLOCK_SIZE).unwrap();
        assert_eq!(snappy_decode(&encoded).unwrap().as_ref(), payload.as_slice());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_xerial_round_trip_multi_chunk() {
        let payload = sample(100_000);
        let encoded = snappy_encode_xerial(&payload, XERIAL_BLOCK_SIZE).unwrap();

        // 100_000 bytes split into 32 KiB chunks: 3 full chunks plus one short one
        let mut cursor = &encoded[XERIAL_HEADER_SIZE..];
        let mut chunks = Vec::new();
        while cursor.has_remaining() {
            let len = cursor.get_i32() as usize;
            let (block, rest) = cursor.split_at(len);
            chunks.push(snappy_decode_raw(block).unwrap().len());
            cursor = rest;
        }
        assert_eq!(chunks, vec![32768, 32768, 32768, 100_000 - 3 * 32768]);

        assert_eq!(snappy_decode(&encoded).unwrap().as_ref(), payload.as_slice());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_xerial_truncated_chunk_is_an_error() {
        let payload = sample(1000);
        let encoded = snappy_encode_xerial(&payload, XERIAL_BLOCK_SIZE).unwrap();
        let truncated = &encoded[..encoded.len() - 10];
        assert!(matches!(
            snappy_decode(truncated),
            Err(Error::Compression(_))
        ));
    }

    #[test]
    fn test_short_payload_is_not_xerial() {
        assert!(!is_xerial_stream(&XERIAL_MAGIC));
        assert!(!is_xerial_stream(b""));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(matches!(
            snappy_encode_xerial(b"x", 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_none_codec_passthrough() {
        let payload = b"plain";
        assert_eq!(compress(CodecKind::None, payload, false).unwrap().as_ref(), payload);
        assert_eq!(decompress(CodecKind::None, payload).unwrap().as_ref(), payload);
    }
}
