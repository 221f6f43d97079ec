//! Message and MessageSet framing (message format version 0).
//!
//! ```text
//! Message    => crc:u32 magic:i8 attributes:i8 key:bytes value:bytes
//! MessageSet => [offset:i64 message_size:i32 message]   (no array length)
//! ```
//!
//! The CRC is CRC-32 (IEEE) over everything after the crc field. A message
//! whose codec bits are set carries a complete, compressed MessageSet as its
//! value; decoding flattens it into the individual records.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult, InputLength,
    bytes::complete::take,
    number::complete::{be_i8, be_i32, be_i64, be_u32},
};
use nombytes::NomBytes;

use crate::compression;
use crate::constants::{MESSAGE_MAGIC, MESSAGE_OVERHEAD, MESSAGE_SET_ENTRY_OVERHEAD};
use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::parser::parse_nullable_bytes;
use crate::types::CodecKind;

/// A single message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub magic: i8,
    pub attributes: i8,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Message {
    /// An uncompressed message.
    pub fn new(value: impl Into<Bytes>, key: Option<Bytes>) -> Self {
        Self {
            magic: MESSAGE_MAGIC,
            attributes: 0,
            key,
            value: Some(value.into()),
        }
    }

    pub fn codec(&self) -> Result<CodecKind> {
        CodecKind::from_attributes(self.attributes)
    }

    /// Size of the encoded message, excluding the message set entry header.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_OVERHEAD
            + self.key.as_ref().map_or(0, |k| k.len())
            + self.value.as_ref().map_or(0, |v| v.len())
    }
}

impl ToByte for Message {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        let mut body = BytesMut::with_capacity(self.encoded_len() - 4);
        self.magic.encode(&mut body)?;
        self.attributes.encode(&mut body)?;
        self.key.encode(&mut body)?;
        self.value.encode(&mut body)?;

        crc32fast::hash(&body).encode(buffer)?;
        buffer.put_slice(&body);
        Ok(())
    }
}

/// A message together with the offset the broker assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMessage {
    pub offset: i64,
    pub message: Message,
}

/// Encode one message, CRC included.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(message.encoded_len());
    message.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Encode messages as a MessageSet. Producers send offset 0; the broker assigns real offsets.
pub fn encode_message_set(messages: &[Message]) -> Result<Bytes> {
    let entries = messages
        .iter()
        .map(|m| (0i64, m))
        .collect::<Vec<_>>();
    encode_message_set_with_offsets(&entries)
}

/// Encode a MessageSet with explicit offsets, as a broker does in fetch responses.
pub fn encode_message_set_with_offsets(entries: &[(i64, &Message)]) -> Result<Bytes> {
    let size: usize = entries
        .iter()
        .map(|(_, m)| MESSAGE_SET_ENTRY_OVERHEAD + m.encoded_len())
        .sum();
    let mut buf = BytesMut::with_capacity(size);
    for (offset, message) in entries {
        offset.encode(&mut buf)?;
        (message.encoded_len() as i32).encode(&mut buf)?;
        message.encode(&mut buf)?;
    }
    Ok(buf.freeze())
}

fn parse_message_set_entry(s: NomBytes) -> IResult<NomBytes, (i64, i32, NomBytes)> {
    let (s, offset) = be_i64(s)?;
    let (s, size) = be_i32(s)?;
    if size < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (s, message) = take(size as usize)(s)?;
    Ok((s, (offset, size, message)))
}

/// Decode a MessageSet, flattening compressed messages.
///
/// A truncated trailing entry ends decoding silently. A set that holds data
/// but not a single complete entry yields [`Error::FetchBufferTooSmall`].
pub fn decode_message_set(data: Bytes) -> Result<Vec<OffsetAndMessage>> {
    let mut out = Vec::new();
    let mut input = NomBytes::new(data);
    let mut read_message = false;

    while input.input_len() > 0 {
        match parse_message_set_entry(input.clone()) {
            Ok((rest, (offset, _size, message))) => {
                out.extend(decode_message(offset, message.into_bytes())?);
                read_message = true;
                input = rest;
            }
            Err(nom::Err::Failure(_)) => {
                return Err(Error::MissingData("Negative message size in message set".into()));
            }
            Err(_) if !read_message => return Err(Error::FetchBufferTooSmall),
            Err(_) => {
                tracing::trace!(
                    dropped_bytes = input.input_len(),
                    "Dropping partial trailing message"
                );
                break;
            }
        }
    }

    Ok(out)
}

fn parse_message_body(s: NomBytes) -> IResult<NomBytes, Message> {
    let (s, magic) = be_i8(s)?;
    let (s, attributes) = be_i8(s)?;
    let (s, key) = parse_nullable_bytes(s)?;
    let (s, value) = parse_nullable_bytes(s)?;
    Ok((
        s,
        Message {
            magic,
            attributes,
            key,
            value,
        },
    ))
}

/// Decode one complete message found at `offset`, verifying its CRC.
///
/// Compressed messages expand into the messages of their inner set.
pub fn decode_message(offset: i64, data: Bytes) -> Result<Vec<OffsetAndMessage>> {
    let (body, expected) = be_u32::<NomBytes, nom::error::Error<NomBytes>>(NomBytes::new(data))
        .map_err(|_| Error::MissingData("Message shorter than its checksum".into()))?;
    let body = body.into_bytes();

    let actual = crc32fast::hash(&body);
    if actual != expected {
        return Err(Error::Checksum { expected, actual });
    }

    let (_, message) = parse_message_body(NomBytes::new(body))
        .map_err(|_| Error::MissingData("Truncated message body".into()))?;

    match message.codec()? {
        CodecKind::None => Ok(vec![OffsetAndMessage { offset, message }]),
        codec => {
            let value = message.value.unwrap_or_default();
            let inner = compression::decompress(codec, &value)?;
            decode_message_set(inner)
        }
    }
}

/// An uncompressed message.
pub fn create_message(value: impl Into<Bytes>, key: Option<Bytes>) -> Message {
    Message::new(value, key)
}

fn create_compressed_message(
    codec: CodecKind,
    payloads: &[(Bytes, Option<Bytes>)],
    key: Option<Bytes>,
    xerial: bool,
) -> Result<Message> {
    let inner = payloads
        .iter()
        .map(|(value, key)| create_message(value.clone(), key.clone()))
        .collect::<Vec<_>>();
    let message_set = encode_message_set(&inner)?;
    let compressed = compression::compress(codec, &message_set, xerial)?;
    Ok(Message {
        magic: MESSAGE_MAGIC,
        attributes: codec.attribute(),
        key,
        value: Some(compressed),
    })
}

/// One gzip message wrapping `(value, key)` payloads.
pub fn create_gzip_message(payloads: &[(Bytes, Option<Bytes>)], key: Option<Bytes>) -> Result<Message> {
    create_compressed_message(CodecKind::Gzip, payloads, key, false)
}

/// One snappy message wrapping `(value, key)` payloads, optionally xerial framed.
pub fn create_snappy_message(
    payloads: &[(Bytes, Option<Bytes>)],
    key: Option<Bytes>,
    xerial: bool,
) -> Result<Message> {
    create_compressed_message(CodecKind::Block, payloads, key, xerial)
}

/// Messages for one produce request: one message per payload, or a single
/// compressed wrapper when a codec is set.
pub fn create_message_set(
    payloads: &[(Bytes, Option<Bytes>)],
    codec: CodecKind,
    key: Option<Bytes>,
    xerial: bool,
) -> Result<Vec<Message>> {
    if !codec.is_available() {
        return Err(Error::UnsupportedCodec(codec.attribute()));
    }
    match codec {
        CodecKind::None => Ok(payloads
            .iter()
            .map(|(value, key)| create_message(value.clone(), key.clone()))
            .collect()),
        CodecKind::Gzip => Ok(vec![create_gzip_message(payloads, key)?]),
        CodecKind::Block => Ok(vec![create_snappy_message(payloads, key, xerial)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(values: &[&str]) -> Vec<(Bytes, Option<Bytes>)> {
        values
            .iter()
            .map(|v| (Bytes::copy_from_slice(v.as_bytes()), None))
            .collect()
    }

    #[test]
    fn test_encode_message_layout() {
        let message = create_message("test", Some(Bytes::from_static(b"key")));
        let encoded = encode_message(&message).unwrap();

        let mut expected = vec![];
        expected.extend_from_slice(&[0, 0]); // magic, attributes
        expected.extend_from_slice(&[0, 0, 0, 3]);
        expected.extend_from_slice(b"key");
        expected.extend_from_slice(&[0, 0, 0, 4]);
        expected.extend_from_slice(b"test");
        let crc = crc32fast::hash(&expected);

        assert_eq!(&encoded[..4], &crc.to_be_bytes());
        assert_eq!(&encoded[4..], expected.as_slice());
        assert_eq!(encoded.len(), message.encoded_len());
    }

    #[test]
    fn test_null_key_encodes_as_minus_one() {
        let encoded = encode_message(&create_message("v", None)).unwrap();
        assert_eq!(&encoded[6..10], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_decode_message_round_trip() {
        let message = create_message("value", Some(Bytes::from_static(b"k")));
        let decoded = decode_message(42, encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, vec![OffsetAndMessage { offset: 42, message }]);
    }

    #[test]
    fn test_checksum_mismatch_is_raised() {
        let message = create_message("value", Some(Bytes::from_static(b"k")));
        let encoded = encode_message(&message).unwrap();

        // Flip each byte after the crc in turn; every flip must be caught.
        for i in 4..encoded.len() {
            let mut corrupt = encoded.to_vec();
            corrupt[i] ^= 0xFF;
            let result = decode_message(0, Bytes::from(corrupt));
            assert!(
                matches!(result, Err(Error::Checksum { .. })),
                "byte {} flip went undetected",
                i
            );
        }
    }

    #[test]
    fn test_message_set_offsets_are_zero_when_producing() {
        let messages = vec![create_message("a", None), create_message("b", None)];
        let set = encode_message_set(&messages).unwrap();
        assert_eq!(&set[..8], &0i64.to_be_bytes());
        let decoded = decode_message_set(set).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded.iter().all(|m| m.offset == 0));
    }

    #[test]
    fn test_decode_message_set_keeps_broker_offsets() {
        let a = create_message("a", None);
        let b = create_message("b", None);
        let set = encode_message_set_with_offsets(&[(10, &a), (11, &b)]).unwrap();
        let decoded = decode_message_set(set).unwrap();
        assert_eq!(decoded[0].offset, 10);
        assert_eq!(decoded[1].offset, 11);
        assert_eq!(decoded[1].message.value, Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_truncated_trailing_message_is_dropped() {
        let a = create_message("first", None);
        let b = create_message("second", None);
        let set = encode_message_set_with_offsets(&[(0, &a), (1, &b)]).unwrap();
        let truncated = set.slice(..set.len() - 3);

        let decoded = decode_message_set(truncated).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message, a);
    }

    #[test]
    fn test_partial_first_message_means_buffer_too_small() {
        let a = create_message("x".repeat(100), None);
        let set = encode_message_set_with_offsets(&[(0, &a)]).unwrap();

        let result = decode_message_set(set.slice(..50));
        assert!(matches!(result, Err(Error::FetchBufferTooSmall)));

        // Not even a complete entry header
        let result = decode_message_set(set.slice(..6));
        assert!(matches!(result, Err(Error::FetchBufferTooSmall)));
    }

    #[test]
    fn test_empty_message_set() {
        assert!(decode_message_set(Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn test_codec_round_trips() {
        let input = payloads(&["v1", "v2", "v3"]);
        for codec in [CodecKind::None, CodecKind::Gzip, CodecKind::Block] {
            if !codec.is_available() {
                continue;
            }
            let messages = create_message_set(&input, codec, None, false).unwrap();
            let set = encode_message_set(&messages).unwrap();
            let values = decode_message_set(set)
                .unwrap()
                .into_iter()
                .map(|m| m.message.value.unwrap())
                .collect::<Vec<_>>();
            assert_eq!(values, vec!["v1", "v2", "v3"], "codec {:?}", codec);
        }
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_xerial_snappy_message_decodes() {
        let input = payloads(&["alpha", "beta"]);
        let message = create_snappy_message(&input, None, true).unwrap();
        assert!(compression::is_xerial_stream(message.value.as_ref().unwrap()));
        let decoded = decode_message(0, encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_message_attributes() {
        let message = create_gzip_message(&payloads(&["a"]), Some(Bytes::from_static(b"k"))).unwrap();
        assert_eq!(message.attributes, 0x01);
        assert_eq!(message.codec().unwrap(), CodecKind::Gzip);
        assert_eq!(message.key, Some(Bytes::from_static(b"k")));
    }

    #[test]
    fn test_unknown_codec_bits_rejected() {
        let message = Message {
            magic: 0,
            attributes: 0x03,
            key: None,
            value: Some(Bytes::from_static(b"??")),
        };
        let result = decode_message(0, encode_message(&message).unwrap());
        assert!(matches!(result, Err(Error::UnsupportedCodec(3))));
    }
}
