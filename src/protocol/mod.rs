//! Kafka wire protocol, version 0.
//!
//! Every API module holds the per-partition request and response records
//! plus both directions of the codec:
//!
//! - client side: `encode_*_request` builds a complete, size-prefixed frame and
//!   `decode_*_response` reads a response body (size prefix already stripped,
//!   correlation id still in front)
//! - broker side: `parse_*_request` reads a request body after the header and
//!   `encode_*_response` builds a complete, size-prefixed response frame
//!
//! The broker side lets a test double or proxy speak the same format.

mod fetch;
pub mod message;
mod metadata;
mod offset;
mod offsets;
mod produce;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::constants::{
    API_KEY_FETCH, API_KEY_METADATA, API_KEY_OFFSET, API_KEY_OFFSET_COMMIT, API_KEY_OFFSET_FETCH,
    API_KEY_PRODUCE, API_VERSION,
};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{Error, Result};
use crate::parser::{bytes_to_string_opt, parse_all, parse_nullable_string};
use crate::types::Payload;

pub use fetch::*;
pub use message::{Message, OffsetAndMessage};
pub use metadata::*;
pub use offset::*;
pub use offsets::*;
pub use produce::*;

/// API keys spoken by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    Fetch,
    Offset,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    Unknown(i16),
}

impl From<i16> for ApiKey {
    fn from(value: i16) -> Self {
        match value {
            API_KEY_PRODUCE => ApiKey::Produce,
            API_KEY_FETCH => ApiKey::Fetch,
            API_KEY_OFFSET => ApiKey::Offset,
            API_KEY_METADATA => ApiKey::Metadata,
            API_KEY_OFFSET_COMMIT => ApiKey::OffsetCommit,
            API_KEY_OFFSET_FETCH => ApiKey::OffsetFetch,
            n => ApiKey::Unknown(n),
        }
    }
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => API_KEY_PRODUCE,
            ApiKey::Fetch => API_KEY_FETCH,
            ApiKey::Offset => API_KEY_OFFSET,
            ApiKey::Metadata => API_KEY_METADATA,
            ApiKey::OffsetCommit => API_KEY_OFFSET_COMMIT,
            ApiKey::OffsetFetch => API_KEY_OFFSET_FETCH,
            ApiKey::Unknown(n) => n,
        }
    }
}

impl ApiKey {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKey::Produce => "Produce",
            ApiKey::Fetch => "Fetch",
            ApiKey::Offset => "Offset",
            ApiKey::Metadata => "Metadata",
            ApiKey::OffsetCommit => "OffsetCommit",
            ApiKey::OffsetFetch => "OffsetFetch",
            ApiKey::Unknown(_) => "Unknown",
        }
    }
}

/// Header in front of every request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl ToByte for RequestHeader {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)?;
        Ok(())
    }
}

/// Parse a request header from the start of a request frame (size prefix stripped).
pub fn parse_request_header(s: NomBytes) -> IResult<NomBytes, RequestHeader> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parse_nullable_string(s)?;

    Ok((
        s,
        RequestHeader {
            api_key: ApiKey::from(api_key),
            api_version,
            correlation_id,
            client_id: bytes_to_string_opt(client_id)?,
        },
    ))
}

/// A decoded request, as seen by a broker.
#[derive(Debug, Clone)]
pub enum Request {
    Produce(ProduceRequestData),
    Fetch(FetchRequestData),
    Offset(OffsetRequestData),
    Metadata(MetadataRequestData),
    OffsetCommit(OffsetCommitRequestData),
    OffsetFetch(OffsetFetchRequestData),
}

/// Decode a whole request frame (size prefix stripped) into its header and body.
pub fn parse_request(frame: Bytes) -> Result<(RequestHeader, Request)> {
    let (body, header) = parse_request_header(NomBytes::new(frame))
        .map_err(|_| Error::MissingData("Failed to parse request header".into()))?;
    let body = body.into_bytes();

    let request = match header.api_key {
        ApiKey::Produce => Request::Produce(parse_all(body, "produce request", parse_produce_request)?),
        ApiKey::Fetch => Request::Fetch(parse_all(body, "fetch request", parse_fetch_request)?),
        ApiKey::Offset => Request::Offset(parse_all(body, "offset request", parse_offset_request)?),
        ApiKey::Metadata => {
            Request::Metadata(parse_all(body, "metadata request", parse_metadata_request)?)
        }
        ApiKey::OffsetCommit => Request::OffsetCommit(parse_all(
            body,
            "offset commit request",
            parse_offset_commit_request,
        )?),
        ApiKey::OffsetFetch => Request::OffsetFetch(parse_all(
            body,
            "offset fetch request",
            parse_offset_fetch_request,
        )?),
        ApiKey::Unknown(key) => {
            return Err(Error::InvalidArgument(format!("unsupported api key {}", key)));
        }
    };

    Ok((header, request))
}

/// Build a size-prefixed request frame: header followed by whatever `body` writes.
pub(crate) fn encode_request<F>(
    api_key: ApiKey,
    client_id: &str,
    correlation_id: i32,
    body: F,
) -> Result<Bytes>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let header = RequestHeader {
        api_key,
        api_version: API_VERSION,
        correlation_id,
        client_id: Some(client_id.to_string()),
    };

    let mut buf = BytesMut::with_capacity(128);
    buf.put_i32(0);
    header.encode(&mut buf)?;
    body(&mut buf)?;

    let size = (buf.len() - 4) as i32;
    buf[..4].copy_from_slice(&size.to_be_bytes());
    Ok(buf.freeze())
}

/// Build a size-prefixed response frame: correlation id followed by whatever `body` writes.
pub(crate) fn encode_response<F>(correlation_id: i32, body: F) -> Result<Bytes>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut buf = BytesMut::with_capacity(128);
    buf.put_i32(0);
    correlation_id.encode(&mut buf)?;
    body(&mut buf)?;

    let size = (buf.len() - 4) as i32;
    buf[..4].copy_from_slice(&size.to_be_bytes());
    Ok(buf.freeze())
}

/// Read the correlation id at the front of a response body.
pub fn response_correlation_id(body: &Bytes) -> Result<i32> {
    if body.len() < 4 {
        return Err(Error::MissingData("Response shorter than its correlation id".into()));
    }
    Ok(i32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

/// Group payloads by topic, keeping the order in which topics first appear.
pub(crate) fn group_by_topic<P: Payload>(payloads: &[P]) -> Vec<(&str, Vec<&P>)> {
    let mut grouped: Vec<(&str, Vec<&P>)> = Vec::new();
    for payload in payloads {
        match grouped.iter_mut().find(|(topic, _)| *topic == payload.topic()) {
            Some((_, partitions)) => partitions.push(payload),
            None => grouped.push((payload.topic(), vec![payload])),
        }
    }
    grouped
}

/// Write `[topic [partition ...]]`, letting `f` write each partition entry.
pub(crate) fn encode_topic_partitions<P, W, F>(buffer: &mut W, payloads: &[P], mut f: F) -> Result<()>
where
    P: Payload,
    W: BufMut,
    F: FnMut(&mut W, &P) -> Result<()>,
{
    let grouped = group_by_topic(payloads);
    encode_as_array(buffer, &grouped, |buffer, (topic, partitions)| {
        topic.encode(buffer)?;
        encode_as_array(buffer, partitions, |buffer, payload| f(buffer, *payload))
    })
}
