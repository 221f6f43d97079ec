//! Fetch API (key 1).
//!
//! ```text
//! FetchRequest  => replica_id:i32 max_wait_time:i32 min_bytes:i32 [topic [partition offset:i64 max_bytes:i32]]
//! FetchResponse => [topic [partition error_code:i16 highwater_mark:i64 message_set_size:i32 message_set]]
//! ```

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::message::{OffsetAndMessage, decode_message_set};
use super::{ApiKey, encode_request, encode_response, encode_topic_partitions};
use crate::constants::CONSUMER_REPLICA_ID;
use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_all, parse_array, parse_string};
use crate::types::{PartitionResponse, Payload};

/// Read up to `max_bytes` of one partition starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
}

impl FetchRequest {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, max_bytes: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            max_bytes,
        }
    }
}

impl Payload for FetchRequest {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

/// One partition of a fetch response.
///
/// The message set is kept encoded; [`FetchResponse::messages`] decodes it on
/// demand so a partition whose budget was too small does not poison the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
    pub highwater_mark: i64,
    pub message_set: Bytes,
}

impl FetchResponse {
    pub fn messages(&self) -> Result<Vec<OffsetAndMessage>> {
        decode_message_set(self.message_set.clone())
    }
}

impl Payload for FetchResponse {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

impl PartitionResponse for FetchResponse {
    fn error(&self) -> KafkaCode {
        self.error
    }
}

pub fn encode_fetch_request(
    client_id: &str,
    correlation_id: i32,
    payloads: &[FetchRequest],
    max_wait_time_ms: i32,
    min_bytes: i32,
) -> Result<Bytes> {
    encode_request(ApiKey::Fetch, client_id, correlation_id, |buf| {
        CONSUMER_REPLICA_ID.encode(buf)?;
        max_wait_time_ms.encode(buf)?;
        min_bytes.encode(buf)?;
        encode_topic_partitions(buf, payloads, |buf, payload| {
            payload.partition.encode(buf)?;
            payload.offset.encode(buf)?;
            payload.max_bytes.encode(buf)
        })
    })
}

fn parse_fetch_response_partition(s: NomBytes) -> IResult<NomBytes, (i32, i16, i64, Bytes)> {
    let (s, partition) = be_i32(s)?;
    let (s, error) = be_i16(s)?;
    let (s, highwater_mark) = be_i64(s)?;
    let (s, message_set_size) = be_i32(s)?;
    let (s, message_set) = take(message_set_size.max(0) as usize)(s)?;
    Ok((s, (partition, error, highwater_mark, message_set.into_bytes())))
}

fn parse_fetch_response_topic(s: NomBytes) -> IResult<NomBytes, Vec<FetchResponse>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_fetch_response_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, error, highwater_mark, message_set)| FetchResponse {
                topic: topic.clone(),
                partition,
                error: KafkaCode::from(error),
                highwater_mark,
                message_set,
            })
            .collect(),
    ))
}

fn parse_fetch_response(s: NomBytes) -> IResult<NomBytes, Vec<FetchResponse>> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_fetch_response_topic)(s)?;
    Ok((s, topics.into_iter().flatten().collect()))
}

pub fn decode_fetch_response(body: Bytes) -> Result<Vec<FetchResponse>> {
    parse_all(body, "fetch response", parse_fetch_response)
}

/// Fetch request as seen by a broker.
#[derive(Debug, Clone)]
pub struct FetchRequestData {
    pub replica_id: i32,
    pub max_wait_time_ms: i32,
    pub min_bytes: i32,
    pub payloads: Vec<FetchRequest>,
}

fn parse_fetch_partition(s: NomBytes) -> IResult<NomBytes, (i32, i64, i32)> {
    let (s, partition) = be_i32(s)?;
    let (s, offset) = be_i64(s)?;
    let (s, max_bytes) = be_i32(s)?;
    Ok((s, (partition, offset, max_bytes)))
}

fn parse_fetch_topic(s: NomBytes) -> IResult<NomBytes, Vec<FetchRequest>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_fetch_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, offset, max_bytes)| {
                FetchRequest::new(topic.clone(), partition, offset, max_bytes)
            })
            .collect(),
    ))
}

pub fn parse_fetch_request(s: NomBytes) -> IResult<NomBytes, FetchRequestData> {
    let (s, replica_id) = be_i32(s)?;
    let (s, max_wait_time_ms) = be_i32(s)?;
    let (s, min_bytes) = be_i32(s)?;
    let (s, topics) = parse_array(parse_fetch_topic)(s)?;

    Ok((
        s,
        FetchRequestData {
            replica_id,
            max_wait_time_ms,
            min_bytes,
            payloads: topics.into_iter().flatten().collect(),
        },
    ))
}

pub fn encode_fetch_response(correlation_id: i32, responses: &[FetchResponse]) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_topic_partitions(buf, responses, |buf, response| {
            response.partition.encode(buf)?;
            i16::from(response.error).encode(buf)?;
            response.highwater_mark.encode(buf)?;
            (response.message_set.len() as i32).encode(buf)?;
            buf.put_slice(&response.message_set);
            Ok(())
        })
    })
}
