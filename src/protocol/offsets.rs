//! OffsetCommit (key 8) and OffsetFetch (key 9), version 0.
//!
//! Offsets are stored by the broker per consumer group.
//!
//! ```text
//! OffsetCommitRequest  => group [topic [partition offset:i64 metadata]]
//! OffsetCommitResponse => [topic [partition error_code:i16]]
//! OffsetFetchRequest   => group [topic [partition]]
//! OffsetFetchResponse  => [topic [partition offset:i64 metadata error_code:i16]]
//! ```

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, encode_request, encode_response, encode_topic_partitions};
use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};
use crate::parser::{bytes_to_string_opt, parse_all, parse_array, parse_nullable_string, parse_string};
use crate::types::{PartitionResponse, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<String>,
}

impl OffsetCommitRequest {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, metadata: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            metadata,
        }
    }
}

impl Payload for OffsetCommitRequest {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
}

impl Payload for OffsetCommitResponse {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

impl PartitionResponse for OffsetCommitResponse {
    fn error(&self) -> KafkaCode {
        self.error
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub topic: String,
    pub partition: i32,
}

impl OffsetFetchRequest {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl Payload for OffsetFetchRequest {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<String>,
    pub error: KafkaCode,
}

impl Payload for OffsetFetchResponse {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

impl PartitionResponse for OffsetFetchResponse {
    fn error(&self) -> KafkaCode {
        self.error
    }
}

pub fn encode_offset_commit_request(
    client_id: &str,
    correlation_id: i32,
    group: &str,
    payloads: &[OffsetCommitRequest],
) -> Result<Bytes> {
    encode_request(ApiKey::OffsetCommit, client_id, correlation_id, |buf| {
        group.encode(buf)?;
        encode_topic_partitions(buf, payloads, |buf, payload| {
            payload.partition.encode(buf)?;
            payload.offset.encode(buf)?;
            payload.metadata.encode(buf)
        })
    })
}

pub fn encode_offset_fetch_request(
    client_id: &str,
    correlation_id: i32,
    group: &str,
    payloads: &[OffsetFetchRequest],
) -> Result<Bytes> {
    encode_request(ApiKey::OffsetFetch, client_id, correlation_id, |buf| {
        group.encode(buf)?;
        encode_topic_partitions(buf, payloads, |buf, payload| payload.partition.encode(buf))
    })
}

fn parse_commit_response_partition(s: NomBytes) -> IResult<NomBytes, (i32, i16)> {
    let (s, partition) = be_i32(s)?;
    let (s, error) = be_i16(s)?;
    Ok((s, (partition, error)))
}

fn parse_commit_response_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetCommitResponse>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_commit_response_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, error)| OffsetCommitResponse {
                topic: topic.clone(),
                partition,
                error: KafkaCode::from(error),
            })
            .collect(),
    ))
}

fn parse_offset_commit_response(s: NomBytes) -> IResult<NomBytes, Vec<OffsetCommitResponse>> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_commit_response_topic)(s)?;
    Ok((s, topics.into_iter().flatten().collect()))
}

pub fn decode_offset_commit_response(body: Bytes) -> Result<Vec<OffsetCommitResponse>> {
    parse_all(body, "offset commit response", parse_offset_commit_response)
}

fn parse_fetch_response_partition(
    s: NomBytes,
) -> IResult<NomBytes, (i32, i64, Option<String>, i16)> {
    let (s, partition) = be_i32(s)?;
    let (s, offset) = be_i64(s)?;
    let (s, metadata) = parse_nullable_string(s)?;
    let (s, error) = be_i16(s)?;
    Ok((s, (partition, offset, bytes_to_string_opt(metadata)?, error)))
}

fn parse_fetch_response_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetFetchResponse>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_fetch_response_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, offset, metadata, error)| OffsetFetchResponse {
                topic: topic.clone(),
                partition,
                offset,
                metadata,
                error: KafkaCode::from(error),
            })
            .collect(),
    ))
}

fn parse_offset_fetch_response(s: NomBytes) -> IResult<NomBytes, Vec<OffsetFetchResponse>> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_fetch_response_topic)(s)?;
    Ok((s, topics.into_iter().flatten().collect()))
}

pub fn decode_offset_fetch_response(body: Bytes) -> Result<Vec<OffsetFetchResponse>> {
    parse_all(body, "offset fetch response", parse_offset_fetch_response)
}

/// OffsetCommit request as seen by a broker.
#[derive(Debug, Clone)]
pub struct OffsetCommitRequestData {
    pub group: String,
    pub payloads: Vec<OffsetCommitRequest>,
}

/// OffsetFetch request as seen by a broker.
#[derive(Debug, Clone)]
pub struct OffsetFetchRequestData {
    pub group: String,
    pub payloads: Vec<OffsetFetchRequest>,
}

fn parse_commit_partition(s: NomBytes) -> IResult<NomBytes, (i32, i64, Option<String>)> {
    let (s, partition) = be_i32(s)?;
    let (s, offset) = be_i64(s)?;
    let (s, metadata) = parse_nullable_string(s)?;
    Ok((s, (partition, offset, bytes_to_string_opt(metadata)?)))
}

fn parse_commit_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetCommitRequest>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_commit_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, offset, metadata)| {
                OffsetCommitRequest::new(topic.clone(), partition, offset, metadata)
            })
            .collect(),
    ))
}

pub fn parse_offset_commit_request(s: NomBytes) -> IResult<NomBytes, OffsetCommitRequestData> {
    let (s, group) = parse_string(s)?;
    let (s, topics) = parse_array(parse_commit_topic)(s)?;

    Ok((
        s,
        OffsetCommitRequestData {
            group,
            payloads: topics.into_iter().flatten().collect(),
        },
    ))
}

fn parse_fetch_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetFetchRequest>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(be_i32::<NomBytes, nom::error::Error<NomBytes>>)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|partition| OffsetFetchRequest::new(topic.clone(), partition))
            .collect(),
    ))
}

pub fn parse_offset_fetch_request(s: NomBytes) -> IResult<NomBytes, OffsetFetchRequestData> {
    let (s, group) = parse_string(s)?;
    let (s, topics) = parse_array(parse_fetch_topic)(s)?;

    Ok((
        s,
        OffsetFetchRequestData {
            group,
            payloads: topics.into_iter().flatten().collect(),
        },
    ))
}

pub fn encode_offset_commit_response(
    correlation_id: i32,
    responses: &[OffsetCommitResponse],
) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_topic_partitions(buf, responses, |buf, response| {
            response.partition.encode(buf)?;
            i16::from(response.error).encode(buf)
        })
    })
}

pub fn encode_offset_fetch_response(
    correlation_id: i32,
    responses: &[OffsetFetchResponse],
) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_topic_partitions(buf, responses, |buf, response| {
            response.partition.encode(buf)?;
            response.offset.encode(buf)?;
            response.metadata.encode(buf)?;
            i16::from(response.error).encode(buf)
        })
    })
}
