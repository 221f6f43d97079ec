//! Offset API (key 2): ask a leader for offsets before a given time.
//!
//! ```text
//! OffsetRequest  => replica_id:i32 [topic [partition time:i64 max_offsets:i32]]
//! OffsetResponse => [topic [partition error_code:i16 [offset:i64]]]
//! ```
//!
//! `time` is a timestamp in milliseconds or one of [`LATEST_OFFSET_TIME`] and
//! [`EARLIEST_OFFSET_TIME`].

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, encode_request, encode_response, encode_topic_partitions};
use crate::constants::{CONSUMER_REPLICA_ID, EARLIEST_OFFSET_TIME, LATEST_OFFSET_TIME};
use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_all, parse_array, parse_string};
use crate::types::{PartitionResponse, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRequest {
    pub topic: String,
    pub partition: i32,
    pub time: i64,
    pub max_offsets: i32,
}

impl OffsetRequest {
    pub fn new(topic: impl Into<String>, partition: i32, time: i64, max_offsets: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            time,
            max_offsets,
        }
    }

    /// The offset the next produced message will get.
    pub fn latest(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(topic, partition, LATEST_OFFSET_TIME, 1)
    }

    /// The oldest offset still retained.
    pub fn earliest(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(topic, partition, EARLIEST_OFFSET_TIME, 1)
    }
}

impl Payload for OffsetRequest {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
    pub offsets: Vec<i64>,
}

impl Payload for OffsetResponse {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

impl PartitionResponse for OffsetResponse {
    fn error(&self) -> KafkaCode {
        self.error
    }
}

pub fn encode_offset_request(
    client_id: &str,
    correlation_id: i32,
    payloads: &[OffsetRequest],
) -> Result<Bytes> {
    encode_request(ApiKey::Offset, client_id, correlation_id, |buf| {
        CONSUMER_REPLICA_ID.encode(buf)?;
        encode_topic_partitions(buf, payloads, |buf, payload| {
            payload.partition.encode(buf)?;
            payload.time.encode(buf)?;
            payload.max_offsets.encode(buf)
        })
    })
}

fn parse_offset_response_partition(s: NomBytes) -> IResult<NomBytes, (i32, i16, Vec<i64>)> {
    let (s, partition) = be_i32(s)?;
    let (s, error) = be_i16(s)?;
    let (s, offsets) = parse_array(be_i64::<NomBytes, nom::error::Error<NomBytes>>)(s)?;
    Ok((s, (partition, error, offsets)))
}

fn parse_offset_response_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetResponse>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_offset_response_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, error, offsets)| OffsetResponse {
                topic: topic.clone(),
                partition,
                error: KafkaCode::from(error),
                offsets,
            })
            .collect(),
    ))
}

fn parse_offset_response(s: NomBytes) -> IResult<NomBytes, Vec<OffsetResponse>> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_offset_response_topic)(s)?;
    Ok((s, topics.into_iter().flatten().collect()))
}

pub fn decode_offset_response(body: Bytes) -> Result<Vec<OffsetResponse>> {
    parse_all(body, "offset response", parse_offset_response)
}

/// Offset request as seen by a broker.
#[derive(Debug, Clone)]
pub struct OffsetRequestData {
    pub replica_id: i32,
    pub payloads: Vec<OffsetRequest>,
}

fn parse_offset_partition(s: NomBytes) -> IResult<NomBytes, (i32, i64, i32)> {
    let (s, partition) = be_i32(s)?;
    let (s, time) = be_i64(s)?;
    let (s, max_offsets) = be_i32(s)?;
    Ok((s, (partition, time, max_offsets)))
}

fn parse_offset_topic(s: NomBytes) -> IResult<NomBytes, Vec<OffsetRequest>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_offset_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, time, max_offsets)| {
                OffsetRequest::new(topic.clone(), partition, time, max_offsets)
            })
            .collect(),
    ))
}

pub fn parse_offset_request(s: NomBytes) -> IResult<NomBytes, OffsetRequestData> {
    let (s, replica_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_offset_topic)(s)?;

    Ok((
        s,
        OffsetRequestData {
            replica_id,
            payloads: topics.into_iter().flatten().collect(),
        },
    ))
}

pub fn encode_offset_response(correlation_id: i32, responses: &[OffsetResponse]) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_topic_partitions(buf, responses, |buf, response| {
            response.partition.encode(buf)?;
            i16::from(response.error).encode(buf)?;
            encode_array(buf, &response.offsets)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, parse_request};

    #[test]
    fn test_latest_and_earliest_helpers() {
        assert_eq!(OffsetRequest::latest("t", 2).time, -1);
        assert_eq!(OffsetRequest::earliest("t", 2).time, -2);
        assert_eq!(OffsetRequest::earliest("t", 2).max_offsets, 1);
    }

    #[test]
    fn test_offset_request_round_trip() {
        let payloads = vec![OffsetRequest::latest("t", 0), OffsetRequest::earliest("u", 3)];
        let frame = encode_offset_request("c", 8, &payloads).unwrap();
        let (header, Request::Offset(data)) = parse_request(frame.slice(4..)).unwrap() else {
            panic!("expected offset request");
        };
        assert_eq!(header.api_key, ApiKey::Offset);
        assert_eq!(data.replica_id, -1);
        assert_eq!(data.payloads, payloads);
    }

    #[test]
    fn test_offset_response_round_trip() {
        let responses = vec![
            OffsetResponse {
                topic: "t".into(),
                partition: 0,
                error: KafkaCode::None,
                offsets: vec![42],
            },
            OffsetResponse {
                topic: "t".into(),
                partition: 1,
                error: KafkaCode::UnknownTopicOrPartition,
                offsets: vec![],
            },
        ];
        let frame = encode_offset_response(2, &responses).unwrap();
        assert_eq!(decode_offset_response(frame.slice(4..)).unwrap(), responses);
    }
}
