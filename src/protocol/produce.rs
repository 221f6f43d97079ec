//! Produce API (key 0).
//!
//! ```text
//! ProduceRequest  => acks:i16 timeout:i32 [topic [partition message_set_size:i32 message_set]]
//! ProduceResponse => [topic [partition error_code:i16 offset:i64]]
//! ```

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::message::{Message, encode_message_set};
use super::{ApiKey, encode_request, encode_response, encode_topic_partitions};
use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_all, parse_array, parse_string};
use crate::types::{PartitionResponse, Payload};

/// Messages to append to one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub topic: String,
    pub partition: i32,
    pub messages: Vec<Message>,
}

impl ProduceRequest {
    pub fn new(topic: impl Into<String>, partition: i32, messages: Vec<Message>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }
}

impl Payload for ProduceRequest {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

/// Outcome of a produce for one partition; `offset` is the offset of the first appended message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceResponse {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
    pub offset: i64,
}

impl ProduceResponse {
    pub fn success(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            error: KafkaCode::None,
            offset,
        }
    }

    /// Error response; the offset is -1.
    pub fn error(topic: impl Into<String>, partition: i32, error: KafkaCode) -> Self {
        Self {
            topic: topic.into(),
            partition,
            error,
            offset: -1,
        }
    }
}

impl Payload for ProduceResponse {
    fn topic(&self) -> &str {
        &self.topic
    }
    fn partition(&self) -> i32 {
        self.partition
    }
}

impl PartitionResponse for ProduceResponse {
    fn error(&self) -> KafkaCode {
        self.error
    }
}

pub fn encode_produce_request(
    client_id: &str,
    correlation_id: i32,
    payloads: &[ProduceRequest],
    acks: i16,
    timeout_ms: i32,
) -> Result<Bytes> {
    encode_request(ApiKey::Produce, client_id, correlation_id, |buf| {
        acks.encode(buf)?;
        timeout_ms.encode(buf)?;
        encode_topic_partitions(buf, payloads, |buf, payload| {
            payload.partition.encode(buf)?;
            let message_set = encode_message_set(&payload.messages)?;
            (message_set.len() as i32).encode(buf)?;
            buf.put_slice(&message_set);
            Ok(())
        })
    })
}

fn parse_produce_response_partition(s: NomBytes) -> IResult<NomBytes, (i32, i16, i64)> {
    let (s, partition) = be_i32(s)?;
    let (s, error) = be_i16(s)?;
    let (s, offset) = be_i64(s)?;
    Ok((s, (partition, error, offset)))
}

fn parse_produce_response_topic(s: NomBytes) -> IResult<NomBytes, Vec<ProduceResponse>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_produce_response_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, error, offset)| ProduceResponse {
                topic: topic.clone(),
                partition,
                error: KafkaCode::from(error),
                offset,
            })
            .collect(),
    ))
}

fn parse_produce_response(s: NomBytes) -> IResult<NomBytes, Vec<ProduceResponse>> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_produce_response_topic)(s)?;
    Ok((s, topics.into_iter().flatten().collect()))
}

pub fn decode_produce_response(body: Bytes) -> Result<Vec<ProduceResponse>> {
    parse_all(body, "produce response", parse_produce_response)
}

/// Produce request as seen by a broker; message sets are left encoded.
#[derive(Debug, Clone)]
pub struct ProduceRequestData {
    pub acks: i16,
    pub timeout_ms: i32,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone)]
pub struct ProducePartitionData {
    pub topic: String,
    pub partition: i32,
    pub message_set: Bytes,
}

fn parse_produce_partition(s: NomBytes) -> IResult<NomBytes, (i32, Bytes)> {
    let (s, partition) = be_i32(s)?;
    let (s, message_set_size) = be_i32(s)?;
    let (s, message_set) = take(message_set_size.max(0) as usize)(s)?;
    Ok((s, (partition, message_set.into_bytes())))
}

fn parse_produce_topic(s: NomBytes) -> IResult<NomBytes, Vec<ProducePartitionData>> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_produce_partition)(s)?;

    Ok((
        s,
        partitions
            .into_iter()
            .map(|(partition, message_set)| ProducePartitionData {
                topic: topic.clone(),
                partition,
                message_set,
            })
            .collect(),
    ))
}

pub fn parse_produce_request(s: NomBytes) -> IResult<NomBytes, ProduceRequestData> {
    let (s, acks) = be_i16(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let (s, topics) = parse_array(parse_produce_topic)(s)?;

    Ok((
        s,
        ProduceRequestData {
            acks,
            timeout_ms,
            partitions: topics.into_iter().flatten().collect(),
        },
    ))
}

pub fn encode_produce_response(correlation_id: i32, responses: &[ProduceResponse]) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_topic_partitions(buf, responses, |buf, response| {
            response.partition.encode(buf)?;
            i16::from(response.error).encode(buf)?;
            response.offset.encode(buf)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{create_message, decode_message_set};
    use crate::protocol::{Request, parse_request};

    #[test]
    fn test_encode_produce_request_layout() {
        let payloads = vec![ProduceRequest::new(
            "t",
            0,
            vec![create_message("a", None)],
        )];
        let frame = encode_produce_request("c", 3, &payloads, 1, 1000).unwrap();

        let (header, request) = parse_request(frame.slice(4..)).unwrap();
        assert_eq!(header.api_key, ApiKey::Produce);
        assert_eq!(header.correlation_id, 3);

        let Request::Produce(data) = request else {
            panic!("expected produce request");
        };
        assert_eq!(data.acks, 1);
        assert_eq!(data.timeout_ms, 1000);
        assert_eq!(data.partitions.len(), 1);
        assert_eq!(data.partitions[0].topic, "t");

        let messages = decode_message_set(data.partitions[0].message_set.clone()).unwrap();
        assert_eq!(messages[0].message.value, Some(Bytes::from_static(b"a")));
    }

    #[test]
    fn test_produce_request_groups_by_topic() {
        let payloads = vec![
            ProduceRequest::new("x", 0, vec![create_message("1", None)]),
            ProduceRequest::new("y", 0, vec![create_message("2", None)]),
            ProduceRequest::new("x", 1, vec![create_message("3", None)]),
        ];
        let frame = encode_produce_request("c", 1, &payloads, 1, 10).unwrap();
        let (_, Request::Produce(data)) = parse_request(frame.slice(4..)).unwrap() else {
            panic!("expected produce request");
        };

        let order = data
            .partitions
            .iter()
            .map(|p| (p.topic.as_str(), p.partition))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("x", 0), ("x", 1), ("y", 0)]);
    }

    #[test]
    fn test_produce_response_round_trip() {
        let responses = vec![
            ProduceResponse::success("t", 0, 100),
            ProduceResponse::error("t", 1, KafkaCode::NotLeaderForPartition),
            ProduceResponse::success("u", 0, 7),
        ];
        let frame = encode_produce_response(11, &responses).unwrap();
        let decoded = decode_produce_response(frame.slice(4..)).unwrap();
        assert_eq!(decoded, responses);
        assert!(decoded[1].check_error().is_err());
    }

    #[test]
    fn test_decode_produce_response_truncated() {
        let frame = encode_produce_response(1, &[ProduceResponse::success("t", 0, 1)]).unwrap();
        assert!(decode_produce_response(frame.slice(4..frame.len() - 2)).is_err());
    }
}
