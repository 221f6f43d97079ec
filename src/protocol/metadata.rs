//! Metadata API (key 3).
//!
//! ```text
//! MetadataRequest  => [topic]
//! MetadataResponse => [node_id:i32 host port:i32] [topic_error:i16 topic [partition_error:i16 partition:i32 leader:i32 [replica:i32] [isr:i32]]]
//! ```
//!
//! An empty topic list asks for every topic in the cluster.

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, encode_request, encode_response};
use crate::encode::{ToByte, encode_array, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_all, parse_array, parse_string};
use crate::types::{BrokerMetadata, PartitionMetadata, TopicMetadata};

/// Cluster topology as reported by one broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

pub fn encode_metadata_request(client_id: &str, correlation_id: i32, topics: &[String]) -> Result<Bytes> {
    encode_request(ApiKey::Metadata, client_id, correlation_id, |buf| {
        encode_array(buf, topics)
    })
}

fn parse_broker(s: NomBytes) -> IResult<NomBytes, BrokerMetadata> {
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_string(s)?;
    let (s, port) = be_i32(s)?;
    Ok((s, BrokerMetadata::new(node_id, host, port)))
}

type RawPartitionMetadata = (i16, i32, i32, Vec<i32>, Vec<i32>);

fn parse_partition_metadata(s: NomBytes) -> IResult<NomBytes, RawPartitionMetadata> {
    let (s, error) = be_i16(s)?;
    let (s, partition) = be_i32(s)?;
    let (s, leader) = be_i32(s)?;
    let (s, replicas) = parse_array(be_i32::<NomBytes, nom::error::Error<NomBytes>>)(s)?;
    let (s, isr) = parse_array(be_i32::<NomBytes, nom::error::Error<NomBytes>>)(s)?;
    Ok((s, (error, partition, leader, replicas, isr)))
}

fn parse_topic_metadata(s: NomBytes) -> IResult<NomBytes, TopicMetadata> {
    let (s, error) = be_i16(s)?;
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_partition_metadata)(s)?;

    let partitions = partitions
        .into_iter()
        .map(|(error, partition, leader, replicas, isr)| PartitionMetadata {
            topic: topic.clone(),
            partition,
            leader,
            replicas,
            isr,
            error: KafkaCode::from(error),
        })
        .collect();

    Ok((
        s,
        TopicMetadata {
            topic,
            error: KafkaCode::from(error),
            partitions,
        },
    ))
}

fn parse_metadata_response(s: NomBytes) -> IResult<NomBytes, MetadataResponse> {
    let (s, _correlation_id) = be_i32(s)?;
    let (s, brokers) = parse_array(parse_broker)(s)?;
    let (s, topics) = parse_array(parse_topic_metadata)(s)?;
    Ok((s, MetadataResponse { brokers, topics }))
}

pub fn decode_metadata_response(body: Bytes) -> Result<MetadataResponse> {
    parse_all(body, "metadata response", parse_metadata_response)
}

/// Metadata request as seen by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequestData {
    pub topics: Vec<String>,
}

pub fn parse_metadata_request(s: NomBytes) -> IResult<NomBytes, MetadataRequestData> {
    let (s, topics) = parse_array(parse_string)(s)?;
    Ok((s, MetadataRequestData { topics }))
}

pub fn encode_metadata_response(correlation_id: i32, response: &MetadataResponse) -> Result<Bytes> {
    encode_response(correlation_id, |buf| {
        encode_as_array(buf, &response.brokers, |buf, broker| {
            broker.node_id.encode(buf)?;
            broker.host.encode(buf)?;
            broker.port.encode(buf)
        })?;
        encode_as_array(buf, &response.topics, |buf, topic| {
            i16::from(topic.error).encode(buf)?;
            topic.topic.encode(buf)?;
            encode_as_array(buf, &topic.partitions, |buf, partition| {
                i16::from(partition.error).encode(buf)?;
                partition.partition.encode(buf)?;
                partition.leader.encode(buf)?;
                encode_array(buf, &partition.replicas)?;
                encode_array(buf, &partition.isr)
            })
        })
    })
}
