//! Value types shared by the codec, the client and its front-ends.

use std::fmt;

use crate::constants::{ATTRIBUTE_CODEC_MASK, CODEC_GZIP, CODEC_NONE, CODEC_SNAPPY};
use crate::error::{Error, KafkaCode, Result};

/// The `(topic, partition)` key used for grouping, caching and reordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicAndPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicAndPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicAndPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// Anything addressed to, or answering for, a single topic partition.
pub trait Payload {
    fn topic(&self) -> &str;
    fn partition(&self) -> i32;

    fn topic_and_partition(&self) -> TopicAndPartition {
        TopicAndPartition::new(self.topic(), self.partition())
    }
}

/// A per-partition response record carrying a broker error code.
pub trait PartitionResponse: Payload {
    fn error(&self) -> KafkaCode;

    /// Turn a non-zero error code into a typed [`Error::Kafka`].
    fn check_error(&self) -> Result<()> {
        match self.error() {
            KafkaCode::None => Ok(()),
            code => Err(Error::from_code(code, self.topic(), self.partition())),
        }
    }
}

/// A cluster member as advertised by a metadata response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    pub fn new(node_id: i32, host: impl Into<String>, port: i32) -> Self {
        Self {
            node_id,
            host: host.into(),
            port,
        }
    }
}

/// Leadership and replica placement of one partition.
///
/// A `leader` of `-1` means the partition currently has no leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub error: KafkaCode,
}

impl PartitionMetadata {
    pub fn has_leader(&self) -> bool {
        self.leader >= 0
    }
}

/// Per-topic block of a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub error: KafkaCode,
    pub partitions: Vec<PartitionMetadata>,
}

/// Compression codec carried in the low two bits of a message's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecKind {
    #[default]
    None,
    Gzip,
    /// Snappy block compression.
    Block,
}

impl CodecKind {
    /// Decode the codec bits of a message attribute byte.
    pub fn from_attributes(attributes: i8) -> Result<Self> {
        match attributes & ATTRIBUTE_CODEC_MASK {
            CODEC_NONE => Ok(CodecKind::None),
            CODEC_GZIP => Ok(CodecKind::Gzip),
            CODEC_SNAPPY => Ok(CodecKind::Block),
            other => Err(Error::UnsupportedCodec(other)),
        }
    }

    /// The attribute bits selecting this codec.
    pub fn attribute(self) -> i8 {
        match self {
            CodecKind::None => CODEC_NONE,
            CodecKind::Gzip => CODEC_GZIP,
            CodecKind::Block => CODEC_SNAPPY,
        }
    }

    /// Whether the codec was compiled into this build.
    pub fn is_available(self) -> bool {
        match self {
            CodecKind::None => true,
            CodecKind::Gzip => cfg!(feature = "gzip"),
            CodecKind::Block => cfg!(feature = "snappy"),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(CodecKind::None),
            "gzip" => Ok(CodecKind::Gzip),
            "snappy" | "block" => Ok(CodecKind::Block),
            other => Err(Error::Config(format!("unknown codec '{}'", other))),
        }
    }
}
