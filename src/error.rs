//! Crate & protocol level errors.
//!
//! Errors fall into four families:
//!
//! - **Transport**: [`Error::IoError`], [`Error::Connection`] and [`Error::Timeout`] are
//!   raised by a [`BrokerConnection`](crate::connection::BrokerConnection). At the client
//!   layer a broker that fails mid-batch is reported through [`Error::FailedPayloads`].
//! - **Broker reported**: a non-zero [`KafkaCode`] in a per-partition response surfaces as
//!   [`Error::Kafka`].
//! - **Decoding**: checksum mismatches, truncated bodies and unsupported codecs.
//! - **Usage**: invalid arguments, configuration mistakes and calls on a stopped producer.

use bytes::Bytes;
use std::{fmt, io, result};
use thiserror::Error as ThisError;

use crate::protocol::{
    FetchResponse, OffsetCommitResponse, OffsetFetchResponse, OffsetResponse, ProduceResponse,
};
use crate::types::TopicAndPartition;

pub type Result<T> = result::Result<T, Error>;

/// Client, protocol and connection level errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// The broker at `host:port` could not be reached or went away mid-request.
    #[error("Kafka @ {host}:{port} went away: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    /// A socket operation exceeded the configured timeout.
    #[error("Socket operation timed out")]
    Timeout,

    /// Some brokers of a batch never answered. Responses from the healthy
    /// brokers are still available through [`FailedPayloads::responses`].
    #[error("{0}")]
    FailedPayloads(Box<FailedPayloads>),

    /// Every seed broker failed to answer a metadata request.
    #[error("All servers failed to process request: {0}")]
    KafkaUnavailable(String),

    /// The partition exists but currently has no leader.
    #[error("Leader not available for {0}")]
    LeaderNotAvailable(TopicAndPartition),

    /// The partition is not present in the cluster metadata.
    #[error("Unknown topic or partition {0}")]
    UnknownTopicOrPartition(TopicAndPartition),

    /// A broker reported an error code for a partition.
    #[error("Kafka error {code:?} for {topic}:{partition}")]
    Kafka {
        code: KafkaCode,
        topic: String,
        partition: i32,
    },

    /// A complete message did not match its stored CRC.
    #[error("Message checksum failed: expected {expected:#010x}, computed {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or connection closed.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// A fetch returned a message set that could not hold a single complete message.
    #[error("Fetch buffer too small to hold a single message")]
    FetchBufferTooSmall,

    /// The attribute bits name a codec that is unknown or not compiled in.
    #[error("Codec 0x{0:02x} unsupported")]
    UnsupportedCodec(i8),

    /// Compressing or decompressing a payload failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The response did not carry the correlation id of the request.
    #[error("Correlation id mismatch: expected {expected}, received {actual}")]
    CorrelationMismatch { expected: i32, actual: i32 },

    /// A caller supplied an argument outside the allowed range.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The producer has been stopped and no longer accepts messages.
    #[error("Producer has been stopped")]
    ProducerStopped,
}

impl Error {
    /// Build the typed error for a non-zero broker error code.
    pub fn from_code(code: KafkaCode, topic: impl Into<String>, partition: i32) -> Self {
        Error::Kafka {
            code,
            topic: topic.into(),
            partition,
        }
    }

    /// The broker error code carried by this error, if any.
    pub fn kafka_code(&self) -> Option<KafkaCode> {
        match self {
            Error::Kafka { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error came from the network rather than from a broker answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::Connection { .. } | Error::Timeout
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<Box<dyn std::error::Error>> for Error {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        Error::Config(e.to_string())
    }
}

/// The outcome of a broker-aware batch in which at least one broker failed.
#[derive(Clone, Debug)]
pub struct FailedPayloads {
    /// Partitions whose request got no usable response, in caller order.
    pub failed: Vec<TopicAndPartition>,
    /// Decoded responses from the brokers that did answer, in caller order.
    pub responses: PartialResponses,
}

impl fmt::Display for FailedPayloads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed payloads for {} partition(s): ", self.failed.len())?;
        for (i, tp) in self.failed.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", tp)?;
        }
        Ok(())
    }
}

/// Responses that were successfully decoded before a batch was declared failed.
#[derive(Clone, Debug)]
pub enum PartialResponses {
    Produce(Vec<ProduceResponse>),
    Fetch(Vec<FetchResponse>),
    Offset(Vec<OffsetResponse>),
    OffsetCommit(Vec<OffsetCommitResponse>),
    OffsetFetch(Vec<OffsetFetchResponse>),
}

impl PartialResponses {
    pub fn len(&self) -> usize {
        match self {
            PartialResponses::Produce(v) => v.len(),
            PartialResponses::Fetch(v) => v.len(),
            PartialResponses::Offset(v) => v.len(),
            PartialResponses::OffsetCommit(v) => v.len(),
            PartialResponses::OffsetFetch(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum KafkaCode {
    /// An unexpected server error, or a code this client does not know.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// There is currently no leader for this partition
    /// and hence it is unavailable for writes.
    LeaderNotAvailable = 5,
    /// The client sent a request to a replica that is not the leader
    /// for the partition. Its metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut = 7,
    /// Used mostly by tools when a broker is not alive.
    BrokerNotAvailable = 8,
    /// A replica is expected on a broker but is not. Safe to ignore
    /// for clients, which only talk to leaders.
    ReplicaNotAvailable = 9,
    /// The message is larger than the broker's maximum message size.
    MessageSizeTooLarge = 10,
    /// Internal error code for broker-to-broker communication.
    StaleControllerEpoch = 11,
    /// The offset metadata string is larger than the configured maximum.
    OffsetMetadataTooLarge = 12,
    /// The broker disconnected before the response was complete.
    NetworkException = 13,
    /// The offset store is still loading.
    OffsetsLoadInProgress = 14,
    /// The offset store is not available.
    ConsumerCoordinatorNotAvailable = 15,
    /// The broker is not the coordinator for this consumer group.
    NotCoordinatorForConsumer = 16,
}

impl From<i16> for KafkaCode {
    fn from(code: i16) -> Self {
        match code {
            0 => KafkaCode::None,
            1 => KafkaCode::OffsetOutOfRange,
            2 => KafkaCode::CorruptMessage,
            3 => KafkaCode::UnknownTopicOrPartition,
            4 => KafkaCode::InvalidMessageSize,
            5 => KafkaCode::LeaderNotAvailable,
            6 => KafkaCode::NotLeaderForPartition,
            7 => KafkaCode::RequestTimedOut,
            8 => KafkaCode::BrokerNotAvailable,
            9 => KafkaCode::ReplicaNotAvailable,
            10 => KafkaCode::MessageSizeTooLarge,
            11 => KafkaCode::StaleControllerEpoch,
            12 => KafkaCode::OffsetMetadataTooLarge,
            13 => KafkaCode::NetworkException,
            14 => KafkaCode::OffsetsLoadInProgress,
            15 => KafkaCode::ConsumerCoordinatorNotAvailable,
            16 => KafkaCode::NotCoordinatorForConsumer,
            _ => KafkaCode::Unknown,
        }
    }
}

impl From<KafkaCode> for i16 {
    fn from(code: KafkaCode) -> Self {
        code as i16
    }
}

impl KafkaCode {
    pub fn is_ok(self) -> bool {
        self == KafkaCode::None
    }

    /// Codes after which the cached leadership of the topic can no longer be trusted.
    pub fn invalidates_metadata(self) -> bool {
        match self {
            KafkaCode::UnknownTopicOrPartition | KafkaCode::NotLeaderForPartition => true,
            KafkaCode::Unknown
            | KafkaCode::None
            | KafkaCode::OffsetOutOfRange
            | KafkaCode::CorruptMessage
            | KafkaCode::InvalidMessageSize
            | KafkaCode::LeaderNotAvailable
            | KafkaCode::RequestTimedOut
            | KafkaCode::BrokerNotAvailable
            | KafkaCode::ReplicaNotAvailable
            | KafkaCode::MessageSizeTooLarge
            | KafkaCode::StaleControllerEpoch
            | KafkaCode::OffsetMetadataTooLarge
            | KafkaCode::NetworkException
            | KafkaCode::OffsetsLoadInProgress
            | KafkaCode::ConsumerCoordinatorNotAvailable
            | KafkaCode::NotCoordinatorForConsumer => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_code_from_known_values() {
        assert_eq!(KafkaCode::from(0), KafkaCode::None);
        assert_eq!(KafkaCode::from(3), KafkaCode::UnknownTopicOrPartition);
        assert_eq!(KafkaCode::from(6), KafkaCode::NotLeaderForPartition);
        assert_eq!(KafkaCode::from(16), KafkaCode::NotCoordinatorForConsumer);
    }

    #[test]
    fn test_kafka_code_from_unknown_values() {
        assert_eq!(KafkaCode::from(-1), KafkaCode::Unknown);
        assert_eq!(KafkaCode::from(99), KafkaCode::Unknown);
        assert_eq!(KafkaCode::from(i16::MIN), KafkaCode::Unknown);
    }

    #[test]
    fn test_kafka_code_round_trips_through_i16() {
        for raw in -1i16..=16 {
            assert_eq!(i16::from(KafkaCode::from(raw)), raw);
        }
    }

    #[test]
    fn test_invalidates_metadata() {
        assert!(KafkaCode::NotLeaderForPartition.invalidates_metadata());
        assert!(KafkaCode::UnknownTopicOrPartition.invalidates_metadata());
        assert!(!KafkaCode::OffsetOutOfRange.invalidates_metadata());
        assert!(!KafkaCode::None.invalidates_metadata());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, Error::IoError(io::ErrorKind::ConnectionReset)));
        assert!(err.is_transport());
    }

    #[test]
    fn test_kafka_code_accessor() {
        let err = Error::from_code(KafkaCode::RequestTimedOut, "t", 2);
        assert_eq!(err.kafka_code(), Some(KafkaCode::RequestTimedOut));
        assert!(!err.is_transport());
        assert_eq!(Error::Timeout.kafka_code(), None);
    }

    #[test]
    fn test_failed_payloads_display() {
        let failed = FailedPayloads {
            failed: vec![
                TopicAndPartition::new("t", 1),
                TopicAndPartition::new("t", 3),
            ],
            responses: PartialResponses::Produce(vec![]),
        };
        let err = Error::FailedPayloads(Box::new(failed));
        assert_eq!(err.to_string(), "Failed payloads for 2 partition(s): t:1, t:3");
    }
}
