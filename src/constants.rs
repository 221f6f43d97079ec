//! Centralized protocol constants and client defaults.
//!
//! # Categories
//!
//! - **Protocol Constants**: API keys, message layout and codec bits
//! - **Compression Constants**: xerial snappy framing
//! - **Client Defaults**: socket, producer and consumer tuning

// =============================================================================
// Protocol Constants (Kafka Wire Protocol, version 0)
// =============================================================================

/// Every request this client sends uses API version 0.
pub const API_VERSION: i16 = 0;

pub const API_KEY_PRODUCE: i16 = 0;
pub const API_KEY_FETCH: i16 = 1;
pub const API_KEY_OFFSET: i16 = 2;
pub const API_KEY_METADATA: i16 = 3;
pub const API_KEY_OFFSET_COMMIT: i16 = 8;
pub const API_KEY_OFFSET_FETCH: i16 = 9;

/// Replica id sent by ordinary clients in Fetch and Offset requests.
pub const CONSUMER_REPLICA_ID: i32 = -1;

/// Message format version written by this client.
pub const MESSAGE_MAGIC: i8 = 0;

/// Low two attribute bits select the compression codec.
pub const ATTRIBUTE_CODEC_MASK: i8 = 0x03;
pub const CODEC_NONE: i8 = 0x00;
pub const CODEC_GZIP: i8 = 0x01;
pub const CODEC_SNAPPY: i8 = 0x02;

/// crc (4) + magic (1) + attributes (1) + key length (4) + value length (4).
pub const MESSAGE_OVERHEAD: usize = 14;

/// offset (8) + message size (4) in front of every message of a set.
pub const MESSAGE_SET_ENTRY_OVERHEAD: usize = 12;

/// Offset request `time` asking for the next offset to be written.
pub const LATEST_OFFSET_TIME: i64 = -1;

/// Offset request `time` asking for the oldest retained offset.
pub const EARLIEST_OFFSET_TIME: i64 = -2;

/// Upper bound on decoded array lengths, guarding against corrupt length fields.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Upper bound on a response frame accepted from a broker (256 MiB).
pub const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

// =============================================================================
// Compression Constants
// =============================================================================

/// Magic prefix of the xerial snappy stream: `0x82 "SNAPPY" 0x00`.
pub const XERIAL_MAGIC: [u8; 8] = [0x82, b'S', b'N', b'A', b'P', b'P', b'Y', 0x00];

/// Stream version written after the magic.
pub const XERIAL_VERSION: i32 = 1;

/// Oldest reader version able to consume the stream.
pub const XERIAL_MIN_COMPAT_VERSION: i32 = 1;

/// Magic (8) + version (4) + compatible version (4).
pub const XERIAL_HEADER_SIZE: usize = 16;

/// Uncompressed size of every xerial chunk except possibly the last.
pub const XERIAL_BLOCK_SIZE: usize = 32 * 1024;

// =============================================================================
// Client Defaults
// =============================================================================

pub const DEFAULT_KAFKA_PORT: u16 = 9092;

pub const DEFAULT_CLIENT_ID: &str = "kafkaesque-client";

/// Socket timeout applied to connect, send and receive.
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 120_000;

/// Pause between metadata reloads while waiting for a topic to appear.
pub const ENSURE_TOPIC_POLL_MS: u64 = 500;

// -----------------------------------------------------------------------------
// Producer
// -----------------------------------------------------------------------------

/// No acknowledgement; the broker sends no response.
pub const ACK_NOT_REQUIRED: i16 = 0;

/// Acknowledge once the leader wrote the messages to its log.
pub const ACK_AFTER_LOCAL_WRITE: i16 = 1;

/// Acknowledge once every in-sync replica has the messages.
pub const ACK_AFTER_CLUSTER_COMMIT: i16 = -1;

pub const DEFAULT_ACK_TIMEOUT_MS: i32 = 1000;

pub const BATCH_SEND_MSG_COUNT: usize = 20;

pub const BATCH_SEND_DEFAULT_INTERVAL_SECS: u64 = 20;

/// Flush interval used by an async producer that is not batching.
pub const UNBATCHED_SEND_INTERVAL_SECS: u64 = 3600;

pub const DEFAULT_PRODUCER_STOP_TIMEOUT_MS: u64 = 1000;

// -----------------------------------------------------------------------------
// Consumer
// -----------------------------------------------------------------------------

pub const AUTO_COMMIT_MSG_COUNT: usize = 100;

pub const AUTO_COMMIT_INTERVAL_MS: u64 = 5000;

/// Minimum bytes a non-blocking fetch asks the broker to accumulate.
pub const FETCH_MIN_BYTES: i32 = 4096;

/// Initial per-partition fetch byte budget.
pub const FETCH_BUFFER_SIZE_BYTES: i32 = 4096;

/// Largest per-partition fetch byte budget the consumer grows to.
pub const MAX_FETCH_BUFFER_SIZE_BYTES: i32 = 32768 * 8;

/// Broker-side wait for a non-blocking fetch.
pub const FETCH_MAX_WAIT_TIME_MS: i32 = 100;

/// Broker-side wait for a blocking fetch when the caller gave no timeout.
pub const FETCH_DEFAULT_BLOCK_TIMEOUT_MS: u64 = 1000;

/// Capacity of the queue between multi-process consumer workers and the coordinator.
pub const MULTIPROCESS_QUEUE_CAPACITY: usize = 1024;

/// Pause of a worker whose fetch came back empty.
pub const NO_MESSAGES_WAIT_TIME_MS: u64 = 100;

/// Longest wait of a worker blocked on a full queue before it rechecks `exit`.
pub const FULL_QUEUE_WAIT_TIME_MS: u64 = 100;

/// Ceiling of the restart backoff of a failing consumer worker.
pub const MAX_BACKOFF_SECS: u64 = 60;
