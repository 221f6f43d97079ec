//! # Kafkaesque Client
//! Broker-aware Kafka client speaking the version 0 wire protocol.
//!
//! The crate covers the whole path from bytes on the wire to partitioned
//! producers and consumers:
//!
//! - a bit-exact codec for Produce, Fetch, Offset, Metadata, OffsetCommit and
//!   OffsetFetch, including message sets with gzip and snappy compression
//! - [`KafkaClient`](client::KafkaClient), which caches the cluster topology,
//!   routes every partition request to its leader and invalidates stale
//!   leadership on broker errors
//! - [`SimpleProducer`](producer::SimpleProducer) and
//!   [`KeyedProducer`](producer::KeyedProducer), synchronous or batched in a
//!   background task
//! - [`SimpleConsumer`](consumer::SimpleConsumer) and
//!   [`MultiProcessConsumer`](consumer::MultiProcessConsumer) with
//!   broker-side offset commits
//!
//! ## Getting started
//! ```toml
//! kafkaesque-client = "0.1"
//! ```
//!
//! ### Producing and consuming
//! ```rust,no_run
//! use kafkaesque_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = KafkaClient::connect(ClientConfig::with_hosts("localhost:9092")).await?;
//!
//!     let mut producer = SimpleProducer::new(client.fork(), ProducerConfig::default())?;
//!     producer
//!         .send_messages("events", &[Bytes::from_static(b"hello")])
//!         .await?;
//!
//!     let mut consumer =
//!         SimpleConsumer::new(client, Some("my-group"), "events", ConsumerConfig::default()).await?;
//!     for message in consumer.get_messages(10, true, Some(std::time::Duration::from_secs(1))).await? {
//!         println!("{}@{}: {:?}", message.partition, message.offset, message.message.value);
//!     }
//!     consumer.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Guide](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod constants;
pub mod consumer;
pub mod partitioner;
pub mod producer;
pub mod telemetry;

pub mod prelude {
    //! Main export of client structures
    //!
    //! ```rust,no_run
    //! use kafkaesque_client::prelude::*;
    //!
    //! # async fn run() -> Result<()> {
    //! let client = KafkaClient::connect(ClientConfig::with_hosts("localhost:9092")).await?;
    //! let partitions = client.get_partition_ids_for_topic("events");
    //! # Ok(())
    //! # }
    //! ```
    pub use crate::client::KafkaClient;
    pub use crate::config::{
        ClientConfig, ConsumerConfig, MultiProcessConfig, OffsetReset, ProducerConfig,
    };
    pub use crate::consumer::{ConsumedMessage, MultiProcessConsumer, SimpleConsumer};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::partitioner::{HashedPartitioner, Partitioner, RoundRobinPartitioner};
    pub use crate::producer::{KeyedProducer, SimpleProducer};
    pub use crate::protocol::{
        FetchRequest, Message, OffsetCommitRequest, OffsetFetchRequest, OffsetRequest,
        ProduceRequest,
    };
    pub use crate::types::{CodecKind, TopicAndPartition};

    pub use bytes;
    pub use bytes::Bytes;
}
