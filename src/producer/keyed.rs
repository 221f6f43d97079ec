use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use super::Producer;
use crate::client::KafkaClient;
use crate::config::ProducerConfig;
use crate::error::{Error, Result};
use crate::partitioner::{HashedPartitioner, Partitioner};
use crate::protocol::ProduceResponse;
use crate::types::TopicAndPartition;

/// Keyed producer: the partition of every message is chosen by `P` from its key.
///
/// One partitioner instance is kept per topic.
pub struct KeyedProducer<P: Partitioner + Default = HashedPartitioner> {
    base: Producer,
    partitioners: HashMap<String, P>,
}

impl<P: Partitioner + Default> KeyedProducer<P> {
    pub fn new(client: KafkaClient, config: ProducerConfig) -> Result<Self> {
        Ok(Self {
            base: Producer::new(client, config)?,
            partitioners: HashMap::new(),
        })
    }

    pub fn producer(&self) -> &Producer {
        &self.base
    }

    pub fn producer_mut(&mut self) -> &mut Producer {
        &mut self.base
    }

    async fn next_partition(&mut self, topic: &str, key: &[u8]) -> Result<i32> {
        let client = self.base.client_mut();
        if !client.has_metadata_for_topic(topic) {
            client.load_metadata_for_topics(&[topic]).await?;
        }

        let partitions = client.get_partition_ids_for_topic(topic);
        if partitions.is_empty() {
            return Err(Error::UnknownTopicOrPartition(TopicAndPartition::new(topic, -1)));
        }

        self.partitioners
            .entry(topic.to_string())
            .or_default()
            .partition(key, &partitions)
    }

    /// Send `payloads` keyed by `key` to the partition the partitioner picks.
    pub async fn send_messages(
        &mut self,
        topic: &str,
        key: Bytes,
        payloads: &[Bytes],
    ) -> Result<Vec<ProduceResponse>> {
        let partition = self.next_partition(topic, &key).await?;
        self.base.send_messages(topic, partition, Some(key), payloads).await
    }

    pub async fn stop(&mut self) {
        self.base.stop().await
    }

    pub async fn stop_with_timeout(&mut self, timeout: Duration) {
        self.base.stop_with_timeout(timeout).await
    }
}
