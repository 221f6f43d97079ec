use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::Producer;
use crate::client::KafkaClient;
use crate::config::ProducerConfig;
use crate::error::{Error, Result};
use crate::protocol::ProduceResponse;
use crate::types::TopicAndPartition;

/// Partition ids of one topic, visited in a fixed cycle.
#[derive(Debug)]
struct PartitionCycle {
    partitions: Vec<i32>,
    next: usize,
}

impl PartitionCycle {
    fn new(partitions: Vec<i32>, start: usize) -> Self {
        let next = start % partitions.len().max(1);
        Self { partitions, next }
    }

    fn next_partition(&mut self) -> i32 {
        let partition = self.partitions[self.next];
        self.next = (self.next + 1) % self.partitions.len();
        partition
    }
}

/// Unkeyed producer: spreads messages over a topic's partitions round-robin.
///
/// The cycle for a topic is built from the first metadata seen for it and,
/// with `random_start`, begins at a random partition so that many short-lived
/// producers do not all hit partition 0 first.
pub struct SimpleProducer {
    base: Producer,
    partition_cycles: HashMap<String, PartitionCycle>,
}

impl SimpleProducer {
    pub fn new(client: KafkaClient, config: ProducerConfig) -> Result<Self> {
        Ok(Self {
            base: Producer::new(client, config)?,
            partition_cycles: HashMap::new(),
        })
    }

    pub fn producer(&self) -> &Producer {
        &self.base
    }

    pub fn producer_mut(&mut self) -> &mut Producer {
        &mut self.base
    }

    async fn next_partition(&mut self, topic: &str) -> Result<i32> {
        if !self.partition_cycles.contains_key(topic) {
            let client = self.base.client_mut();
            if !client.has_metadata_for_topic(topic) {
                client.load_metadata_for_topics(&[topic]).await?;
            }

            let partitions = client.get_partition_ids_for_topic(topic);
            if partitions.is_empty() {
                return Err(Error::UnknownTopicOrPartition(TopicAndPartition::new(topic, -1)));
            }

            let start = if self.base.config().random_start {
                fastrand::usize(..partitions.len())
            } else {
                0
            };
            debug!(topic, partitions = partitions.len(), start, "Built partition cycle");
            self.partition_cycles
                .insert(topic.to_string(), PartitionCycle::new(partitions, start));
        }

        match self.partition_cycles.get_mut(topic) {
            Some(cycle) => Ok(cycle.next_partition()),
            None => Err(Error::UnknownTopicOrPartition(TopicAndPartition::new(topic, -1))),
        }
    }

    /// Send `payloads` to the next partition of `topic` in the cycle.
    pub async fn send_messages(&mut self, topic: &str, payloads: &[Bytes]) -> Result<Vec<ProduceResponse>> {
        let partition = self.next_partition(topic).await?;
        self.base.send_messages(topic, partition, None, payloads).await
    }

    pub async fn stop(&mut self) {
        self.base.stop().await
    }

    pub async fn stop_with_timeout(&mut self, timeout: Duration) {
        self.base.stop_with_timeout(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_wraps_around() {
        let mut cycle = PartitionCycle::new(vec![0, 1, 2], 0);
        let seen: Vec<i32> = (0..7).map(|_| cycle.next_partition()).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_cycle_honours_start() {
        let mut cycle = PartitionCycle::new(vec![4, 5, 6], 2);
        assert_eq!(cycle.next_partition(), 6);
        assert_eq!(cycle.next_partition(), 4);

        let mut cycle = PartitionCycle::new(vec![4, 5, 6], 5);
        assert_eq!(cycle.next_partition(), 6);
    }
}
