//! Key to partition strategies used by the keyed producer.

use murmur2::{KAFKA_SEED, murmur2};

use crate::error::{Error, Result};

/// Picks one of a topic's partitions for a message key.
pub trait Partitioner: Send {
    /// `partitions` is the topic's current partition id list, in ascending order.
    fn partition(&mut self, key: &[u8], partitions: &[i32]) -> Result<i32>;
}

fn ensure_partitions(partitions: &[i32]) -> Result<()> {
    if partitions.is_empty() {
        return Err(Error::InvalidArgument("topic has no partitions".into()));
    }
    Ok(())
}

/// Same key, same partition: murmur2 of the key modulo the partition count.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedPartitioner;

impl Partitioner for HashedPartitioner {
    fn partition(&mut self, key: &[u8], partitions: &[i32]) -> Result<i32> {
        ensure_partitions(partitions)?;
        let hash = murmur2(key, KAFKA_SEED) & 0x7fff_ffff;
        Ok(partitions[hash as usize % partitions.len()])
    }
}

/// Ignores the key and cycles through the partitions in order.
///
/// The cycle restarts from the first partition whenever the partition list changes.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinPartitioner {
    partitions: Vec<i32>,
    next: usize,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&mut self, _key: &[u8], partitions: &[i32]) -> Result<i32> {
        ensure_partitions(partitions)?;

        if self.partitions != partitions {
            self.partitions = partitions.to_vec();
            self.next = 0;
        }

        let partition = self.partitions[self.next];
        self.next = (self.next + 1) % self.partitions.len();
        Ok(partition)
    }
}
