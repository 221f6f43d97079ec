use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{ConsumedMessage, Consumer};
use crate::client::KafkaClient;
use crate::config::{ConsumerConfig, OffsetReset};
use crate::constants::{FETCH_DEFAULT_BLOCK_TIMEOUT_MS, NO_MESSAGES_WAIT_TIME_MS};
use crate::error::{Error, FailedPayloads, KafkaCode, PartialResponses, Result};
use crate::protocol::{FetchRequest, FetchResponse, OffsetRequest};
use crate::types::PartitionResponse;

fn duration_ms(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

/// Reads the partitions of one topic through a local prefetch buffer.
///
/// Every fetch asks each owned partition for at most its current byte
/// budget. A partition whose next message does not fit gets its budget
/// doubled, up to `max_buffer_size`, and is fetched again; budgets never
/// shrink.
pub struct SimpleConsumer {
    base: Consumer,
    fetch_offsets: BTreeMap<i32, i64>,
    buffer_sizes: BTreeMap<i32, i32>,
    queue: VecDeque<ConsumedMessage>,
    partition_info: bool,
}

impl SimpleConsumer {
    pub async fn new(
        client: KafkaClient,
        group: Option<&str>,
        topic: &str,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let base = Consumer::new(client, group, topic, config).await?;
        let fetch_offsets = base.offsets().await;
        let buffer_size = base.config().buffer_size;
        let buffer_sizes = base.partitions().iter().map(|p| (*p, buffer_size)).collect();

        Ok(Self {
            base,
            fetch_offsets,
            buffer_sizes,
            queue: VecDeque::new(),
            partition_info: false,
        })
    }

    pub fn consumer(&self) -> &Consumer {
        &self.base
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.base
    }

    /// Mark the consumer as one whose caller wants partition numbers.
    ///
    /// [`ConsumedMessage`] always carries the partition; the flag is kept for
    /// callers that inspect it.
    pub fn provide_partition_info(&mut self) {
        self.partition_info = true;
    }

    pub fn partition_info(&self) -> bool {
        self.partition_info
    }

    /// Current fetch budget of `partition`.
    pub fn buffer_size(&self, partition: i32) -> Option<i32> {
        self.buffer_sizes.get(&partition).copied()
    }

    /// Messages fetched but not handed out yet.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    pub async fn offsets(&self) -> BTreeMap<i32, i64> {
        self.base.offsets().await
    }

    pub async fn commit(&mut self, partitions: Option<&[i32]>) -> Result<()> {
        self.base.commit(partitions).await
    }

    pub async fn pending(&mut self, partitions: Option<&[i32]>) -> Result<i64> {
        self.base.pending(partitions).await
    }

    /// Replace the offsets of the given partitions and drop anything prefetched.
    pub(crate) async fn reset_offsets(&mut self, offsets: &BTreeMap<i32, i64>) {
        let mut state = self.base.shared_offsets().lock().await;
        for (partition, offset) in offsets {
            if state.offsets.contains_key(partition) {
                state.offsets.insert(*partition, *offset);
                self.fetch_offsets.insert(*partition, *offset);
            }
        }
        self.queue.clear();
    }

    /// Reposition every partition.
    ///
    /// `whence` 0 counts from the earliest offsets, 1 from the current ones and
    /// 2 from the latest ones. For 0 and 2 the offset is split evenly across
    /// the partitions in ascending order, the remainder going one each to the
    /// first partitions.
    pub async fn seek(&mut self, offset: i64, whence: i32) -> Result<()> {
        let partitions: Vec<i32> = self.base.offsets().await.keys().copied().collect();
        let topic = self.base.topic().to_string();

        let new_offsets: BTreeMap<i32, i64> = match whence {
            1 => {
                let state = self.base.shared_offsets().lock().await;
                let shifted = state.offsets.iter().map(|(p, o)| (*p, o + offset)).collect();
                drop(state);
                shifted
            }
            0 | 2 => {
                let n = partitions.len() as i64;
                let delta = offset.div_euclid(n);
                let rem = offset.rem_euclid(n);
                let deltas: BTreeMap<i32, i64> = partitions
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (*p, delta + i64::from((i as i64) < rem)))
                    .collect();

                let requests: Vec<OffsetRequest> = partitions
                    .iter()
                    .map(|p| {
                        if whence == 0 {
                            OffsetRequest::earliest(topic.as_str(), *p)
                        } else {
                            OffsetRequest::latest(topic.as_str(), *p)
                        }
                    })
                    .collect();
                let responses = self
                    .base
                    .client_mut()
                    .send_offset_request(&requests, true)
                    .await?;

                let mut new_offsets = BTreeMap::new();
                for response in responses {
                    let base_offset = response.offsets.first().copied().ok_or_else(|| {
                        Error::MissingData(format!("no offset returned for partition {}", response.partition))
                    })?;
                    let delta = deltas.get(&response.partition).copied().unwrap_or_default();
                    new_offsets.insert(response.partition, base_offset + delta);
                }
                new_offsets
            }
            other => return Err(Error::InvalidArgument(format!("unknown seek whence {}", other))),
        };

        debug!(topic = %topic, offset, whence, offsets = ?new_offsets, "Seeking");
        self.reset_offsets(&new_offsets).await;

        if self.base.config().auto_commit {
            self.base.shared_offsets().lock().await.count_since_commit += 1;
            self.base.commit(None).await?;
        }
        Ok(())
    }

    /// Take up to `count` messages.
    ///
    /// Without `block` the call returns as soon as a fetch comes back empty.
    /// With `block` it keeps fetching until `count` messages arrived or
    /// `timeout` passed; `None` waits indefinitely.
    pub async fn get_messages(
        &mut self,
        count: usize,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ConsumedMessage>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut messages = Vec::with_capacity(count);

        while messages.len() < count {
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    Some(remaining)
                }
                None => None,
            };

            match self.next_message(block, remaining).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) if !block => break,
                Ok(None) => {}
                Err(e) => {
                    // hand the collected messages out again on the next call
                    for message in messages.into_iter().rev() {
                        self.queue.push_front(message);
                    }
                    return Err(e);
                }
            }
        }

        self.advance(&messages).await?;
        Ok(messages)
    }

    /// Take one message, fetching if the buffer is empty.
    pub async fn get_message(&mut self, block: bool, timeout: Option<Duration>) -> Result<Option<ConsumedMessage>> {
        let message = self.next_message(block, timeout).await?;
        if let Some(message) = &message {
            self.advance(std::slice::from_ref(message)).await?;
        }
        Ok(message)
    }

    async fn advance(&mut self, messages: &[ConsumedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.base.shared_offsets().lock().await;
            for message in messages {
                state.offsets.insert(message.partition, message.offset + 1);
            }
        }
        self.base.consumed(messages.len()).await
    }

    async fn next_message(&mut self, block: bool, timeout: Option<Duration>) -> Result<Option<ConsumedMessage>> {
        let start = Instant::now();

        while self.queue.is_empty() {
            let (max_wait_time_ms, min_bytes) = if block {
                let wait = timeout
                    .filter(|t| !t.is_zero())
                    .unwrap_or(Duration::from_millis(FETCH_DEFAULT_BLOCK_TIMEOUT_MS));
                (duration_ms(wait), 1)
            } else {
                (self.base.config().fetch_max_wait_time_ms, 0)
            };

            let fetched = self.fetch_with(max_wait_time_ms, min_bytes).await?;

            if !block {
                break;
            }
            let mut pause = Duration::from_millis(NO_MESSAGES_WAIT_TIME_MS);
            if let Some(timeout) = timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    break;
                }
                pause = pause.min(timeout - elapsed);
            }
            if fetched == 0 {
                tokio::time::sleep(pause).await;
            }
        }

        Ok(self.queue.pop_front())
    }

    /// Refill the prefetch buffer once with the configured fetch parameters.
    ///
    /// Returns the number of messages added.
    pub async fn fetch(&mut self) -> Result<usize> {
        let config = self.base.config();
        let (max_wait_time_ms, min_bytes) = (config.fetch_max_wait_time_ms, config.fetch_size_bytes);
        self.fetch_with(max_wait_time_ms, min_bytes).await
    }

    async fn fetch_with(&mut self, max_wait_time_ms: i32, min_bytes: i32) -> Result<usize> {
        let topic = self.base.topic().to_string();
        let mut pending: BTreeMap<i32, i32> = self
            .fetch_offsets
            .keys()
            .map(|p| (*p, self.buffer_sizes.get(p).copied().unwrap_or(self.base.config().buffer_size)))
            .collect();
        let mut retried: HashSet<i32> = HashSet::new();
        let mut queued = 0;

        while !pending.is_empty() {
            let requests: Vec<FetchRequest> = pending
                .iter()
                .map(|(p, size)| {
                    let offset = self.fetch_offsets.get(p).copied().unwrap_or_default();
                    FetchRequest::new(topic.as_str(), *p, offset, *size)
                })
                .collect();

            let mut retry = BTreeMap::new();
            let responses = match self
                .base
                .client_mut()
                .send_fetch_request(&requests, max_wait_time_ms, min_bytes, false)
                .await
            {
                Ok(responses) => responses,
                Err(Error::FailedPayloads(failure)) => {
                    if failure.failed.iter().any(|tp| retried.contains(&tp.partition)) {
                        return Err(Error::FailedPayloads(failure));
                    }
                    warn!(topic = %topic, failed = ?failure.failed, "Failed payloads, resending failed requests");
                    let FailedPayloads { failed, responses } = *failure;
                    for tp in failed {
                        retried.insert(tp.partition);
                        if let Some(size) = pending.get(&tp.partition) {
                            retry.insert(tp.partition, *size);
                        }
                    }
                    match responses {
                        PartialResponses::Fetch(responses) => responses,
                        _ => Vec::new(),
                    }
                }
                Err(e) => return Err(e),
            };

            for response in responses {
                let partition = response.partition;
                let Some(&size) = pending.get(&partition) else {
                    continue;
                };

                match response.error {
                    KafkaCode::None => {}
                    KafkaCode::NotLeaderForPartition if retried.insert(partition) => {
                        // the client already dropped the topic's leaders
                        debug!(topic = %topic, partition, "Not leader for partition, retrying");
                        retry.insert(partition, size);
                        continue;
                    }
                    KafkaCode::OffsetOutOfRange if retried.insert(partition) => {
                        warn!(topic = %topic, partition, "Offset out of range, resetting partition offset");
                        self.reset_partition_offset(partition).await?;
                        retry.insert(partition, size);
                        continue;
                    }
                    _ => response.check_error()?,
                }

                match self.enqueue(&response) {
                    Ok(count) => queued += count,
                    Err(Error::FetchBufferTooSmall) => {
                        let grown = match self.base.config().max_buffer_size {
                            Some(max) => size.saturating_mul(2).min(max),
                            None => size.saturating_mul(2),
                        };
                        // at the configured maximum, or at i32::MAX when unbounded
                        if grown == size {
                            error!(topic = %topic, partition, max_buffer_size = size, "Max fetch size too small");
                            return Err(Error::FetchBufferTooSmall);
                        }
                        warn!(topic = %topic, partition, buffer_size = grown, "Fetch size too small, increasing and retrying");
                        self.buffer_sizes.insert(partition, grown);
                        retry.insert(partition, grown);
                    }
                    Err(e) => return Err(e),
                }
            }

            pending = retry;
        }

        Ok(queued)
    }

    /// Queue the messages of one partition's response that lie at or after the fetch offset.
    fn enqueue(&mut self, response: &FetchResponse) -> Result<usize> {
        let partition = response.partition;
        let messages = response.messages()?;
        let mut next = self.fetch_offsets.get(&partition).copied().unwrap_or_default();
        let mut count = 0;

        for entry in messages {
            // compressed sets can start before the requested offset
            if entry.offset < next {
                debug!(partition, offset = entry.offset, fetch_offset = next, "Skipping already consumed message");
                continue;
            }
            next = entry.offset + 1;
            self.queue.push_back(ConsumedMessage {
                partition,
                offset: entry.offset,
                message: entry.message,
            });
            count += 1;
        }

        self.fetch_offsets.insert(partition, next);
        Ok(count)
    }

    async fn reset_partition_offset(&mut self, partition: i32) -> Result<()> {
        let topic = self.base.topic().to_string();
        let request = match self.base.config().auto_offset_reset {
            OffsetReset::Largest => OffsetRequest::latest(topic.as_str(), partition),
            OffsetReset::Smallest => OffsetRequest::earliest(topic.as_str(), partition),
            OffsetReset::None => {
                return Err(Error::from_code(KafkaCode::OffsetOutOfRange, topic, partition));
            }
        };

        let responses = self
            .base
            .client_mut()
            .send_offset_request(&[request], true)
            .await?;

        for response in responses {
            let offset = response.offsets.first().copied().ok_or_else(|| {
                Error::MissingData(format!("no offset returned for partition {}", response.partition))
            })?;
            self.base
                .shared_offsets()
                .lock()
                .await
                .offsets
                .insert(response.partition, offset);
            self.fetch_offsets.insert(response.partition, offset);
        }
        Ok(())
    }

    /// Stop auto-committing and commit what was consumed.
    pub async fn stop(&mut self) -> Result<()> {
        self.base.stop().await
    }
}
