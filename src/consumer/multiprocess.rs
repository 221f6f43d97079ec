use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ConsumedMessage, Consumer, Event, SimpleConsumer};
use crate::client::KafkaClient;
use crate::config::{ConsumerConfig, MultiProcessConfig};
use crate::constants::{FULL_QUEUE_WAIT_TIME_MS, NO_MESSAGES_WAIT_TIME_MS};
use crate::error::{Error, Result};

/// Flags and the size hint shared by the coordinator and its workers.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    /// Workers fetch only while this is set.
    pub start: Event,
    /// Workers that reached the size hint wait for this.
    pub pause: Event,
    pub exit: Event,
    /// How many messages the coordinator is currently asking for.
    pub size: AtomicUsize,
}

/// Deal sorted partitions round-robin into `workers` chunks, dropping empty ones.
pub(crate) fn chunk_partitions(partitions: &[i32], workers: usize) -> Vec<Vec<i32>> {
    let mut sorted = partitions.to_vec();
    sorted.sort_unstable();

    let workers = workers.max(1);
    let mut chunks = vec![Vec::new(); workers];
    for (i, partition) in sorted.into_iter().enumerate() {
        chunks[i % workers].push(partition);
    }
    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}

/// Consumes a topic with several worker tasks feeding one bounded queue.
///
/// Each worker owns a forked client and a [`SimpleConsumer`] over its share
/// of the partitions. Offsets only move in the coordinator, once
/// [`MultiProcessConsumer::get_messages`] hands a message to the caller, so a
/// message left in the queue when the consumer stops is not committed and is
/// delivered again from the committed offset next time.
pub struct MultiProcessConsumer {
    base: Consumer,
    config: MultiProcessConfig,
    queue: mpsc::Receiver<ConsumedMessage>,
    signals: Arc<WorkerSignals>,
    workers: Vec<JoinHandle<()>>,
    chunks: Vec<Vec<i32>>,
}

impl MultiProcessConsumer {
    pub async fn new(
        client: KafkaClient,
        group: Option<&str>,
        topic: &str,
        config: ConsumerConfig,
        mp_config: MultiProcessConfig,
    ) -> Result<Self> {
        mp_config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let base = Consumer::new(client, group, topic, config.clone()).await?;
        let offsets = base.offsets().await;
        let partitions: Vec<i32> = offsets.keys().copied().collect();
        let chunks = chunk_partitions(&partitions, mp_config.worker_count(partitions.len()));

        let (sender, queue) = mpsc::channel(mp_config.queue_capacity);
        let signals = Arc::new(WorkerSignals::default());

        let mut workers = Vec::with_capacity(chunks.len());
        for (id, chunk) in chunks.iter().enumerate() {
            let worker_config = ConsumerConfig {
                auto_commit: false,
                auto_commit_every_n: None,
                auto_commit_every_t: None,
                partitions: Some(chunk.clone()),
                ..config.clone()
            };
            let positions = chunk
                .iter()
                .map(|p| (*p, offsets.get(p).copied().unwrap_or_default()))
                .collect();

            let worker = Worker {
                id,
                template: base.client().fork(),
                group: group.map(str::to_string),
                topic: topic.to_string(),
                config: worker_config,
                positions,
                queue: sender.clone(),
                signals: Arc::clone(&signals),
            };
            workers.push(tokio::spawn(worker.run(mp_config.max_backoff)));
        }

        info!(topic, workers = workers.len(), chunks = ?chunks, "Started consumer workers");

        Ok(Self {
            base,
            config: mp_config,
            queue,
            signals,
            workers,
            chunks,
        })
    }

    pub fn consumer(&self) -> &Consumer {
        &self.base
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.base
    }

    /// Partitions owned by each worker.
    pub fn chunks(&self) -> &[Vec<i32>] {
        &self.chunks
    }

    pub fn signals(&self) -> &WorkerSignals {
        &self.signals
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

    /// Take up to `count` messages from the workers.
    ///
    /// Workers are told to start only while the queue is empty and paused
    /// again before returning, so they never run far ahead of the caller.
    pub async fn get_messages(
        &mut self,
        count: usize,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ConsumedMessage>> {
        let mut messages = Vec::with_capacity(count);
        let deadline = timeout.map(|t| Instant::now() + t);

        self.signals.size.store(count, Ordering::SeqCst);
        self.signals.pause.clear();

        while messages.len() < count {
            let message = match self.queue.try_recv() {
                Ok(message) => Some(message),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => {
                    self.signals.start.set();
                    if !block {
                        None
                    } else {
                        match deadline {
                            Some(deadline) => tokio::time::timeout_at(deadline, self.queue.recv())
                                .await
                                .ok()
                                .flatten(),
                            None => self.queue.recv().await,
                        }
                    }
                }
            };

            match message {
                Some(message) => messages.push(message),
                None => break,
            }
        }

        self.signals.size.store(0, Ordering::SeqCst);
        self.signals.start.clear();
        self.signals.pause.set();

        if !messages.is_empty() {
            {
                let mut state = self.base.shared_offsets().lock().await;
                for message in &messages {
                    state.offsets.insert(message.partition, message.offset + 1);
                }
            }
            self.base.consumed(messages.len()).await?;
        }
        Ok(messages)
    }

    /// Tell the workers to exit, wait for them and commit what was consumed.
    pub async fn stop(&mut self) -> Result<()> {
        self.signals.exit.set();
        self.signals.pause.set();
        self.signals.start.set();

        for mut handle in self.workers.drain(..) {
            match tokio::time::timeout(self.config.worker_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Consumer worker failed"),
                Err(_) => {
                    warn!("Consumer worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.base.stop().await
    }
}

impl Drop for MultiProcessConsumer {
    fn drop(&mut self) {
        self.signals.exit.set();
        self.signals.pause.set();
        self.signals.start.set();
    }
}

struct Worker {
    id: usize,
    template: KafkaClient,
    group: Option<String>,
    topic: String,
    config: ConsumerConfig,
    /// Next offset to fetch per partition; survives restarts.
    positions: BTreeMap<i32, i64>,
    queue: mpsc::Sender<ConsumedMessage>,
    signals: Arc<WorkerSignals>,
}

impl Worker {
    /// Run the fetch loop, restarting it with exponential backoff until exit is signalled.
    async fn run(mut self, max_backoff: Duration) {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(max_backoff)
            .with_max_times(usize::MAX)
            .build();

        while !self.signals.exit.is_set() {
            match self.consume().await {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff.next().unwrap_or(max_backoff);
                    error!(
                        worker = self.id,
                        topic = %self.topic,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Problem communicating with Kafka, retrying"
                    );
                    if self.signals.exit.wait_timeout(delay).await {
                        break;
                    }
                }
            }
        }
        debug!(worker = self.id, "Consumer worker exited");
    }

    async fn consume(&mut self) -> Result<()> {
        let mut consumer = SimpleConsumer::new(
            self.template.fork(),
            self.group.as_deref(),
            &self.topic,
            self.config.clone(),
        )
        .await?;
        consumer.reset_offsets(&self.positions).await;
        consumer.provide_partition_info();

        let mut sent = 0usize;
        loop {
            self.signals.start.wait().await;
            if self.signals.exit.is_set() {
                break;
            }

            let message = consumer
                .get_message(true, Some(Duration::from_millis(NO_MESSAGES_WAIT_TIME_MS)))
                .await?;
            let Some(message) = message else {
                tokio::time::sleep(Duration::from_millis(NO_MESSAGES_WAIT_TIME_MS)).await;
                continue;
            };

            let (partition, next) = (message.partition, message.offset + 1);
            if !self.hand_off(message).await {
                break;
            }
            self.positions.insert(partition, next);

            sent += 1;
            if sent >= self.signals.size.load(Ordering::SeqCst) {
                // the coordinator has enough for now
                self.signals.pause.wait().await;
                sent = 0;
            }
        }

        consumer.stop().await
    }

    /// Push onto the shared queue, rechecking `exit` while it is full.
    /// Returns false when the worker should stop.
    async fn hand_off(&self, mut message: ConsumedMessage) -> bool {
        let wait = Duration::from_millis(FULL_QUEUE_WAIT_TIME_MS);
        loop {
            match self.queue.send_timeout(message, wait).await {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.signals.exit.is_set() {
                        return false;
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return false,
            }
        }
    }
}
