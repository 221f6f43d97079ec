//! Consumers.
//!
//! [`Consumer`] is the shared base: it owns the per-partition offsets of one
//! topic for one consumer group, seeds them from the broker, commits them
//! back and runs the auto-commit timer. [`SimpleConsumer`] reads the
//! partitions itself, [`MultiProcessConsumer`] spreads them over worker tasks.
//!
//! # Auto-commit
//!
//! With `auto_commit` on, offsets are committed after `auto_commit_every_n`
//! consumed messages or after `auto_commit_every_t` without a commit,
//! whichever comes first. Either trigger restarts the other. The timer runs
//! as its own task on a forked client and shares only the offset table.

mod multiprocess;
mod simple;

pub use multiprocess::{MultiProcessConsumer, WorkerSignals};
pub use simple::SimpleConsumer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::KafkaClient;
use crate::config::ConsumerConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::{Message, OffsetCommitRequest, OffsetFetchRequest, OffsetRequest};
use crate::types::{PartitionResponse, TopicAndPartition};

/// A message handed to the caller together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub partition: i32,
    pub offset: i64,
    pub message: Message,
}

/// A flag tasks can set, clear and wait on.
#[derive(Debug, Default)]
pub struct Event {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until the flag is set. Returns at once if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent set() cannot be missed
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`Event::wait`] but gives up after `timeout`; returns whether the flag is set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Offsets of the next message to hand out, per partition.
#[derive(Debug, Default)]
pub(crate) struct OffsetState {
    pub(crate) offsets: BTreeMap<i32, i64>,
    pub(crate) count_since_commit: usize,
}

type SharedOffsets = Arc<Mutex<OffsetState>>;

/// Commit the offsets of `partitions` (all when `None`) for `group`.
///
/// Nothing is sent when no message was consumed since the last commit.
async fn commit_offsets(
    client: &mut KafkaClient,
    group: &str,
    topic: &str,
    state: &Mutex<OffsetState>,
    partitions: Option<&[i32]>,
) -> Result<()> {
    let mut state = state.lock().await;
    if state.count_since_commit == 0 {
        return Ok(());
    }

    let requests: Vec<OffsetCommitRequest> = match partitions {
        Some(partitions) => partitions
            .iter()
            .map(|p| {
                state
                    .offsets
                    .get(p)
                    .map(|offset| OffsetCommitRequest::new(topic, *p, *offset, None))
                    .ok_or_else(|| Error::UnknownTopicOrPartition(TopicAndPartition::new(topic, *p)))
            })
            .collect::<Result<_>>()?,
        None => state
            .offsets
            .iter()
            .map(|(p, offset)| OffsetCommitRequest::new(topic, *p, *offset, None))
            .collect(),
    };

    debug!(group, topic, partitions = requests.len(), "Committing offsets");
    client.send_offset_commit_request(group, &requests, true).await?;
    state.count_since_commit = 0;
    Ok(())
}

async fn run_commit_timer(
    mut client: KafkaClient,
    group: String,
    topic: String,
    state: SharedOffsets,
    every: Duration,
    reset: Arc<Notify>,
    exit: Arc<Event>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {
                if let Err(e) = commit_offsets(&mut client, &group, &topic, &state, None).await {
                    warn!(group = %group, topic = %topic, error = %e, "Timed offset commit failed");
                }
            }
            _ = reset.notified() => {}
            _ = exit.wait() => break,
        }
    }
    client.close().await;
}

struct CommitTimer {
    reset: Arc<Notify>,
    exit: Arc<Event>,
    handle: JoinHandle<()>,
}

/// Shared consumer base: offsets, commits and the auto-commit timer.
pub struct Consumer {
    client: KafkaClient,
    group: Option<String>,
    topic: String,
    config: ConsumerConfig,
    partitions: Vec<i32>,
    state: SharedOffsets,
    timer: Option<CommitTimer>,
}

impl Consumer {
    /// Resolve the partitions to consume and seed their offsets.
    ///
    /// With auto-commit the offsets come from the group's committed offsets,
    /// otherwise every partition starts at 0.
    pub async fn new(
        mut client: KafkaClient,
        group: Option<&str>,
        topic: &str,
        config: ConsumerConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        if config.auto_commit && group.is_none() {
            return Err(Error::Config("auto_commit requires a consumer group".into()));
        }

        client.load_metadata_for_topics(&[topic]).await?;
        let partitions = match &config.partitions {
            Some(partitions) => partitions.clone(),
            None => client.get_partition_ids_for_topic(topic),
        };
        if partitions.is_empty() {
            return Err(Error::UnknownTopicOrPartition(TopicAndPartition::new(topic, -1)));
        }

        let mut consumer = Self {
            client,
            group: group.map(str::to_string),
            topic: topic.to_string(),
            config,
            partitions,
            state: Arc::new(Mutex::new(OffsetState::default())),
            timer: None,
        };

        if consumer.config.auto_commit {
            consumer.fetch_last_known_offsets(None).await?;
        } else {
            let mut state = consumer.state.lock().await;
            state.offsets = consumer.partitions.iter().map(|p| (*p, 0)).collect();
        }

        consumer.start_commit_timer();
        info!(
            topic = %consumer.topic,
            group = ?consumer.group,
            partitions = ?consumer.partitions,
            "Consumer started"
        );
        Ok(consumer)
    }

    fn start_commit_timer(&mut self) {
        if !self.config.auto_commit {
            return;
        }
        let (Some(every), Some(group)) = (self.config.auto_commit_every_t, self.group.clone()) else {
            return;
        };

        let reset = Arc::new(Notify::new());
        let exit = Arc::new(Event::new());
        let handle = tokio::spawn(run_commit_timer(
            self.client.fork(),
            group,
            self.topic.clone(),
            Arc::clone(&self.state),
            every,
            Arc::clone(&reset),
            Arc::clone(&exit),
        ));
        self.timer = Some(CommitTimer { reset, exit, handle });
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Partitions owned by this consumer, in the order they were configured.
    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    pub fn client(&self) -> &KafkaClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut KafkaClient {
        &mut self.client
    }

    /// Snapshot of the offset of the next message per partition.
    pub async fn offsets(&self) -> BTreeMap<i32, i64> {
        self.state.lock().await.offsets.clone()
    }

    pub(crate) fn shared_offsets(&self) -> &SharedOffsets {
        &self.state
    }

    /// Seed offsets from the group's committed offsets.
    ///
    /// A partition the broker knows no offset for starts at 0.
    pub async fn fetch_last_known_offsets(&mut self, partitions: Option<&[i32]>) -> Result<()> {
        let Some(group) = self.group.clone() else {
            return Err(Error::InvalidArgument("offsets can only be fetched for a consumer group".into()));
        };
        let partitions = partitions.map(<[i32]>::to_vec).unwrap_or_else(|| self.partitions.clone());

        let requests: Vec<OffsetFetchRequest> = partitions
            .iter()
            .map(|p| OffsetFetchRequest::new(self.topic.as_str(), *p))
            .collect();
        let responses = self
            .client
            .send_offset_fetch_request(&group, &requests, false)
            .await?;

        let mut state = self.state.lock().await;
        for response in responses {
            let offset = match response.error {
                KafkaCode::UnknownTopicOrPartition => 0,
                _ => {
                    response.check_error()?;
                    response.offset.max(0)
                }
            };
            debug!(topic = %self.topic, partition = response.partition, offset, "Seeded offset");
            state.offsets.insert(response.partition, offset);
        }
        Ok(())
    }

    /// Commit the current offsets of `partitions` (all when `None`).
    pub async fn commit(&mut self, partitions: Option<&[i32]>) -> Result<()> {
        let Some(group) = self.group.clone() else {
            return Err(Error::InvalidArgument("offsets can only be committed for a consumer group".into()));
        };
        commit_offsets(&mut self.client, &group, &self.topic, &self.state, partitions).await
    }

    /// Record that `count` more messages were handed out and commit if the count trigger fired.
    pub(crate) async fn consumed(&mut self, count: usize) -> Result<()> {
        let due = {
            let mut state = self.state.lock().await;
            state.count_since_commit += count;
            match self.config.auto_commit_every_n {
                Some(n) if self.config.auto_commit => state.count_since_commit >= n,
                _ => false,
            }
        };

        if due {
            self.commit(None).await?;
            if let Some(timer) = &self.timer {
                timer.reset.notify_one();
            }
        }
        Ok(())
    }

    /// Messages between the current offsets and the latest offsets of `partitions`.
    pub async fn pending(&mut self, partitions: Option<&[i32]>) -> Result<i64> {
        let partitions = partitions.map(<[i32]>::to_vec).unwrap_or_else(|| self.partitions.clone());
        let requests: Vec<OffsetRequest> = partitions
            .iter()
            .map(|p| OffsetRequest::latest(self.topic.as_str(), *p))
            .collect();
        let responses = self.client.send_offset_request(&requests, true).await?;

        let state = self.state.lock().await;
        let mut total = 0;
        for response in responses {
            let latest = response.offsets.first().copied().unwrap_or_default();
            let current = state.offsets.get(&response.partition).copied().unwrap_or_default();
            total += latest - current;
        }
        Ok(total)
    }

    /// Stop the commit timer and, with auto-commit on, commit what was consumed.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut timer) = self.timer.take() {
            timer.exit.set();
            if tokio::time::timeout(Duration::from_secs(1), &mut timer.handle)
                .await
                .is_err()
            {
                warn!(topic = %self.topic, "Commit timer did not stop in time, aborting");
                timer.handle.abort();
            }
        }

        if self.config.auto_commit && self.group.is_some() {
            self.commit(None).await?;
        }
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.exit.set();
        }
    }
}
