//! Producers.
//!
//! [`Producer`] is the shared base: it turns payloads into a produce request
//! for one partition and either sends it right away or hands it to a
//! background worker. [`SimpleProducer`] picks partitions round-robin,
//! [`KeyedProducer`] asks a [`Partitioner`](crate::partitioner::Partitioner).
//!
//! # Async mode
//!
//! With [`ProducerConfig::async_send`] or [`ProducerConfig::batch_send`] set,
//! every payload is queued as a [`ProducerCommand::Publish`] and the call
//! returns at once. A background task owning a forked client drains the queue
//! and flushes whenever `batch_send_every_n` messages are pending or
//! `batch_send_every_t` has elapsed. [`Producer::stop`] queues
//! [`ProducerCommand::FlushAndStop`], waits for the worker for the configured
//! grace period and aborts it if it is still running.

mod keyed;
mod simple;

pub use keyed::KeyedProducer;
pub use simple::SimpleProducer;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::KafkaClient;
use crate::config::ProducerConfig;
use crate::error::{Error, Result};
use crate::protocol::message::create_message_set;
use crate::protocol::{ProduceRequest, ProduceResponse};
use crate::types::TopicAndPartition;

/// Item of the queue between async producers and their background worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerCommand {
    Publish {
        tp: TopicAndPartition,
        value: Bytes,
        key: Option<Bytes>,
    },
    /// Send whatever is pending, then exit.
    FlushAndStop,
}

/// Payloads collected by the worker between two flushes, grouped by partition
/// in the order partitions were first seen.
#[derive(Debug, Default)]
struct Batch {
    order: Vec<TopicAndPartition>,
    payloads: HashMap<TopicAndPartition, Vec<(Bytes, Option<Bytes>)>>,
    count: usize,
}

impl Batch {
    fn push(&mut self, tp: TopicAndPartition, value: Bytes, key: Option<Bytes>) {
        self.payloads
            .entry(tp.clone())
            .or_insert_with(|| {
                self.order.push(tp);
                Vec::new()
            })
            .push((value, key));
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One request per partition; a partition whose messages cannot be built is dropped.
    fn into_requests(mut self, config: &ProducerConfig) -> Vec<ProduceRequest> {
        let mut requests = Vec::with_capacity(self.order.len());
        for tp in self.order {
            let Some(payloads) = self.payloads.remove(&tp) else {
                continue;
            };
            match create_message_set(&payloads, config.codec, None, config.snappy_xerial) {
                Ok(messages) => requests.push(ProduceRequest::new(tp.topic, tp.partition, messages)),
                Err(e) => {
                    error!(topic = %tp.topic, partition = tp.partition, error = %e, "Unable to build message set");
                }
            }
        }
        requests
    }
}

/// Body of the background worker.
async fn send_upstream(
    mut client: KafkaClient,
    mut queue: mpsc::UnboundedReceiver<ProducerCommand>,
    config: ProducerConfig,
) {
    let (batch_n, batch_t) = config.batch_triggers();
    let mut stop = false;

    debug!(batch_n, batch_t_ms = batch_t.as_millis() as u64, "Producer worker started");

    while !stop {
        let deadline = Instant::now() + batch_t;
        let mut batch = Batch::default();

        while batch.len() < batch_n {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Err(_) => break,
                Ok(None) | Ok(Some(ProducerCommand::FlushAndStop)) => {
                    stop = true;
                    break;
                }
                Ok(Some(ProducerCommand::Publish { tp, value, key })) => batch.push(tp, value, key),
            }
        }

        if batch.is_empty() {
            continue;
        }

        let count = batch.len();
        let requests = batch.into_requests(&config);
        match client
            .send_produce_request(&requests, config.req_acks, config.ack_timeout_ms, true)
            .await
        {
            Ok(_) => debug!(messages = count, partitions = requests.len(), "Flushed batch"),
            Err(e) => error!(messages = count, error = %e, "Unable to send messages, dropping batch"),
        }
    }

    client.close().await;
    debug!("Producer worker stopped");
}

struct Worker {
    queue: mpsc::UnboundedSender<ProducerCommand>,
    handle: JoinHandle<()>,
}

/// Shared producer base.
pub struct Producer {
    client: KafkaClient,
    config: ProducerConfig,
    worker: Option<Worker>,
    stopped: bool,
}

impl Producer {
    /// Validate `config` and, in async mode, spawn the background worker on a forked client.
    ///
    /// Must be called inside a tokio runtime when async mode is on.
    pub fn new(client: KafkaClient, config: ProducerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;

        let worker = if config.is_async() {
            let (queue, receiver) = mpsc::unbounded_channel();
            let handle = tokio::spawn(send_upstream(client.fork(), receiver, config.clone()));
            info!(batch = config.batch_send, "Started async producer worker");
            Some(Worker { queue, handle })
        } else {
            None
        };

        Ok(Self {
            client,
            config,
            worker,
            stopped: false,
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn client(&self) -> &KafkaClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut KafkaClient {
        &mut self.client
    }

    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Send `payloads` to one partition, each with the same optional key.
    ///
    /// In async mode the payloads are only queued and the result is empty.
    pub async fn send_messages(
        &mut self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        payloads: &[Bytes],
    ) -> Result<Vec<ProduceResponse>> {
        if self.stopped {
            return Err(Error::ProducerStopped);
        }
        if payloads.is_empty() {
            return Err(Error::InvalidArgument("no messages to send".into()));
        }

        if let Some(worker) = &self.worker {
            let tp = TopicAndPartition::new(topic, partition);
            for value in payloads {
                worker
                    .queue
                    .send(ProducerCommand::Publish {
                        tp: tp.clone(),
                        value: value.clone(),
                        key: key.clone(),
                    })
                    .map_err(|_| Error::ProducerStopped)?;
            }
            return Ok(Vec::new());
        }

        let payloads: Vec<(Bytes, Option<Bytes>)> =
            payloads.iter().map(|v| (v.clone(), key.clone())).collect();
        let messages = create_message_set(&payloads, self.config.codec, key, self.config.snappy_xerial)?;
        let request = ProduceRequest::new(topic, partition, messages);

        self.client
            .send_produce_request(
                &[request],
                self.config.req_acks,
                self.config.ack_timeout_ms,
                self.config.sync_fail_on_error,
            )
            .await
    }

    /// Stop with the configured grace period.
    pub async fn stop(&mut self) {
        self.stop_with_timeout(self.config.stop_timeout).await
    }

    /// Flush and stop the background worker, aborting it after `timeout`.
    ///
    /// Calling it again is a no-op.
    pub async fn stop_with_timeout(&mut self, timeout: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let Some(mut worker) = self.worker.take() else {
            return;
        };

        if worker.queue.send(ProducerCommand::FlushAndStop).is_err() {
            debug!("Producer worker already gone");
        }

        match tokio::time::timeout(timeout, &mut worker.handle).await {
            Ok(Ok(())) => debug!("Producer worker joined"),
            Ok(Err(e)) => warn!(error = %e, "Producer worker failed"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Producer worker did not stop in time, aborting");
                worker.handle.abort();
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        // The worker flushes on its own; it is not awaited here.
        if let Some(worker) = self.worker.take() {
            let _ = worker.queue.send(ProducerCommand::FlushAndStop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{decode_message_set, encode_message_set};

    #[test]
    fn test_batch_groups_by_partition_in_arrival_order() {
        let mut batch = Batch::default();
        batch.push(TopicAndPartition::new("t", 1), Bytes::from_static(b"a"), None);
        batch.push(TopicAndPartition::new("u", 0), Bytes::from_static(b"b"), None);
        batch.push(TopicAndPartition::new("t", 1), Bytes::from_static(b"c"), None);
        assert_eq!(batch.len(), 3);

        let requests = batch.into_requests(&ProducerConfig::default());
        assert_eq!(requests.len(), 2);
        assert_eq!((requests[0].topic.as_str(), requests[0].partition), ("t", 1));
        assert_eq!((requests[1].topic.as_str(), requests[1].partition), ("u", 0));

        let values: Vec<_> = requests[0]
            .messages
            .iter()
            .map(|m| m.value.clone().unwrap())
            .collect();
        assert_eq!(values, vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_batch_compresses_each_partition() {
        let mut batch = Batch::default();
        batch.push(TopicAndPartition::new("t", 0), Bytes::from_static(b"a"), None);
        batch.push(TopicAndPartition::new("t", 0), Bytes::from_static(b"b"), None);

        let config = ProducerConfig {
            codec: crate::types::CodecKind::Gzip,
            ..ProducerConfig::default()
        };
        let requests = batch.into_requests(&config);
        assert_eq!(requests[0].messages.len(), 1);

        let set = encode_message_set(&requests[0].messages).unwrap();
        let decoded = decode_message_set(set).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_producer_rejects_sends() {
        let client = KafkaClient::new(crate::config::ClientConfig::with_hosts("127.0.0.1:1")).unwrap();
        let config = ProducerConfig {
            async_send: true,
            ..ProducerConfig::default()
        };
        let mut producer = Producer::new(client, config).unwrap();
        assert!(producer.is_async());

        producer.stop().await;
        producer.stop().await;
        assert!(producer.is_stopped());
        assert!(matches!(
            producer
                .send_messages("t", 0, None, &[Bytes::from_static(b"x")])
                .await,
            Err(Error::ProducerStopped)
        ));
    }

    #[tokio::test]
    async fn test_empty_send_is_invalid() {
        let client = KafkaClient::new(crate::config::ClientConfig::with_hosts("127.0.0.1:1")).unwrap();
        let mut producer = Producer::new(client, ProducerConfig::default()).unwrap();
        assert!(matches!(
            producer.send_messages("t", 0, None, &[]).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let client = KafkaClient::new(crate::config::ClientConfig::with_hosts("127.0.0.1:1")).unwrap();
        let config = ProducerConfig {
            req_acks: 7,
            ..ProducerConfig::default()
        };
        assert!(matches!(Producer::new(client, config), Err(Error::Config(_))));
    }
}
