//! Broker-aware Kafka client.
//!
//! [`KafkaClient`] caches the cluster topology, routes every per-partition
//! request to the partition's current leader and puts the answers back in the
//! order the caller asked for them.
//!
//! # Routing
//!
//! 1. Each payload's leader is looked up in the cache, loading metadata for the
//!    topic on a miss. A partition without a leader gets one forced reload
//!    before the call fails with [`Error::LeaderNotAvailable`].
//! 2. Payloads are grouped by leader and each broker receives one combined
//!    request, one broker after the other.
//! 3. A broker that cannot be reached fails its share of the batch. Every
//!    other broker is still tried, the whole topology cache is dropped, and
//!    the call ends with [`Error::FailedPayloads`] carrying both the
//!    partitions that got no answer and the answers that did arrive.
//! 4. A response carrying "not leader" or "unknown topic" drops that topic
//!    from the cache so the next call re-resolves it.
//!
//! Metadata itself is not routed: it is asked of each seed broker in turn
//! until one answers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::config::{ClientConfig, collect_hosts};
use crate::connection::BrokerConnection;
use crate::constants::{ACK_NOT_REQUIRED, ENSURE_TOPIC_POLL_MS};
use crate::error::{Error, FailedPayloads, KafkaCode, PartialResponses, Result};
use crate::protocol::{
    FetchRequest, FetchResponse, MetadataResponse, OffsetCommitRequest, OffsetCommitResponse,
    OffsetFetchRequest, OffsetFetchResponse, OffsetRequest, OffsetResponse, ProduceRequest,
    ProduceResponse, decode_fetch_response, decode_metadata_response,
    decode_offset_commit_response, decode_offset_fetch_response, decode_offset_response,
    decode_produce_response, encode_fetch_request, encode_metadata_request,
    encode_offset_commit_request, encode_offset_fetch_request, encode_offset_request,
    encode_produce_request, response_correlation_id,
};
use crate::types::{BrokerMetadata, PartitionMetadata, PartitionResponse, Payload, TopicAndPartition};

/// Per-partition responses that can be handed back inside [`Error::FailedPayloads`].
pub(crate) trait BrokerResponse: PartitionResponse + Sized {
    fn into_partial(responses: Vec<Self>) -> PartialResponses;
}

impl BrokerResponse for ProduceResponse {
    fn into_partial(responses: Vec<Self>) -> PartialResponses {
        PartialResponses::Produce(responses)
    }
}

impl BrokerResponse for FetchResponse {
    fn into_partial(responses: Vec<Self>) -> PartialResponses {
        PartialResponses::Fetch(responses)
    }
}

impl BrokerResponse for OffsetResponse {
    fn into_partial(responses: Vec<Self>) -> PartialResponses {
        PartialResponses::Offset(responses)
    }
}

impl BrokerResponse for OffsetCommitResponse {
    fn into_partial(responses: Vec<Self>) -> PartialResponses {
        PartialResponses::OffsetCommit(responses)
    }
}

impl BrokerResponse for OffsetFetchResponse {
    fn into_partial(responses: Vec<Self>) -> PartialResponses {
        PartialResponses::OffsetFetch(responses)
    }
}

#[derive(Debug)]
pub struct KafkaClient {
    config: ClientConfig,
    hosts: Vec<(String, u16)>,
    correlation_id: AtomicI32,
    conns: HashMap<(String, u16), BrokerConnection>,
    brokers: HashMap<i32, BrokerMetadata>,
    topics_to_brokers: HashMap<TopicAndPartition, Option<BrokerMetadata>>,
    topic_partitions: HashMap<String, BTreeMap<i32, PartitionMetadata>>,
}

impl KafkaClient {
    /// Build a client without touching the network.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let hosts = collect_hosts(&config.hosts, config.randomize_hosts)?;
        if hosts.is_empty() {
            return Err(Error::Config("no bootstrap hosts configured".into()));
        }

        Ok(Self {
            config,
            hosts,
            correlation_id: AtomicI32::new(0),
            conns: HashMap::new(),
            brokers: HashMap::new(),
            topics_to_brokers: HashMap::new(),
            topic_partitions: HashMap::new(),
        })
    }

    /// Build a client and load metadata for every topic of the cluster.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let mut client = Self::new(config)?;
        client.load_all_metadata().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Seed brokers in the order metadata requests try them.
    pub fn hosts(&self) -> &[(String, u16)] {
        &self.hosts
    }

    /// Next correlation id, wrapping from `i32::MAX` back to 0.
    pub fn next_id(&self) -> i32 {
        let previous = self
            .correlation_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(wrap_id(id)))
            .unwrap_or_else(|id| id);
        wrap_id(previous)
    }

    /// Copy configuration, topology cache and correlation counter into an
    /// independent client. Connections are copied unopened and reconnect on
    /// first use, so the two clients never share a socket.
    pub fn fork(&self) -> Self {
        Self {
            config: self.config.clone(),
            hosts: self.hosts.clone(),
            correlation_id: AtomicI32::new(self.correlation_id.load(Ordering::Relaxed)),
            conns: self
                .conns
                .iter()
                .map(|(addr, conn)| (addr.clone(), conn.copy()))
                .collect(),
            brokers: self.brokers.clone(),
            topics_to_brokers: self.topics_to_brokers.clone(),
            topic_partitions: self.topic_partitions.clone(),
        }
    }

    /// Close every connection and drop the topology cache.
    pub async fn close(&mut self) {
        for conn in self.conns.values_mut() {
            conn.close().await;
        }
        self.reset_all_metadata();
        self.brokers.clear();
    }

    /// Reopen every known connection.
    pub async fn reinit(&mut self) {
        for conn in self.conns.values_mut() {
            if let Err(e) = conn.reinit().await {
                warn!(host = %conn.host(), port = conn.port(), error = %e, "Reinit failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Topology cache
    // -------------------------------------------------------------------------

    pub fn brokers(&self) -> Vec<BrokerMetadata> {
        let mut brokers: Vec<_> = self.brokers.values().cloned().collect();
        brokers.sort_by_key(|b| b.node_id);
        brokers
    }

    pub fn topic_partitions(&self) -> &HashMap<String, BTreeMap<i32, PartitionMetadata>> {
        &self.topic_partitions
    }

    pub fn has_metadata_for_topic(&self, topic: &str) -> bool {
        self.topic_partitions
            .get(topic)
            .is_some_and(|partitions| !partitions.is_empty())
    }

    /// Cached partition ids of `topic` in ascending order; empty when unknown.
    pub fn get_partition_ids_for_topic(&self, topic: &str) -> Vec<i32> {
        self.topic_partitions
            .get(topic)
            .map(|partitions| partitions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Leader currently cached for a partition, without any network access.
    pub fn cached_leader(&self, topic: &str, partition: i32) -> Option<&BrokerMetadata> {
        self.topics_to_brokers
            .get(&TopicAndPartition::new(topic, partition))
            .and_then(|leader| leader.as_ref())
    }

    /// Drop the cached partitions and leaders of the given topics.
    pub fn reset_topic_metadata<S: AsRef<str>>(&mut self, topics: &[S]) {
        for topic in topics {
            let topic = topic.as_ref();
            self.topics_to_brokers.retain(|tp, _| tp.topic != topic);
            self.topic_partitions.remove(topic);
        }
    }

    pub fn reset_all_metadata(&mut self) {
        self.topics_to_brokers.clear();
        self.topic_partitions.clear();
    }

    /// Reload metadata for every topic in the cluster.
    pub async fn load_all_metadata(&mut self) -> Result<()> {
        self.load_metadata_for_topics::<&str>(&[]).await
    }

    /// Reload metadata for `topics`, or for the whole cluster when empty.
    ///
    /// An unknown or leaderless topic that was named explicitly fails the
    /// call; the same condition on a topic that was not asked for is logged
    /// and skipped.
    pub async fn load_metadata_for_topics<S: AsRef<str>>(&mut self, topics: &[S]) -> Result<()> {
        let topics: Vec<String> = topics.iter().map(|t| t.as_ref().to_string()).collect();

        if topics.is_empty() {
            self.reset_all_metadata();
        } else {
            self.reset_topic_metadata(&topics);
        }

        let response = self.send_metadata_request(&topics).await?;

        self.brokers = response
            .brokers
            .into_iter()
            .map(|broker| (broker.node_id, broker))
            .collect();

        for topic in response.topics {
            match topic.error {
                KafkaCode::None => {}
                code @ (KafkaCode::UnknownTopicOrPartition | KafkaCode::LeaderNotAvailable) => {
                    if topics.contains(&topic.topic) {
                        return Err(Error::from_code(code, topic.topic, -1));
                    }
                    error!(topic = %topic.topic, error = ?code, "Error loading topic metadata");
                    continue;
                }
                code => return Err(Error::from_code(code, topic.topic, -1)),
            }

            // committed only once every partition of the topic is known good
            let mut partitions = BTreeMap::new();
            let mut leaders = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions {
                let key = TopicAndPartition::new(topic.topic.clone(), partition.partition);

                let leader = match partition.error {
                    KafkaCode::None | KafkaCode::ReplicaNotAvailable => {
                        if partition.has_leader() {
                            self.brokers.get(&partition.leader).cloned()
                        } else {
                            None
                        }
                    }
                    KafkaCode::LeaderNotAvailable => None,
                    code => return Err(Error::from_code(code, topic.topic, partition.partition)),
                };

                if leader.is_none() {
                    warn!(
                        topic = %key.topic,
                        partition = key.partition,
                        leader = partition.leader,
                        "No leader available for partition"
                    );
                }

                leaders.push((key, leader));
                partitions.insert(partition.partition, partition);
            }
            self.topics_to_brokers.extend(leaders);
            self.topic_partitions.insert(topic.topic, partitions);
        }

        debug!(
            brokers = self.brokers.len(),
            topics = self.topic_partitions.len(),
            "Loaded cluster metadata"
        );
        Ok(())
    }

    /// Poll metadata every 500ms until `topic` shows up or `timeout` passes.
    ///
    /// Brokers that create topics on first use answer "leader not available"
    /// while the topic is being created; that answer is retried.
    pub async fn ensure_topic_exists(&mut self, topic: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        while !self.has_metadata_for_topic(topic) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            match self.load_metadata_for_topics(&[topic]).await {
                Ok(()) => {}
                Err(e) if e.kafka_code() == Some(KafkaCode::LeaderNotAvailable) => {}
                Err(e) => return Err(e),
            }

            if !self.has_metadata_for_topic(topic) {
                tokio::time::sleep(Duration::from_millis(ENSURE_TOPIC_POLL_MS)).await;
            }
        }
        Ok(())
    }

    async fn get_leader_for_partition(&mut self, topic: &str, partition: i32) -> Result<BrokerMetadata> {
        let key = TopicAndPartition::new(topic, partition);

        let mut reloaded = false;
        if !self.topics_to_brokers.contains_key(&key) {
            self.load_metadata_for_topics(&[topic]).await?;
            reloaded = true;
        }

        match self.topics_to_brokers.get(&key) {
            None => Err(Error::UnknownTopicOrPartition(key)),
            Some(Some(leader)) => Ok(leader.clone()),
            Some(None) if reloaded => Err(Error::LeaderNotAvailable(key)),
            Some(None) => {
                self.load_metadata_for_topics(&[topic]).await?;
                match self.topics_to_brokers.get(&key) {
                    None => Err(Error::UnknownTopicOrPartition(key)),
                    Some(None) => Err(Error::LeaderNotAvailable(key)),
                    Some(Some(leader)) => Ok(leader.clone()),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    fn get_conn(&mut self, host: &str, port: u16) -> &mut BrokerConnection {
        let timeout = self.config.timeout;
        self.conns
            .entry((host.to_string(), port))
            .or_insert_with(|| BrokerConnection::new(host, port, timeout))
    }

    async fn round_trip(
        &mut self,
        host: &str,
        port: u16,
        correlation_id: i32,
        request: &Bytes,
        expect_response: bool,
    ) -> Result<Option<Bytes>> {
        let conn = self.get_conn(host, port);
        conn.send(correlation_id, request).await?;

        if !expect_response {
            return Ok(None);
        }

        let body = conn.recv(correlation_id).await?;
        let actual = response_correlation_id(&body)?;
        if actual != correlation_id {
            conn.mark_dirty();
            return Err(Error::CorrelationMismatch {
                expected: correlation_id,
                actual,
            });
        }
        Ok(Some(body))
    }

    /// Send to the seed brokers one by one until one answers.
    async fn send_broker_unaware_request<E>(&mut self, what: &str, encode: E) -> Result<Bytes>
    where
        E: Fn(&str, i32) -> Result<Bytes>,
    {
        let client_id = self.config.client_id.clone();

        for (host, port) in self.hosts.clone() {
            let correlation_id = self.next_id();
            let request = encode(&client_id, correlation_id)?;

            match self.round_trip(&host, port, correlation_id, &request, true).await {
                Ok(Some(body)) => return Ok(body),
                Ok(None) => {}
                Err(e) => {
                    warn!(host = %host, port, request = what, error = %e, "Could not send request to server");
                }
            }
        }

        Err(Error::KafkaUnavailable(format!(
            "{} request failed on all {} bootstrap host(s)",
            what,
            self.hosts.len()
        )))
    }

    async fn send_broker_aware_request<Req, Resp, E, D>(
        &mut self,
        payloads: &[Req],
        expect_response: bool,
        encode: E,
        decode: D,
    ) -> Result<Vec<Resp>>
    where
        Req: Payload + Clone,
        Resp: BrokerResponse,
        E: Fn(&str, i32, &[Req]) -> Result<Bytes>,
        D: Fn(Bytes) -> Result<Vec<Resp>>,
    {
        let mut leaders = Vec::with_capacity(payloads.len());
        let mut by_broker: Vec<(BrokerMetadata, Vec<Req>)> = Vec::new();

        for payload in payloads {
            let leader = self
                .get_leader_for_partition(payload.topic(), payload.partition())
                .await?;
            leaders.push(leader.node_id);

            match by_broker.iter_mut().find(|(b, _)| b.node_id == leader.node_id) {
                Some((_, group)) => group.push(payload.clone()),
                None => by_broker.push((leader, vec![payload.clone()])),
            }
        }

        let client_id = self.config.client_id.clone();
        let mut failed_brokers = HashSet::new();
        let mut transport_failed = false;
        let mut first_error: Option<Error> = None;
        let mut acc: HashMap<TopicAndPartition, Resp> = HashMap::new();

        for (broker, group) in &by_broker {
            let correlation_id = self.next_id();
            let request = encode(&client_id, correlation_id, group)?;

            debug!(
                node_id = broker.node_id,
                host = %broker.host,
                port = broker.port,
                correlation_id,
                partitions = group.len(),
                "Sending request to broker"
            );

            let result = match u16::try_from(broker.port) {
                Ok(port) => {
                    self.round_trip(&broker.host, port, correlation_id, &request, expect_response)
                        .await
                }
                Err(_) => Err(Error::Connection {
                    host: broker.host.clone(),
                    port: 0,
                    reason: format!("invalid port {}", broker.port),
                }),
            };

            match result.and_then(|body| body.map(&decode).transpose()) {
                Ok(Some(responses)) => {
                    for response in responses {
                        acc.insert(response.topic_and_partition(), response);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        node_id = broker.node_id,
                        host = %broker.host,
                        port = broker.port,
                        error = %e,
                        "Broker failed, its payloads will be reported as failed"
                    );
                    failed_brokers.insert(broker.node_id);
                    if e.is_transport() {
                        transport_failed = true;
                    } else if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let responses: Vec<Resp> = payloads
            .iter()
            .filter_map(|p| acc.remove(&p.topic_and_partition()))
            .collect();

        if failed_brokers.is_empty() {
            return Ok(responses);
        }

        // a failed broker may mean leadership moved anywhere
        self.reset_all_metadata();

        // without any transport failure the decoding error is the answer
        match first_error {
            Some(e) if !transport_failed => return Err(e),
            _ => {}
        }

        let failed = payloads
            .iter()
            .zip(&leaders)
            .filter(|(_, leader)| failed_brokers.contains(*leader))
            .map(|(p, _)| p.topic_and_partition())
            .collect();

        Err(Error::FailedPayloads(Box::new(FailedPayloads {
            failed,
            responses: Resp::into_partial(responses),
        })))
    }

    /// Drop stale topics named by error responses, then surface the first error if asked to.
    fn handle_response_errors<R: PartitionResponse>(
        &mut self,
        responses: &[R],
        fail_on_error: bool,
    ) -> Result<()> {
        let stale: Vec<&str> = responses
            .iter()
            .filter(|r| r.error().invalidates_metadata())
            .map(|r| r.topic())
            .collect();

        if !stale.is_empty() {
            debug!(topics = ?stale, "Resetting metadata after broker error");
            self.reset_topic_metadata(&stale);
        }

        if fail_on_error {
            for response in responses {
                response.check_error()?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Ask the seed brokers for cluster metadata, without touching the cache.
    pub async fn send_metadata_request(&mut self, topics: &[String]) -> Result<MetadataResponse> {
        let body = self
            .send_broker_unaware_request("metadata", |client_id, correlation_id| {
                encode_metadata_request(client_id, correlation_id, topics)
            })
            .await?;
        decode_metadata_response(body)
    }

    /// Produce to each partition's leader.
    ///
    /// With `acks == 0` no broker answers and the returned list is empty.
    pub async fn send_produce_request(
        &mut self,
        payloads: &[ProduceRequest],
        acks: i16,
        timeout_ms: i32,
        fail_on_error: bool,
    ) -> Result<Vec<ProduceResponse>> {
        let responses = self
            .send_broker_aware_request(
                payloads,
                acks != ACK_NOT_REQUIRED,
                |client_id, correlation_id, group| {
                    encode_produce_request(client_id, correlation_id, group, acks, timeout_ms)
                },
                decode_produce_response,
            )
            .await?;
        self.handle_response_errors(&responses, fail_on_error)?;
        Ok(responses)
    }

    pub async fn send_fetch_request(
        &mut self,
        payloads: &[FetchRequest],
        max_wait_time_ms: i32,
        min_bytes: i32,
        fail_on_error: bool,
    ) -> Result<Vec<FetchResponse>> {
        let responses = self
            .send_broker_aware_request(
                payloads,
                true,
                |client_id, correlation_id, group| {
                    encode_fetch_request(client_id, correlation_id, group, max_wait_time_ms, min_bytes)
                },
                decode_fetch_response,
            )
            .await?;
        self.handle_response_errors(&responses, fail_on_error)?;
        Ok(responses)
    }

    pub async fn send_offset_request(
        &mut self,
        payloads: &[OffsetRequest],
        fail_on_error: bool,
    ) -> Result<Vec<OffsetResponse>> {
        let responses = self
            .send_broker_aware_request(payloads, true, encode_offset_request, decode_offset_response)
            .await?;
        self.handle_response_errors(&responses, fail_on_error)?;
        Ok(responses)
    }

    pub async fn send_offset_commit_request(
        &mut self,
        group: &str,
        payloads: &[OffsetCommitRequest],
        fail_on_error: bool,
    ) -> Result<Vec<OffsetCommitResponse>> {
        let responses = self
            .send_broker_aware_request(
                payloads,
                true,
                |client_id, correlation_id, batch| {
                    encode_offset_commit_request(client_id, correlation_id, group, batch)
                },
                decode_offset_commit_response,
            )
            .await?;
        self.handle_response_errors(&responses, fail_on_error)?;
        Ok(responses)
    }

    pub async fn send_offset_fetch_request(
        &mut self,
        group: &str,
        payloads: &[OffsetFetchRequest],
        fail_on_error: bool,
    ) -> Result<Vec<OffsetFetchResponse>> {
        let responses = self
            .send_broker_aware_request(
                payloads,
                true,
                |client_id, correlation_id, batch| {
                    encode_offset_fetch_request(client_id, correlation_id, group, batch)
                },
                decode_offset_fetch_response,
            )
            .await?;
        self.handle_response_errors(&responses, fail_on_error)?;
        Ok(responses)
    }
}

fn wrap_id(id: i32) -> i32 {
    if id == i32::MAX { 0 } else { id + 1 }
}
