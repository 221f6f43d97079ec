//! In-process mock broker cluster for integration tests.
//!
//! Every broker is a `TcpListener` on 127.0.0.1 speaking the v0 wire protocol
//! through the crate's own broker-side codec (`parse_request` and the
//! `encode_*_response` functions). All brokers share one [`ClusterState`]:
//! leadership per partition, an in-memory log per partition, committed
//! offsets, request counters and one-shot error injection.
//!
//! **Note:** these tests need TCP access to 127.0.0.1.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use kafkaesque_client::config::ClientConfig;
use kafkaesque_client::error::KafkaCode;
use kafkaesque_client::protocol::message::{decode_message_set, encode_message_set_with_offsets};
use kafkaesque_client::protocol::{
    ApiKey, FetchResponse, Message, MetadataResponse, OffsetCommitResponse, OffsetFetchResponse,
    OffsetResponse, ProduceResponse, Request, encode_fetch_response, encode_metadata_response,
    encode_offset_commit_response, encode_offset_fetch_response, encode_offset_response,
    encode_produce_response, parse_request,
};
use kafkaesque_client::types::{BrokerMetadata, PartitionMetadata, TopicAndPartition, TopicMetadata};

/// Everything the mock brokers know, shared by all of them.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub brokers: Vec<BrokerMetadata>,
    /// topic -> partition -> leader node id (`-1` for none)
    pub topics: BTreeMap<String, BTreeMap<i32, i32>>,
    pub logs: HashMap<TopicAndPartition, Vec<Message>>,
    pub commits: HashMap<(String, TopicAndPartition), i64>,
    /// (node id, api key) -> requests received
    pub requests: HashMap<(i32, ApiKey), usize>,
    /// Error codes answered once, in order, for a partition.
    pub errors: HashMap<TopicAndPartition, VecDeque<KafkaCode>>,
    /// Nodes answering with a wrong correlation id.
    pub mismatch_nodes: HashSet<i32>,
    /// Nodes answering with a body that cannot be decoded.
    pub garbled_nodes: HashSet<i32>,
    /// Error codes reported for a partition in metadata responses.
    pub metadata_errors: HashMap<TopicAndPartition, KafkaCode>,
    /// Upper bound on the message set bytes of a fetch response, whatever the request asked for.
    pub fetch_byte_cap: Option<usize>,
    /// Unknown topics asked for by name are created with one partition on node 0.
    pub auto_create: bool,
}

struct MockBroker {
    node_id: i32,
    port: u16,
    accept: JoinHandle<()>,
    connections: Arc<Mutex<JoinSet<()>>>,
}

pub struct MockCluster {
    pub state: Arc<Mutex<ClusterState>>,
    brokers: Vec<MockBroker>,
}

impl MockCluster {
    /// Start `count` brokers with node ids `0..count`.
    pub async fn start(count: usize) -> Self {
        let state = Arc::new(Mutex::new(ClusterState::default()));
        let mut brokers = Vec::with_capacity(count);

        for node_id in 0..count as i32 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            state
                .lock()
                .unwrap()
                .brokers
                .push(BrokerMetadata::new(node_id, "127.0.0.1", port as i32));

            let connections = Arc::new(Mutex::new(JoinSet::new()));
            let accept = tokio::spawn(accept_loop(
                listener,
                node_id,
                Arc::clone(&state),
                Arc::clone(&connections),
            ));
            brokers.push(MockBroker {
                node_id,
                port,
                accept,
                connections,
            });
        }

        Self { state, brokers }
    }

    /// Seed list of every broker, comma separated.
    pub fn hosts(&self) -> String {
        self.brokers
            .iter()
            .map(|b| format!("127.0.0.1:{}", b.port))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Client configuration pointing at the whole cluster, in node order.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            hosts: vec![self.hosts()],
            client_id: "mock-test".to_string(),
            timeout: Some(Duration::from_secs(5)),
            randomize_hosts: false,
        }
    }

    pub fn port(&self, node_id: i32) -> u16 {
        self.brokers
            .iter()
            .find(|b| b.node_id == node_id)
            .map(|b| b.port)
            .unwrap()
    }

    /// Create `topic` with `leaders[p]` as the leader of partition `p`.
    pub fn create_topic(&self, topic: &str, leaders: &[i32]) {
        let mut state = self.state.lock().unwrap();
        let partitions = leaders
            .iter()
            .enumerate()
            .map(|(p, leader)| (p as i32, *leader))
            .collect();
        state.topics.insert(topic.to_string(), partitions);
        for p in 0..leaders.len() as i32 {
            state.logs.entry(TopicAndPartition::new(topic, p)).or_default();
        }
    }

    pub fn set_leader(&self, topic: &str, partition: i32, leader: i32) {
        let mut state = self.state.lock().unwrap();
        state
            .topics
            .get_mut(topic)
            .unwrap()
            .insert(partition, leader);
    }

    /// Answer the next request for the partition with `code`.
    pub fn inject_error(&self, topic: &str, partition: i32, code: KafkaCode) {
        self.state
            .lock()
            .unwrap()
            .errors
            .entry(TopicAndPartition::new(topic, partition))
            .or_default()
            .push_back(code);
    }

    /// Append uncompressed messages; returns the offset of the first one.
    pub fn append(&self, topic: &str, partition: i32, values: &[&[u8]]) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .entry(TopicAndPartition::new(topic, partition))
            .or_default();
        let first = log.len() as i64;
        for value in values {
            log.push(Message::new(Bytes::copy_from_slice(value), None));
        }
        first
    }

    pub fn log(&self, topic: &str, partition: i32) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&TopicAndPartition::new(topic, partition))
            .cloned()
            .unwrap_or_default()
    }

    pub fn values(&self, topic: &str, partition: i32) -> Vec<Bytes> {
        self.log(topic, partition)
            .into_iter()
            .map(|m| m.value.unwrap_or_default())
            .collect()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .get(&(group.to_string(), TopicAndPartition::new(topic, partition)))
            .copied()
    }

    pub fn set_committed(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state
            .lock()
            .unwrap()
            .commits
            .insert((group.to_string(), TopicAndPartition::new(topic, partition)), offset);
    }

    pub fn request_count(&self, node_id: i32, api_key: ApiKey) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .get(&(node_id, api_key))
            .copied()
            .unwrap_or(0)
    }

    /// Stop a broker: its listener closes and every open connection drops.
    pub async fn kill(&self, node_id: i32) {
        let broker = self.brokers.iter().find(|b| b.node_id == node_id).unwrap();
        broker.accept.abort();
        broker.connections.lock().unwrap().abort_all();
        // let the runtime drop the aborted sockets
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Poll until `f` holds or `timeout` passes.
    pub async fn wait_for<F: Fn(&Self) -> bool>(&self, timeout: Duration, f: F) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if f(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        f(self)
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for broker in &self.brokers {
            broker.accept.abort();
            broker.connections.lock().unwrap().abort_all();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    node_id: i32,
    state: Arc<Mutex<ClusterState>>,
    connections: Arc<Mutex<JoinSet<()>>>,
) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let state = Arc::clone(&state);
        connections
            .lock()
            .unwrap()
            .spawn(serve(socket, node_id, state));
    }
}

async fn serve(mut socket: TcpStream, node_id: i32, state: Arc<Mutex<ClusterState>>) {
    loop {
        let Ok(size) = socket.read_i32().await else {
            return;
        };
        let mut frame = vec![0u8; size as usize];
        if socket.read_exact(&mut frame).await.is_err() {
            return;
        }

        let Ok((header, request)) = parse_request(Bytes::from(frame)) else {
            return;
        };

        let response = {
            let mut state = state.lock().unwrap();
            *state.requests.entry((node_id, header.api_key)).or_default() += 1;
            let correlation_id = if state.mismatch_nodes.contains(&node_id) {
                header.correlation_id.wrapping_add(1)
            } else {
                header.correlation_id
            };
            let response = handle(&mut state, node_id, correlation_id, request);
            if state.garbled_nodes.contains(&node_id) {
                response.map(|_| garbled(correlation_id))
            } else {
                response
            }
        };

        if let Some(response) = response {
            if socket.write_all(&response).await.is_err() {
                return;
            }
        }
    }
}

/// A frame with a valid correlation id whose body promises five topics and carries none.
fn garbled(correlation_id: i32) -> Bytes {
    let mut frame = Vec::with_capacity(12);
    frame.extend_from_slice(&8i32.to_be_bytes());
    frame.extend_from_slice(&correlation_id.to_be_bytes());
    frame.extend_from_slice(&5i32.to_be_bytes());
    Bytes::from(frame)
}

/// Error to answer for a partition served by `node_id`, if any.
fn partition_error(state: &mut ClusterState, node_id: i32, tp: &TopicAndPartition) -> KafkaCode {
    if let Some(code) = state.errors.get_mut(tp).and_then(|codes| codes.pop_front()) {
        return code;
    }
    match state.topics.get(&tp.topic).and_then(|p| p.get(&tp.partition)) {
        None => KafkaCode::UnknownTopicOrPartition,
        Some(leader) if *leader != node_id => KafkaCode::NotLeaderForPartition,
        Some(_) => KafkaCode::None,
    }
}

fn handle(state: &mut ClusterState, node_id: i32, correlation_id: i32, request: Request) -> Option<Bytes> {
    match request {
        Request::Metadata(request) => {
            let mut names: Vec<String> = if request.topics.is_empty() {
                state.topics.keys().cloned().collect()
            } else {
                request.topics.clone()
            };
            names.dedup();

            let mut topics = Vec::new();
            for name in names {
                match state.topics.get(&name) {
                    Some(partitions) => topics.push(TopicMetadata {
                        topic: name.clone(),
                        error: KafkaCode::None,
                        partitions: partitions
                            .iter()
                            .map(|(p, leader)| PartitionMetadata {
                                topic: name.clone(),
                                partition: *p,
                                leader: *leader,
                                replicas: vec![*leader],
                                isr: vec![*leader],
                                error: match state
                                    .metadata_errors
                                    .get(&TopicAndPartition::new(name.as_str(), *p))
                                {
                                    Some(code) => *code,
                                    None if *leader < 0 => KafkaCode::LeaderNotAvailable,
                                    None => KafkaCode::None,
                                },
                            })
                            .collect(),
                    }),
                    None if state.auto_create => {
                        state.topics.insert(name.clone(), BTreeMap::from([(0, 0)]));
                        state.logs.entry(TopicAndPartition::new(name.as_str(), 0)).or_default();
                        topics.push(TopicMetadata {
                            topic: name,
                            error: KafkaCode::LeaderNotAvailable,
                            partitions: vec![],
                        });
                    }
                    None => topics.push(TopicMetadata {
                        topic: name,
                        error: KafkaCode::UnknownTopicOrPartition,
                        partitions: vec![],
                    }),
                }
            }

            let response = MetadataResponse {
                brokers: state.brokers.clone(),
                topics,
            };
            Some(encode_metadata_response(correlation_id, &response).unwrap())
        }

        Request::Produce(request) => {
            let mut responses = Vec::new();
            for partition in request.partitions {
                let tp = TopicAndPartition::new(partition.topic.as_str(), partition.partition);
                let error = partition_error(state, node_id, &tp);
                if error != KafkaCode::None {
                    responses.push(ProduceResponse::error(tp.topic, tp.partition, error));
                    continue;
                }

                let messages = decode_message_set(partition.message_set).unwrap();
                let log = state.logs.entry(tp.clone()).or_default();
                let base = log.len() as i64;
                log.extend(messages.into_iter().map(|m| m.message));
                responses.push(ProduceResponse::success(tp.topic, tp.partition, base));
            }

            if request.acks == 0 {
                return None;
            }
            Some(encode_produce_response(correlation_id, &responses).unwrap())
        }

        Request::Fetch(request) => {
            let mut responses = Vec::new();
            for payload in request.payloads {
                let tp = TopicAndPartition::new(payload.topic.as_str(), payload.partition);
                let log = state.logs.get(&tp).cloned().unwrap_or_default();
                let highwater_mark = log.len() as i64;

                let mut error = partition_error(state, node_id, &tp);
                if error == KafkaCode::None && (payload.offset < 0 || payload.offset > highwater_mark) {
                    error = KafkaCode::OffsetOutOfRange;
                }
                if error != KafkaCode::None {
                    responses.push(FetchResponse {
                        topic: tp.topic,
                        partition: tp.partition,
                        error,
                        highwater_mark: -1,
                        message_set: Bytes::new(),
                    });
                    continue;
                }

                let entries: Vec<(i64, &Message)> = log
                    .iter()
                    .enumerate()
                    .skip(payload.offset as usize)
                    .map(|(offset, message)| (offset as i64, message))
                    .collect();
                let set = encode_message_set_with_offsets(&entries).unwrap();
                let mut limit = set.len().min(payload.max_bytes.max(0) as usize);
                if let Some(cap) = state.fetch_byte_cap {
                    limit = limit.min(cap);
                }

                responses.push(FetchResponse {
                    topic: tp.topic,
                    partition: tp.partition,
                    error,
                    highwater_mark,
                    message_set: set.slice(..limit),
                });
            }
            Some(encode_fetch_response(correlation_id, &responses).unwrap())
        }

        Request::Offset(request) => {
            let mut responses = Vec::new();
            for payload in request.payloads {
                let tp = TopicAndPartition::new(payload.topic.as_str(), payload.partition);
                let error = partition_error(state, node_id, &tp);
                let latest = state.logs.get(&tp).map(|l| l.len() as i64).unwrap_or(0);
                let offsets = match (error, payload.time) {
                    (KafkaCode::None, -2) => vec![0],
                    (KafkaCode::None, _) => vec![latest],
                    _ => vec![],
                };
                responses.push(OffsetResponse {
                    topic: tp.topic,
                    partition: tp.partition,
                    error,
                    offsets,
                });
            }
            Some(encode_offset_response(correlation_id, &responses).unwrap())
        }

        Request::OffsetCommit(request) => {
            let mut responses = Vec::new();
            for payload in request.payloads {
                let tp = TopicAndPartition::new(payload.topic.as_str(), payload.partition);
                let error = partition_error(state, node_id, &tp);
                if error == KafkaCode::None {
                    state.commits.insert((request.group.clone(), tp.clone()), payload.offset);
                }
                responses.push(OffsetCommitResponse {
                    topic: tp.topic,
                    partition: tp.partition,
                    error,
                });
            }
            Some(encode_offset_commit_response(correlation_id, &responses).unwrap())
        }

        Request::OffsetFetch(request) => {
            let mut responses = Vec::new();
            for payload in request.payloads {
                let tp = TopicAndPartition::new(payload.topic.as_str(), payload.partition);
                let mut error = partition_error(state, node_id, &tp);
                let committed = state.commits.get(&(request.group.clone(), tp.clone())).copied();
                if error == KafkaCode::None && committed.is_none() {
                    error = KafkaCode::UnknownTopicOrPartition;
                }
                responses.push(OffsetFetchResponse {
                    topic: tp.topic,
                    partition: tp.partition,
                    offset: committed.unwrap_or(-1),
                    metadata: None,
                    error,
                });
            }
            Some(encode_offset_fetch_response(correlation_id, &responses).unwrap())
        }
    }
}
