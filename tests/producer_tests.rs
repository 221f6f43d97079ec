//! Integration tests for the simple and keyed producers.
//!
//! **Note:** These tests require network socket access (TCP listener on 127.0.0.1).

mod common;

use std::time::Duration;

use bytes::Bytes;

use common::MockCluster;
use kafkaesque_client::client::KafkaClient;
use kafkaesque_client::config::ProducerConfig;
use kafkaesque_client::error::{Error, KafkaCode};
use kafkaesque_client::partitioner::{HashedPartitioner, Partitioner, RoundRobinPartitioner};
use kafkaesque_client::producer::{KeyedProducer, SimpleProducer};
use kafkaesque_client::protocol::ApiKey;
use kafkaesque_client::types::CodecKind;

async fn cluster_with_topic(partitions: usize) -> MockCluster {
    let cluster = MockCluster::start(1).await;
    cluster.create_topic("t", &vec![0; partitions]);
    cluster
}

async fn client_for(cluster: &MockCluster) -> KafkaClient {
    KafkaClient::connect(cluster.client_config()).await.unwrap()
}

fn sequential() -> ProducerConfig {
    ProducerConfig {
        random_start: false,
        ..ProducerConfig::default()
    }
}

fn payload(value: &str) -> Bytes {
    Bytes::from(value.to_string())
}

// ============================================================================
// SimpleProducer
// ============================================================================

#[tokio::test]
async fn test_simple_producer_cycles_partitions_in_order() {
    let cluster = cluster_with_topic(3).await;
    let mut producer = SimpleProducer::new(client_for(&cluster).await, sequential()).unwrap();

    for i in 0..6 {
        let responses = producer
            .send_messages("t", &[payload(&format!("m{}", i))])
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].partition, i % 3);
        assert_eq!(responses[0].error, KafkaCode::None);
    }

    assert_eq!(cluster.values("t", 0), vec![payload("m0"), payload("m3")]);
    assert_eq!(cluster.values("t", 1), vec![payload("m1"), payload("m4")]);
    assert_eq!(cluster.values("t", 2), vec![payload("m2"), payload("m5")]);
}

#[tokio::test]
async fn test_simple_producer_random_start_still_visits_every_partition() {
    let cluster = cluster_with_topic(4).await;
    let mut producer = SimpleProducer::new(client_for(&cluster).await, ProducerConfig::default()).unwrap();

    let mut partitions = Vec::new();
    for _ in 0..4 {
        let responses = producer.send_messages("t", &[payload("x")]).await.unwrap();
        partitions.push(responses[0].partition);
    }

    // consecutive partitions, starting anywhere
    for pair in partitions.windows(2) {
        assert_eq!(pair[1], (pair[0] + 1) % 4);
    }
    partitions.sort_unstable();
    assert_eq!(partitions, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_simple_producer_sends_all_payloads_in_one_request() {
    let cluster = cluster_with_topic(1).await;
    let mut producer = SimpleProducer::new(client_for(&cluster).await, sequential()).unwrap();

    let responses = producer
        .send_messages("t", &[payload("a"), payload("b"), payload("c")])
        .await
        .unwrap();
    assert_eq!(responses[0].offset, 0);
    assert_eq!(cluster.request_count(0, ApiKey::Produce), 1);
    assert_eq!(cluster.values("t", 0), vec![payload("a"), payload("b"), payload("c")]);
}

#[tokio::test]
async fn test_simple_producer_unknown_topic() {
    let cluster = cluster_with_topic(1).await;
    let mut producer = SimpleProducer::new(client_for(&cluster).await, sequential()).unwrap();

    let err = producer.send_messages("missing", &[payload("x")]).await.unwrap_err();
    assert_eq!(err.kafka_code(), Some(KafkaCode::UnknownTopicOrPartition));
}

#[tokio::test]
async fn test_sync_send_surfaces_broker_error() {
    let cluster = cluster_with_topic(1).await;
    cluster.inject_error("t", 0, KafkaCode::MessageSizeTooLarge);
    let mut producer = SimpleProducer::new(client_for(&cluster).await, sequential()).unwrap();

    let err = producer.send_messages("t", &[payload("x")]).await.unwrap_err();
    assert_eq!(err.kafka_code(), Some(KafkaCode::MessageSizeTooLarge));
    assert!(cluster.log("t", 0).is_empty());
}

#[tokio::test]
async fn test_stopped_producer_rejects_sends() {
    let cluster = cluster_with_topic(1).await;
    let mut producer = SimpleProducer::new(client_for(&cluster).await, sequential()).unwrap();

    producer.stop().await;
    producer.stop().await;
    let err = producer.send_messages("t", &[payload("late")]).await.unwrap_err();
    assert!(matches!(err, Error::ProducerStopped));
}

#[cfg(feature = "gzip")]
#[tokio::test]
async fn test_gzip_producer_stores_flattened_messages() {
    let cluster = cluster_with_topic(1).await;
    let config = ProducerConfig {
        codec: CodecKind::Gzip,
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    producer
        .send_messages("t", &[payload("one"), payload("two")])
        .await
        .unwrap();
    assert_eq!(cluster.values("t", 0), vec![payload("one"), payload("two")]);
}

#[cfg(feature = "snappy")]
#[tokio::test]
async fn test_xerial_snappy_producer_stores_flattened_messages() {
    let cluster = cluster_with_topic(1).await;
    let config = ProducerConfig {
        codec: CodecKind::Block,
        snappy_xerial: true,
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    let big = Bytes::from(vec![b'z'; 50_000]);
    producer
        .send_messages("t", &[big.clone(), payload("tail")])
        .await
        .unwrap();
    assert_eq!(cluster.values("t", 0), vec![big, payload("tail")]);
}

// ============================================================================
// KeyedProducer
// ============================================================================

#[tokio::test]
async fn test_keyed_producer_is_deterministic() {
    let cluster = cluster_with_topic(4).await;
    let mut producer: KeyedProducer =
        KeyedProducer::new(client_for(&cluster).await, sequential()).unwrap();

    let key = Bytes::from_static(b"user-17");
    let expected = HashedPartitioner.partition(&key, &[0, 1, 2, 3]).unwrap();

    for i in 0..3 {
        let responses = producer
            .send_messages("t", key.clone(), &[payload(&format!("v{}", i))])
            .await
            .unwrap();
        assert_eq!(responses[0].partition, expected);
    }

    let log = cluster.log("t", expected);
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|m| m.key.as_ref() == Some(&key)));
}

#[tokio::test]
async fn test_keyed_producer_with_round_robin_partitioner() {
    let cluster = cluster_with_topic(2).await;
    let mut producer =
        KeyedProducer::<RoundRobinPartitioner>::new(client_for(&cluster).await, sequential()).unwrap();

    let mut partitions = Vec::new();
    for _ in 0..4 {
        let responses = producer
            .send_messages("t", Bytes::from_static(b"same"), &[payload("x")])
            .await
            .unwrap();
        partitions.push(responses[0].partition);
    }
    assert_eq!(partitions, vec![0, 1, 0, 1]);
}

// ============================================================================
// Async mode
// ============================================================================

#[tokio::test]
async fn test_batch_flushes_on_count_in_one_request() {
    let cluster = cluster_with_topic(2).await;
    let config = ProducerConfig {
        batch_send: true,
        batch_send_every_n: 4,
        batch_send_every_t: Duration::from_secs(30),
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    for i in 0..4 {
        let responses = producer
            .send_messages("t", &[payload(&format!("b{}", i))])
            .await
            .unwrap();
        assert!(responses.is_empty());
    }

    let flushed = cluster
        .wait_for(Duration::from_secs(5), |c| {
            c.log("t", 0).len() + c.log("t", 1).len() == 4
        })
        .await;
    assert!(flushed);
    assert_eq!(cluster.request_count(0, ApiKey::Produce), 1);
    assert_eq!(cluster.values("t", 0), vec![payload("b0"), payload("b2")]);
    assert_eq!(cluster.values("t", 1), vec![payload("b1"), payload("b3")]);

    producer.stop().await;
}

#[tokio::test]
async fn test_batch_flushes_on_interval() {
    let cluster = cluster_with_topic(1).await;
    let config = ProducerConfig {
        batch_send: true,
        batch_send_every_n: 1000,
        batch_send_every_t: Duration::from_millis(100),
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    producer.send_messages("t", &[payload("tick")]).await.unwrap();
    let flushed = cluster
        .wait_for(Duration::from_secs(5), |c| c.log("t", 0).len() == 1)
        .await;
    assert!(flushed);

    producer.stop().await;
}

#[tokio::test]
async fn test_stop_flushes_pending_messages() {
    let cluster = cluster_with_topic(1).await;
    let config = ProducerConfig {
        batch_send: true,
        batch_send_every_n: 1000,
        batch_send_every_t: Duration::from_secs(60),
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    producer
        .send_messages("t", &[payload("p1"), payload("p2")])
        .await
        .unwrap();
    assert!(cluster.log("t", 0).is_empty());

    producer.stop().await;
    assert_eq!(cluster.values("t", 0), vec![payload("p1"), payload("p2")]);
    assert_eq!(cluster.request_count(0, ApiKey::Produce), 1);

    let err = producer.send_messages("t", &[payload("p3")]).await.unwrap_err();
    assert!(matches!(err, Error::ProducerStopped));
}

#[tokio::test]
async fn test_async_send_without_batching_sends_each_message() {
    let cluster = cluster_with_topic(1).await;
    let config = ProducerConfig {
        async_send: true,
        ..sequential()
    };
    let mut producer = SimpleProducer::new(client_for(&cluster).await, config).unwrap();

    producer.send_messages("t", &[payload("a")]).await.unwrap();
    producer.send_messages("t", &[payload("b")]).await.unwrap();
    let delivered = cluster
        .wait_for(Duration::from_secs(5), |c| c.log("t", 0).len() == 2)
        .await;
    assert!(delivered);
    assert_eq!(cluster.values("t", 0), vec![payload("a"), payload("b")]);

    producer.stop().await;
}
