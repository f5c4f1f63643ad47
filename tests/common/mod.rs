//! In-memory cluster for integration tests.
//!
//! `MockCluster` implements [`Transport`] over shared state: topics with
//! settable leaders and epochs, real record batches encoded with
//! `kafka-protocol`, and fetch long-polling that honors `max_wait_ms`.
//! Tests drive the broker side (produce, delete topics, move leaders)
//! directly and the client side through the public API.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::{
    BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record as WireRecord, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use streamline_client::{
    Client, ClientConfig, EpochOffset, GroupAssignment, GroupCoordinator, Record, Result,
    Transport,
};

const NONE: i16 = 0;
const OFFSET_OUT_OF_RANGE: i16 = 1;
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
const NOT_LEADER_OR_FOLLOWER: i16 = 6;

struct MockPartition {
    leader: i32,
    leader_epoch: i32,
    records: Vec<(Option<Bytes>, Bytes)>,
}

struct MockTopic {
    partitions: Vec<MockPartition>,
}

#[derive(Default)]
struct ClusterState {
    brokers: Vec<i32>,
    topics: HashMap<String, MockTopic>,
}

pub struct MockCluster {
    state: Mutex<ClusterState>,
    changed: Notify,
}

impl MockCluster {
    pub fn new() -> Arc<MockCluster> {
        Self::with_brokers(&[1])
    }

    pub fn with_brokers(ids: &[i32]) -> Arc<MockCluster> {
        Arc::new(MockCluster {
            state: Mutex::new(ClusterState {
                brokers: ids.to_vec(),
                topics: HashMap::new(),
            }),
            changed: Notify::new(),
        })
    }

    pub fn create_topic(&self, name: &str, partitions: i32) {
        let mut state = self.state.lock();
        let brokers = state.brokers.clone();
        state.topics.insert(
            name.to_string(),
            MockTopic {
                partitions: (0..partitions)
                    .map(|p| MockPartition {
                        leader: brokers[p as usize % brokers.len()],
                        leader_epoch: 0,
                        records: Vec::new(),
                    })
                    .collect(),
            },
        );
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn delete_topic(&self, name: &str) {
        self.state.lock().topics.remove(name);
        self.changed.notify_waiters();
    }

    pub fn produce(&self, topic: &str, partition: i32, value: &str) {
        self.produce_kv(topic, partition, None, value);
    }

    pub fn produce_kv(&self, topic: &str, partition: i32, key: Option<&str>, value: &str) {
        let mut state = self.state.lock();
        let Some(t) = state.topics.get_mut(topic) else {
            panic!("produce to unknown topic {topic}");
        };
        let p = &mut t.partitions[partition as usize];
        p.records.push((
            key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn move_leader(&self, topic: &str, partition: i32, new_leader: i32) {
        let mut state = self.state.lock();
        let Some(t) = state.topics.get_mut(topic) else {
            return;
        };
        let p = &mut t.partitions[partition as usize];
        p.leader = new_leader;
        p.leader_epoch += 1;
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn high_watermark(&self, topic: &str, partition: i32) -> i64 {
        self.state.lock().topics[topic].partitions[partition as usize]
            .records
            .len() as i64
    }

    fn build_metadata_response(&self, request: &MetadataRequest) -> MetadataResponse {
        let state = self.state.lock();
        let brokers = state
            .brokers
            .iter()
            .map(|&id| {
                (
                    BrokerId(id),
                    MetadataResponseBroker::default()
                        .with_host(StrBytes::from_string("localhost".to_string()))
                        .with_port(9092 + id),
                )
            })
            .collect();

        let topic_meta = |topic: &MockTopic| {
            let partitions = topic
                .partitions
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    MetadataResponsePartition::default()
                        .with_error_code(NONE)
                        .with_partition_index(i as i32)
                        .with_leader_id(BrokerId(p.leader))
                        .with_leader_epoch(p.leader_epoch)
                        .with_replica_nodes(vec![BrokerId(p.leader)])
                        .with_isr_nodes(vec![BrokerId(p.leader)])
                })
                .collect();
            MetadataResponseTopic::default()
                .with_error_code(NONE)
                .with_partitions(partitions)
        };

        let topics = match &request.topics {
            None => state
                .topics
                .iter()
                .map(|(name, topic)| {
                    (
                        TopicName(StrBytes::from_string(name.clone())),
                        topic_meta(topic),
                    )
                })
                .collect(),
            Some(requested) => requested
                .iter()
                .filter_map(|rt| rt.name.as_ref())
                .map(|name| match state.topics.get(name.as_str()) {
                    Some(topic) => (name.clone(), topic_meta(topic)),
                    None => (
                        name.clone(),
                        MetadataResponseTopic::default()
                            .with_error_code(UNKNOWN_TOPIC_OR_PARTITION),
                    ),
                })
                .collect(),
        };

        MetadataResponse::default()
            .with_brokers(brokers)
            .with_controller_id(BrokerId(state.brokers[0]))
            .with_topics(topics)
    }

    /// Serves one fetch pass over current state. The bool says whether the
    /// response carries records or errors (long-polling waits otherwise).
    fn build_fetch_response(&self, broker: i32, request: &FetchRequest) -> (FetchResponse, bool) {
        let state = self.state.lock();
        let mut has_content = false;
        let mut responses = Vec::new();

        for topic_request in &request.topics {
            let topic_name = topic_request.topic.as_str();
            let mut partitions = Vec::new();
            for partition_request in &topic_request.partitions {
                let index = partition_request.partition;
                let mut pd = PartitionData::default()
                    .with_partition_index(index)
                    .with_high_watermark(-1)
                    .with_last_stable_offset(-1)
                    .with_log_start_offset(-1)
                    .with_records(Some(Bytes::new()));

                let Some(topic) = state.topics.get(topic_name) else {
                    pd = pd.with_error_code(UNKNOWN_TOPIC_OR_PARTITION);
                    has_content = true;
                    partitions.push(pd);
                    continue;
                };
                let Some(partition) = topic.partitions.get(index as usize) else {
                    pd = pd.with_error_code(UNKNOWN_TOPIC_OR_PARTITION);
                    has_content = true;
                    partitions.push(pd);
                    continue;
                };
                if partition.leader != broker {
                    pd = pd.with_error_code(NOT_LEADER_OR_FOLLOWER);
                    has_content = true;
                    partitions.push(pd);
                    continue;
                }

                let end = partition.records.len() as i64;
                let fetch_offset = partition_request.fetch_offset;
                if fetch_offset > end || fetch_offset < 0 {
                    pd = pd.with_error_code(OFFSET_OUT_OF_RANGE).with_high_watermark(end);
                    has_content = true;
                    partitions.push(pd);
                    continue;
                }

                pd = pd
                    .with_error_code(NONE)
                    .with_high_watermark(end)
                    .with_last_stable_offset(end)
                    .with_log_start_offset(0);
                if fetch_offset < end {
                    let batch =
                        encode_batch(&partition.records, fetch_offset, partition.leader_epoch);
                    pd = pd.with_records(Some(batch));
                    has_content = true;
                }
                partitions.push(pd);
            }
            responses.push(
                FetchableTopicResponse::default()
                    .with_topic(topic_request.topic.clone())
                    .with_partitions(partitions),
            );
        }

        let response = FetchResponse::default()
            .with_error_code(NONE)
            .with_session_id(1000 + broker)
            .with_responses(responses);
        (response, has_content)
    }

    fn build_list_offsets_response(
        &self,
        broker: i32,
        request: &ListOffsetsRequest,
    ) -> ListOffsetsResponse {
        let state = self.state.lock();
        let mut topics = Vec::new();
        for topic_request in &request.topics {
            let topic_name = topic_request.name.as_str();
            let mut partitions = Vec::new();
            for partition_request in &topic_request.partitions {
                let index = partition_request.partition_index;
                let mut pr = ListOffsetsPartitionResponse::default()
                    .with_partition_index(index)
                    .with_timestamp(-1)
                    .with_offset(-1);

                let found = state
                    .topics
                    .get(topic_name)
                    .and_then(|t| t.partitions.get(index as usize));
                let Some(partition) = found else {
                    partitions.push(pr.with_error_code(UNKNOWN_TOPIC_OR_PARTITION));
                    continue;
                };
                if partition.leader != broker {
                    partitions.push(pr.with_error_code(NOT_LEADER_OR_FOLLOWER));
                    continue;
                }

                let end = partition.records.len() as i64;
                let offset = match partition_request.timestamp {
                    -2 => 0,
                    -1 => end,
                    wanted => {
                        // record timestamps are their offsets in the mock
                        (0..end).find(|o| *o >= wanted).unwrap_or(-1)
                    }
                };
                pr = pr
                    .with_error_code(NONE)
                    .with_offset(offset)
                    .with_leader_epoch(partition.leader_epoch);
                partitions.push(pr);
            }
            topics.push(
                ListOffsetsTopicResponse::default()
                    .with_name(topic_request.name.clone())
                    .with_partitions(partitions),
            );
        }
        ListOffsetsResponse::default().with_topics(topics)
    }
}

fn encode_batch(records: &[(Option<Bytes>, Bytes)], from: i64, leader_epoch: i32) -> Bytes {
    let wire_records: Vec<WireRecord> = records
        .iter()
        .enumerate()
        .skip(from as usize)
        .map(|(offset, (key, value))| WireRecord {
            transactional: false,
            control: false,
            partition_leader_epoch: leader_epoch,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: offset as i64,
            sequence: offset as i32,
            timestamp: offset as i64,
            key: key.clone(),
            value: Some(value.clone()),
            headers: Default::default(),
        })
        .collect();
    let mut encoded = BytesMut::new();
    RecordBatchEncoder::encode(
        &mut encoded,
        wire_records.iter(),
        &RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        },
    )
    .expect("encoding a record batch for the mock cluster cannot fail");
    encoded.freeze()
}

#[async_trait]
impl Transport for MockCluster {
    async fn metadata(&self, request: MetadataRequest) -> Result<MetadataResponse> {
        Ok(self.build_metadata_response(&request))
    }

    async fn fetch(&self, broker: i32, request: FetchRequest) -> Result<FetchResponse> {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        loop {
            let changed = self.changed.notified();
            let (response, has_content) = self.build_fetch_response(broker, &request);
            if has_content || Instant::now() >= deadline {
                return Ok(response);
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        }
    }

    async fn list_offsets(
        &self,
        broker: i32,
        request: ListOffsetsRequest,
    ) -> Result<ListOffsetsResponse> {
        Ok(self.build_list_offsets_response(broker, &request))
    }
}

/// A scripted group coordinator: tests push assignments in, the client
/// pulls them out; committed offsets come from a plain map.
pub struct MockGroupCoordinator {
    assignments: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupAssignment>>,
    committed: Mutex<HashMap<(String, i32), EpochOffset>>,
}

impl MockGroupCoordinator {
    pub fn new() -> (Arc<MockGroupCoordinator>, mpsc::UnboundedSender<GroupAssignment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockGroupCoordinator {
                assignments: tokio::sync::Mutex::new(rx),
                committed: Mutex::new(HashMap::new()),
            }),
            tx,
        )
    }

    pub fn set_committed(&self, topic: &str, partition: i32, offset: EpochOffset) {
        self.committed
            .lock()
            .insert((topic.to_string(), partition), offset);
    }
}

#[async_trait]
impl GroupCoordinator for MockGroupCoordinator {
    async fn next_assignment(&self) -> Option<GroupAssignment> {
        self.assignments.lock().await.recv().await
    }

    async fn committed_offset(&self, topic: &str, partition: i32) -> Option<EpochOffset> {
        self.committed
            .lock()
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

/// Fast timers for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_metadata_min_age(Duration::from_millis(10))
        .with_metadata_max_age(Duration::from_millis(500))
        .with_fetch_max_wait(Duration::from_millis(100))
        .with_retry_backoff(Duration::from_millis(20))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn value_str(record: &Record) -> String {
    record
        .value
        .as_ref()
        .map(|v| String::from_utf8_lossy(v).to_string())
        .unwrap_or_default()
}

/// Polls until at least `want` records arrive or `timeout` passes.
pub async fn poll_until_records(client: &Client, want: usize, timeout: Duration) -> Vec<Record> {
    let deadline = Instant::now() + timeout;
    let mut records = Vec::new();
    while records.len() < want {
        let now = Instant::now();
        assert!(
            now < deadline,
            "timed out with {} of {} records: {:?}",
            records.len(),
            want,
            records.iter().map(value_str).collect::<Vec<_>>()
        );
        let fetches = client
            .poll_fetches(Some((deadline - now).min(Duration::from_millis(250))))
            .await;
        records.extend(fetches.into_records());
    }
    records
}
