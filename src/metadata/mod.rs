//! Cluster metadata cache.
//!
//! Holds the latest immutable [`MetadataSnapshot`] and decides when to load
//! a new one: on first use, on explicit invalidation (leader errors,
//! unknown topics, purges, subscription edits), and on a periodic ceiling.
//! Concurrent refresh triggers are debounced below `metadata_min_age` into
//! a single load; the snapshot generation is published through a watch
//! channel so every waiter observes the same result.
//!
//! The cache also runs the missing-topic clock: a subscribed topic absent
//! from successful metadata loads for longer than the delete timeout is
//! reported for internal purging.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::config::ClientConfig;
use crate::error::KafkaCode;
use crate::transport::BrokerEndpoint;

/// Per-partition metadata from the latest snapshot. The consumer keeps
/// what it routes on (leader and epoch); replica sets stay on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionMeta {
    pub partition: i32,
    pub leader: i32,
    pub leader_epoch: i32,
}

/// Per-topic metadata from the latest snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopicMeta {
    pub partitions: Vec<PartitionMeta>,
    pub error: Option<KafkaCode>,
}

/// An immutable view of the cluster, replaced atomically on every load.
#[derive(Debug)]
pub(crate) struct MetadataSnapshot {
    pub brokers: HashMap<i32, BrokerEndpoint>,
    pub topics: HashMap<String, TopicMeta>,
    pub generation: u64,
    pub fetched_at: Instant,
}

#[derive(Debug, Default)]
struct MissingTopic {
    since: Option<Instant>,
    loads: u32,
}

pub(crate) struct MetadataCache {
    snapshot: RwLock<Option<Arc<MetadataSnapshot>>>,
    refresh: Notify,
    generation_tx: watch::Sender<u64>,
    last_attempt: Mutex<Option<Instant>>,
    /// Subscribed topics currently absent from successful metadata.
    missing: Mutex<HashMap<String, MissingTopic>>,
    /// Consecutive unknown-topic fetch errors per topic.
    fetch_strikes: Mutex<HashMap<String, u32>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            snapshot: RwLock::new(None),
            refresh: Notify::new(),
            generation_tx,
            last_attempt: Mutex::new(None),
            missing: Mutex::new(HashMap::new()),
            fetch_strikes: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<MetadataSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Ask the metadata loop to load soon; triggers coalesce.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn refresh_signal(&self) -> &Notify {
        &self.refresh
    }

    fn publish(&self, mut snapshot: MetadataSnapshot) -> Arc<MetadataSnapshot> {
        let generation = *self.generation_tx.borrow() + 1;
        snapshot.generation = generation;
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = Some(snapshot.clone());
        let _ = self.generation_tx.send(generation);
        snapshot
    }

    fn note_load_attempt(&self) {
        *self.last_attempt.lock() = Some(Instant::now());
    }

    /// Time left before another load is allowed, if inside the min age.
    fn min_age_remaining(&self, min_age: Duration) -> Option<Duration> {
        let last = (*self.last_attempt.lock())?;
        let elapsed = last.elapsed();
        (elapsed < min_age).then(|| min_age - elapsed)
    }

    /// Record an unknown-topic fetch error; returns the strike count. Two
    /// strikes mark the topic as missing even before metadata agrees, so
    /// the delete clock starts no later than the fetch path noticed.
    pub fn note_fetch_missing(&self, topic: &str) -> u32 {
        let count = {
            let mut strikes = self.fetch_strikes.lock();
            let count = strikes.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= 2 {
            self.missing
                .lock()
                .entry(topic.to_string())
                .or_default()
                .since
                .get_or_insert_with(Instant::now);
        }
        count
    }

    pub fn clear_fetch_strikes(&self, topic: &str) {
        self.fetch_strikes.lock().remove(topic);
    }

    /// Drop all bookkeeping for a purged topic.
    pub fn forget_topic(&self, topic: &str) {
        self.missing.lock().remove(topic);
        self.fetch_strikes.lock().remove(topic);
    }

    /// Advance the missing clocks after a successful load. `expected` are
    /// the topics the subscription is waiting on; `present` the topics the
    /// load actually knew. Returns topics now considered deleted.
    pub fn track_missing(
        &self,
        expected: &HashSet<String>,
        present: &HashSet<String>,
        config: &ClientConfig,
    ) -> Vec<String> {
        let mut missing = self.missing.lock();
        let mut expired = Vec::new();
        for topic in expected {
            if present.contains(topic) {
                missing.remove(topic);
                self.fetch_strikes.lock().remove(topic);
                continue;
            }
            let entry = missing.entry(topic.clone()).or_default();
            let since = *entry.since.get_or_insert_with(Instant::now);
            entry.loads += 1;
            let retries_exhausted = config.unknown_topic_retries >= 0
                && entry.loads as i64 > config.unknown_topic_retries as i64;
            if since.elapsed() >= config.missing_topic_delete_timeout || retries_exhausted {
                expired.push(topic.clone());
            }
        }
        // drop clocks for topics no longer expected
        missing.retain(|topic, _| expected.contains(topic));
        for topic in &expired {
            missing.remove(topic);
        }
        expired
    }

    /// The soonest instant any missing clock can expire.
    fn next_missing_deadline(&self, timeout: Duration) -> Option<Duration> {
        let missing = self.missing.lock();
        missing
            .values()
            .filter_map(|m| m.since)
            .map(|since| timeout.saturating_sub(since.elapsed()))
            .min()
    }
}

/// Builds the metadata request for the current interest set; `None` means
/// all topics (regex subscriptions need the full universe).
fn build_metadata_request(wanted: &Option<Vec<String>>) -> MetadataRequest {
    let topics = wanted.as_ref().map(|names| {
        names
            .iter()
            .map(|name| {
                MetadataRequestTopic::default()
                    .with_name(Some(TopicName(StrBytes::from_string(name.clone()))))
            })
            .collect()
    });
    MetadataRequest::default()
        .with_topics(topics)
        .with_allow_auto_topic_creation(false)
}

/// Converts a wire response into a snapshot. Topics with a broker-reported
/// error are kept (with the error) so the missing machinery can see them;
/// unnamed topics are dropped.
fn snapshot_from_response(response: MetadataResponse) -> MetadataSnapshot {
    let mut brokers = HashMap::new();
    for (node_id, broker) in &response.brokers {
        brokers.insert(
            node_id.0,
            BrokerEndpoint {
                node_id: node_id.0,
                host: broker.host.to_string(),
                port: broker.port,
                rack: broker.rack.as_ref().map(|r| r.to_string()),
            },
        );
    }

    let mut topics = HashMap::new();
    for (name, topic) in &response.topics {
        let name = &name.0;
        let partitions = topic
            .partitions
            .iter()
            .map(|p| PartitionMeta {
                partition: p.partition_index,
                leader: p.leader_id.0,
                leader_epoch: p.leader_epoch,
            })
            .collect();
        topics.insert(
            name.to_string(),
            TopicMeta {
                partitions,
                error: KafkaCode::from_code(topic.error_code),
            },
        );
    }

    MetadataSnapshot {
        brokers,
        topics,
        generation: 0,
        fetched_at: Instant::now(),
    }
}

/// The metadata task: loads on triggers and timers, publishes snapshots,
/// and reconciles the subscription after each successful load.
pub(crate) async fn run_metadata_loop(core: Arc<ClientCore>) {
    debug!("metadata loop starting");
    loop {
        let wait = match core.metadata.snapshot() {
            None => Duration::ZERO,
            Some(snapshot) => {
                let until_max = core
                    .config
                    .metadata_max_age
                    .saturating_sub(snapshot.fetched_at.elapsed());
                match core
                    .metadata
                    .next_missing_deadline(core.config.missing_topic_delete_timeout)
                {
                    Some(d) => until_max.min(d + Duration::from_millis(10)),
                    None => until_max,
                }
            }
        };
        tokio::select! {
            _ = core.metadata.refresh_signal().notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = core.close_signal().notified() => break,
        }
        if core.is_closed() {
            break;
        }
        if let Some(remaining) = core.metadata.min_age_remaining(core.config.metadata_min_age) {
            // collapse bursts of triggers into one load at the min age
            tokio::time::sleep(remaining).await;
            if core.is_closed() {
                break;
            }
        }

        core.metadata.note_load_attempt();
        let wanted = core.subscription.metadata_interest(&core.assignment);
        let request = build_metadata_request(&wanted);
        match core.transport.metadata(request).await {
            Ok(response) => {
                let snapshot = core.metadata.publish(snapshot_from_response(response));
                debug!(
                    generation = snapshot.generation,
                    brokers = snapshot.brokers.len(),
                    topics = snapshot.topics.len(),
                    "published metadata snapshot"
                );
                crate::consumer::subscription::reconcile(&core, &snapshot);
            }
            Err(err) => {
                warn!(error = %err, "metadata load failed");
                tokio::time::sleep(core.config.retry_backoff).await;
            }
        }
    }
    debug!("metadata loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::metadata_response::{
        MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    };
    use kafka_protocol::messages::BrokerId;

    fn response_with_topic(name: &str, partitions: i32, leader: i32) -> MetadataResponse {
        let parts = (0..partitions)
            .map(|p| {
                MetadataResponsePartition::default()
                    .with_partition_index(p)
                    .with_leader_id(BrokerId(leader))
                    .with_leader_epoch(0)
                    .with_replica_nodes(vec![BrokerId(leader)])
                    .with_isr_nodes(vec![BrokerId(leader)])
            })
            .collect();
        MetadataResponse::default()
            .with_brokers(indexmap::IndexMap::from([(
                BrokerId(leader),
                MetadataResponseBroker::default()
                    .with_host(StrBytes::from_string("localhost".to_string()))
                    .with_port(9092),
            )]))
            .with_topics(indexmap::IndexMap::from([(
                TopicName(StrBytes::from_string(name.to_string())),
                MetadataResponseTopic::default().with_partitions(parts),
            )]))
    }

    #[test]
    fn test_snapshot_from_response() {
        let snapshot = snapshot_from_response(response_with_topic("events", 3, 7));
        assert_eq!(snapshot.brokers.len(), 1);
        assert_eq!(snapshot.brokers[&7].port, 9092);
        let topic = &snapshot.topics["events"];
        assert_eq!(topic.partitions.len(), 3);
        assert_eq!(topic.partitions[1].leader, 7);
        assert!(topic.error.is_none());
    }

    #[test]
    fn test_snapshot_keeps_errored_topics() {
        let response = MetadataResponse::default().with_topics(indexmap::IndexMap::from([(
            TopicName(StrBytes::from_string("gone".to_string())),
            MetadataResponseTopic::default()
                .with_error_code(KafkaCode::UnknownTopicOrPartition.as_i16()),
        )]));
        let snapshot = snapshot_from_response(response);
        assert_eq!(
            snapshot.topics["gone"].error,
            Some(KafkaCode::UnknownTopicOrPartition)
        );
        assert!(snapshot.topics["gone"].partitions.is_empty());
    }

    #[test]
    fn test_missing_clock_expires_by_retries() {
        let cache = MetadataCache::new();
        let config = ClientConfig::default().with_unknown_topic_retries(2);
        let expected: HashSet<String> = ["ghost".to_string()].into();
        let present = HashSet::new();

        assert!(cache.track_missing(&expected, &present, &config).is_empty());
        assert!(cache.track_missing(&expected, &present, &config).is_empty());
        let expired = cache.track_missing(&expected, &present, &config);
        assert_eq!(expired, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_missing_clock_resets_when_topic_appears() {
        let cache = MetadataCache::new();
        let config = ClientConfig::default().with_unknown_topic_retries(1);
        let expected: HashSet<String> = ["flappy".to_string()].into();

        assert!(cache
            .track_missing(&expected, &HashSet::new(), &config)
            .is_empty());
        // the topic shows up, clearing the clock
        assert!(cache
            .track_missing(&expected, &expected, &config)
            .is_empty());
        // and vanishes again: the count restarts
        assert!(cache
            .track_missing(&expected, &HashSet::new(), &config)
            .is_empty());
    }

    #[test]
    fn test_two_fetch_strikes_start_the_clock() {
        let cache = MetadataCache::new();
        assert_eq!(cache.note_fetch_missing("t"), 1);
        assert!(cache.missing.lock().get("t").is_none());
        assert_eq!(cache.note_fetch_missing("t"), 2);
        assert!(cache.missing.lock()["t"].since.is_some());
        cache.forget_topic("t");
        assert!(cache.missing.lock().is_empty());
    }
}
