//! Per-partition buffering between the fetch schedulers and the poller.
//!
//! Each assigned partition owns a FIFO of decoded batches plus one sticky
//! error slot. Entries are created when the partition is assigned and
//! removed when it is unassigned or purged; a push only lands if the
//! entry's assignment generation still matches, which is what drops
//! in-flight results that raced a purge or re-seek.
//!
//! Buffered bytes are tracked per partition for backpressure: a partition
//! over the soft limit is excluded from fetch requests until a poll drains
//! it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::consumer::assignment::TopicPartition;
use crate::consumer::fetches::{FetchPartitionData, FetchTopic, Fetches, Record};
use crate::error::ClientError;

/// One decoded batch, in broker order.
#[derive(Debug)]
pub(crate) struct BufferedBatch {
    pub records: Vec<Record>,
    pub bytes: usize,
}

#[derive(Debug)]
struct StickyError {
    error: ClientError,
    /// Fatal errors survive delivery and keep surfacing on every poll
    /// until the partition is re-seeked or reassigned; transient ones are
    /// consumed by the poll that reports them.
    fatal: bool,
}

#[derive(Debug, Default)]
struct PartitionBuffer {
    gen: u64,
    batches: VecDeque<BufferedBatch>,
    buffered_bytes: usize,
    backpressured: bool,
    sticky: Option<StickyError>,
    high_watermark: i64,
}

impl PartitionBuffer {
    fn has_data(&self) -> bool {
        !self.batches.is_empty() || self.sticky.is_some()
    }
}

pub(crate) struct BufferPool {
    inner: Mutex<HashMap<TopicPartition, PartitionBuffer>>,
    data_ready: Notify,
    soft_limit: usize,
}

impl BufferPool {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            data_ready: Notify::new(),
            soft_limit,
        }
    }

    /// Creates (or resets, on a generation change) the buffer entry for an
    /// assigned partition.
    pub fn ensure(&self, topic: &str, partition: i32, gen: u64) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry((topic.to_string(), partition))
            .or_insert_with(PartitionBuffer::default);
        if entry.gen != gen {
            *entry = PartitionBuffer {
                gen,
                high_watermark: -1,
                ..PartitionBuffer::default()
            };
        }
    }

    pub fn remove(&self, topic: &str, partition: i32) {
        self.inner.lock().remove(&(topic.to_string(), partition));
    }

    /// Drops every buffer of a topic, including the synthetic `-1` slot
    /// used for topic-level errors.
    pub fn remove_topic(&self, topic: &str) {
        self.inner.lock().retain(|(t, _), _| t != topic);
    }

    /// Appends a batch if the entry still belongs to `gen`. Returns true
    /// if it landed.
    pub fn push_batch(
        &self,
        topic: &str,
        partition: i32,
        gen: u64,
        batch: BufferedBatch,
        high_watermark: i64,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&(topic.to_string(), partition)) else {
            return false;
        };
        if entry.gen != gen {
            return false;
        }
        entry.buffered_bytes += batch.bytes;
        entry.high_watermark = high_watermark;
        entry.batches.push_back(batch);
        if entry.buffered_bytes > self.soft_limit {
            entry.backpressured = true;
        }
        drop(inner);
        self.data_ready.notify_waiters();
        true
    }

    /// Sets the sticky error slot if the entry still belongs to `gen`.
    pub fn set_sticky(
        &self,
        topic: &str,
        partition: i32,
        gen: u64,
        error: ClientError,
        fatal: bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(&(topic.to_string(), partition)) else {
            return false;
        };
        if entry.gen != gen {
            return false;
        }
        entry.sticky = Some(StickyError { error, fatal });
        drop(inner);
        self.data_ready.notify_waiters();
        true
    }

    /// Records a topic-level error with no partition to pin it to (unknown
    /// topic with no partitions). Keyed at partition `-1`, generation 0.
    pub fn set_topic_error(&self, topic: &str, error: ClientError) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entry((topic.to_string(), -1))
            .or_insert_with(PartitionBuffer::default);
        entry.high_watermark = -1;
        entry.sticky = Some(StickyError { error, fatal: false });
        drop(inner);
        self.data_ready.notify_waiters();
    }

    pub fn is_backpressured(&self, topic: &str, partition: i32) -> bool {
        self.inner
            .lock()
            .get(&(topic.to_string(), partition))
            .is_some_and(|e| e.backpressured)
    }

    pub fn has_data(&self) -> bool {
        self.inner.lock().values().any(|e| e.has_data())
    }

    /// Resolves when data may be available. Callers re-check `has_data`
    /// in a loop; the registration happens before the check so wakeups
    /// cannot be missed.
    pub async fn wait_data(&self) {
        let notified = self.data_ready.notified();
        if self.has_data() {
            return;
        }
        notified.await;
    }

    /// Wakes every poller (used on close).
    pub fn notify_all(&self) {
        self.data_ready.notify_waiters();
    }

    /// Drains everything buffered into a poll snapshot and clears
    /// backpressure.
    pub fn drain_all(&self) -> Fetches {
        let mut inner = self.inner.lock();
        let mut by_topic: BTreeMap<String, Vec<FetchPartitionData>> = BTreeMap::new();
        for ((topic, partition), entry) in inner.iter_mut() {
            let mut records = Vec::new();
            while let Some(batch) = entry.batches.pop_front() {
                records.extend(batch.records);
            }
            entry.buffered_bytes = 0;
            entry.backpressured = false;
            let error = take_sticky(entry);
            if records.is_empty() && error.is_none() {
                continue;
            }
            by_topic
                .entry(topic.clone())
                .or_default()
                .push(FetchPartitionData {
                    partition: *partition,
                    records,
                    error,
                    high_watermark: entry.high_watermark,
                });
        }
        build_fetches(by_topic)
    }

    /// Drains at most `max` records, round-robin across partitions so a
    /// busy partition cannot starve the others. Per-partition order is
    /// preserved; partially-consumed batches stay queued.
    pub fn drain_records(&self, max: usize) -> Fetches {
        let mut inner = self.inner.lock();
        let mut remaining = max;
        let mut drained: BTreeMap<TopicPartition, Vec<Record>> = BTreeMap::new();

        let mut keys: Vec<TopicPartition> = inner
            .iter()
            .filter(|(_, e)| !e.batches.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();

        let mut progressed = true;
        while remaining > 0 && progressed {
            progressed = false;
            for key in &keys {
                if remaining == 0 {
                    break;
                }
                let Some(entry) = inner.get_mut(key) else {
                    continue;
                };
                let Some(mut batch) = entry.batches.pop_front() else {
                    continue;
                };
                let take = batch.records.len().min(remaining);
                let rest = batch.records.split_off(take);
                let taken_bytes = if rest.is_empty() {
                    batch.bytes
                } else {
                    // approximate the split cost by record count
                    batch.bytes * take / (take + rest.len()).max(1)
                };
                drained.entry(key.clone()).or_default().extend(batch.records);
                remaining -= take;
                entry.buffered_bytes = entry.buffered_bytes.saturating_sub(taken_bytes);
                if !rest.is_empty() {
                    entry.batches.push_front(BufferedBatch {
                        records: rest,
                        bytes: batch.bytes - taken_bytes,
                    });
                }
                if entry.buffered_bytes <= self.soft_limit {
                    entry.backpressured = false;
                }
                progressed = true;
            }
        }

        // errors ride along with whatever poll observes them, capped or not
        let mut by_topic: BTreeMap<String, Vec<FetchPartitionData>> = BTreeMap::new();
        for ((topic, partition), records) in drained {
            let high_watermark = inner
                .get(&(topic.clone(), partition))
                .map(|e| e.high_watermark)
                .unwrap_or(-1);
            by_topic.entry(topic).or_default().push(FetchPartitionData {
                partition,
                records,
                error: None,
                high_watermark,
            });
        }
        for ((topic, partition), entry) in inner.iter_mut() {
            if let Some(error) = take_sticky(entry) {
                by_topic
                    .entry(topic.clone())
                    .or_default()
                    .push(FetchPartitionData {
                        partition: *partition,
                        records: Vec::new(),
                        error: Some(error),
                        high_watermark: entry.high_watermark,
                    });
            }
        }
        build_fetches(by_topic)
    }
}

fn take_sticky(entry: &mut PartitionBuffer) -> Option<ClientError> {
    match &entry.sticky {
        Some(sticky) if sticky.fatal => Some(sticky.error.clone()),
        Some(_) => entry.sticky.take().map(|s| s.error),
        None => None,
    }
}

fn build_fetches(by_topic: BTreeMap<String, Vec<FetchPartitionData>>) -> Fetches {
    let topics = by_topic
        .into_iter()
        .map(|(topic, mut partitions)| {
            partitions.sort_by_key(|p| p.partition);
            FetchTopic { topic, partitions }
        })
        .collect();
    Fetches::new(topics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KafkaCode;
    use bytes::Bytes;

    fn record(topic: &str, partition: i32, offset: i64) -> Record {
        Record {
            topic: topic.to_string(),
            partition,
            offset,
            leader_epoch: -1,
            timestamp: 0,
            key: None,
            value: Some(Bytes::from(format!("v{offset}"))),
            headers: Vec::new(),
        }
    }

    fn batch(topic: &str, partition: i32, offsets: std::ops::Range<i64>) -> BufferedBatch {
        let records: Vec<Record> = offsets.map(|o| record(topic, partition, o)).collect();
        let bytes = records.len() * 10;
        BufferedBatch { records, bytes }
    }

    #[test]
    fn test_push_requires_matching_generation() {
        let pool = BufferPool::new(usize::MAX);
        pool.ensure("t", 0, 1);
        assert!(pool.push_batch("t", 0, 1, batch("t", 0, 0..2), 2));
        assert!(!pool.push_batch("t", 0, 9, batch("t", 0, 2..4), 4));
        assert!(!pool.push_batch("t", 1, 1, batch("t", 1, 0..2), 2));
        assert_eq!(pool.drain_all().num_records(), 2);
    }

    #[test]
    fn test_drain_all_preserves_partition_order() {
        let pool = BufferPool::new(usize::MAX);
        pool.ensure("t", 0, 1);
        pool.push_batch("t", 0, 1, batch("t", 0, 0..3), 3);
        pool.push_batch("t", 0, 1, batch("t", 0, 3..5), 5);

        let fetches = pool.drain_all();
        let offsets: Vec<i64> = fetches.records().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        // drained means gone
        assert!(pool.drain_all().is_empty());
    }

    #[test]
    fn test_drain_records_caps_and_splits_batches() {
        let pool = BufferPool::new(usize::MAX);
        pool.ensure("t", 0, 1);
        pool.push_batch("t", 0, 1, batch("t", 0, 0..10), 10);

        let first = pool.drain_records(4);
        let offsets: Vec<i64> = first.records().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);

        let second = pool.drain_records(100);
        let offsets: Vec<i64> = second.records().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_drain_records_round_robins_partitions() {
        let pool = BufferPool::new(usize::MAX);
        pool.ensure("t", 0, 1);
        pool.ensure("t", 1, 2);
        pool.push_batch("t", 0, 1, batch("t", 0, 0..4), 4);
        pool.push_batch("t", 1, 2, batch("t", 1, 0..4), 4);

        let fetches = pool.drain_records(6);
        assert_eq!(fetches.num_records(), 6);
        // both partitions make progress
        let mut per_partition = [0usize; 2];
        fetches.each_record(|r| per_partition[r.partition as usize] += 1);
        assert!(per_partition[0] >= 2);
        assert!(per_partition[1] >= 2);
        // within each partition order holds
        let mut last = [-1i64; 2];
        fetches.each_record(|r| {
            assert!(r.offset > last[r.partition as usize]);
            last[r.partition as usize] = r.offset;
        });
    }

    #[test]
    fn test_backpressure_sets_and_clears() {
        let pool = BufferPool::new(15);
        pool.ensure("t", 0, 1);
        pool.push_batch("t", 0, 1, batch("t", 0, 0..2), 2); // 20 bytes > 15
        assert!(pool.is_backpressured("t", 0));
        pool.drain_all();
        assert!(!pool.is_backpressured("t", 0));
    }

    #[test]
    fn test_transient_sticky_delivered_once_fatal_repeats() {
        let pool = BufferPool::new(usize::MAX);
        pool.ensure("t", 0, 1);
        pool.set_sticky(
            "t",
            0,
            1,
            ClientError::Partition {
                topic: "t".to_string(),
                partition: 0,
                code: KafkaCode::NotLeaderOrFollower,
            },
            false,
        );
        assert_eq!(count_errors(&pool.drain_all()), 1);
        assert_eq!(count_errors(&pool.drain_all()), 0);

        pool.set_sticky(
            "t",
            0,
            1,
            ClientError::Partition {
                topic: "t".to_string(),
                partition: 0,
                code: KafkaCode::TopicAuthorizationFailed,
            },
            true,
        );
        assert_eq!(count_errors(&pool.drain_all()), 1);
        assert_eq!(count_errors(&pool.drain_all()), 1);
        pool.remove("t", 0);
        assert_eq!(count_errors(&pool.drain_all()), 0);
    }

    #[test]
    fn test_topic_error_slot() {
        let pool = BufferPool::new(usize::MAX);
        pool.set_topic_error(
            "ghost",
            ClientError::Partition {
                topic: "ghost".to_string(),
                partition: -1,
                code: KafkaCode::UnknownTopicOrPartition,
            },
        );
        let fetches = pool.drain_all();
        let mut seen = Vec::new();
        fetches.each_error(|topic, partition, err| {
            seen.push((topic.to_string(), partition, err.is_unknown_topic()));
        });
        assert_eq!(seen, vec![("ghost".to_string(), -1, true)]);
        pool.remove_topic("ghost");
        assert!(!pool.has_data());
    }

    fn count_errors(fetches: &Fetches) -> usize {
        let mut n = 0;
        fetches.each_error(|_, _, _| n += 1);
        n
    }
}
