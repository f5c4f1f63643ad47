//! The authoritative set of partitions being consumed.
//!
//! Every partition the client consumes has exactly one row here. Rows carry
//! the fetch position, the leader as of the last metadata snapshot, the
//! pause bit, and an assignment generation. Mutations serialize through a
//! single critical section; readers get consistent snapshots.
//!
//! The generation is how in-flight races stay safe: fetch plans capture the
//! generation at planning time, and results only apply while it still
//! matches. Unassign, purge, and re-seek all bump or drop the generation,
//! so late responses for a partition that was removed (or re-added) are
//! discarded instead of delivered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::consumer::buffer::BufferPool;
use crate::consumer::offset::OffsetSpec;

/// Partitions are keyed by `(topic, partition)` everywhere; broker sources
/// hold only ids and look rows up here.
pub(crate) type TopicPartition = (String, i32);

/// The fetch position of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OffsetState {
    /// Assigned but not yet resolved to a concrete offset; resolved via
    /// ListOffsets (or a committed offset) before the first fetch.
    Pending(OffsetSpec),
    /// Ready to fetch from `offset` with `epoch` (`-1` = no epoch known).
    Resolved { offset: i64, epoch: i32 },
}

#[derive(Debug, Clone)]
pub(crate) struct PartitionState {
    pub gen: u64,
    pub offset: OffsetState,
    /// Leader broker as of the last snapshot; `None` parks the partition.
    pub leader: Option<i32>,
    /// Leader epoch; never moves backward across snapshots.
    pub leader_epoch: i32,
    pub paused: bool,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
}

/// One partition's entry in a broker's fetch plan, captured under the lock
/// at planning time.
#[derive(Debug, Clone)]
pub(crate) struct FetchPlanEntry {
    pub topic: String,
    pub partition: i32,
    pub gen: u64,
    pub fetch_offset: i64,
    /// Current leader epoch to send on the fetch; `-1` = no epoch known.
    pub leader_epoch: i32,
}

/// One partition's consumption progress, for lag monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionProgress {
    pub topic: String,
    pub partition: i32,
    /// Next offset to fetch; `None` while offset resolution is pending.
    pub next_offset: Option<i64>,
    /// Broker high watermark as of the last fetch; `-1` before any fetch.
    pub high_watermark: i64,
    /// Last stable offset as of the last fetch; `-1` before any fetch.
    pub last_stable_offset: i64,
    /// Records between the fetch position and the high watermark; `-1`
    /// while either side is unknown.
    pub lag: i64,
    pub paused: bool,
}

/// A partition awaiting offset resolution on a broker.
#[derive(Debug, Clone)]
pub(crate) struct PendingOffset {
    pub topic: String,
    pub partition: i32,
    pub gen: u64,
    pub spec: OffsetSpec,
    pub leader_epoch: i32,
}

pub(crate) struct AssignmentSet {
    partitions: RwLock<HashMap<TopicPartition, PartitionState>>,
    paused_topics: RwLock<HashSet<String>>,
    generation: AtomicU64,
}

impl AssignmentSet {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            paused_topics: RwLock::new(HashSet::new()),
            generation: AtomicU64::new(1),
        }
    }

    fn next_gen(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a partition if absent. Returns the row's generation, or `None`
    /// if it was already assigned (assignment is idempotent).
    pub fn assign(&self, topic: &str, partition: i32, offset: OffsetState) -> Option<u64> {
        let mut partitions = self.partitions.write();
        let key = (topic.to_string(), partition);
        if partitions.contains_key(&key) {
            return None;
        }
        let gen = self.next_gen();
        debug!(topic, partition, gen, ?offset, "assigning partition");
        partitions.insert(
            key,
            PartitionState {
                gen,
                offset,
                leader: None,
                leader_epoch: -1,
                paused: false,
                high_watermark: -1,
                last_stable_offset: -1,
            },
        );
        Some(gen)
    }

    /// Removes a partition; tolerates partitions that were never assigned.
    pub fn unassign(&self, topic: &str, partition: i32) -> Option<u64> {
        let removed = self
            .partitions
            .write()
            .remove(&(topic.to_string(), partition));
        if let Some(state) = &removed {
            debug!(topic, partition, gen = state.gen, "unassigned partition");
        }
        removed.map(|s| s.gen)
    }

    /// Removes every partition of a topic; returns the removed keys.
    pub fn unassign_topic(&self, topic: &str) -> Vec<TopicPartition> {
        let mut partitions = self.partitions.write();
        let keys: Vec<TopicPartition> = partitions
            .keys()
            .filter(|(t, _)| t == topic)
            .cloned()
            .collect();
        for key in &keys {
            partitions.remove(key);
        }
        if !keys.is_empty() {
            debug!(topic, removed = keys.len(), "unassigned topic");
        }
        keys
    }

    pub fn is_assigned(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .read()
            .contains_key(&(topic.to_string(), partition))
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.partitions.read().keys().cloned().collect()
    }

    pub fn assigned_topics(&self) -> HashSet<String> {
        self.partitions
            .read()
            .keys()
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Partition-level pause bits; unknown partitions are ignored.
    pub fn pause_partitions<'a>(&self, keys: impl IntoIterator<Item = (&'a str, i32)>) {
        let mut partitions = self.partitions.write();
        for (topic, partition) in keys {
            if let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) {
                state.paused = true;
            }
        }
    }

    pub fn resume_partitions<'a>(&self, keys: impl IntoIterator<Item = (&'a str, i32)>) {
        let mut partitions = self.partitions.write();
        for (topic, partition) in keys {
            if let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) {
                state.paused = false;
            }
        }
    }

    /// Topic-level pause set; applies to partitions assigned later too.
    pub fn pause_topics<'a>(&self, topics: impl IntoIterator<Item = &'a str>) {
        let mut paused = self.paused_topics.write();
        for topic in topics {
            paused.insert(topic.to_string());
        }
    }

    pub fn resume_topics<'a>(&self, topics: impl IntoIterator<Item = &'a str>) {
        let mut paused = self.paused_topics.write();
        for topic in topics {
            paused.remove(topic);
        }
    }

    /// Adopts a leader from a metadata snapshot. Epochs never move
    /// backward; a regression means the snapshot is stale and is ignored.
    pub fn set_leader(&self, topic: &str, partition: i32, leader: Option<i32>, epoch: i32) {
        let mut partitions = self.partitions.write();
        let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) else {
            return;
        };
        if epoch >= 0 && epoch < state.leader_epoch {
            debug!(
                topic,
                partition,
                snapshot_epoch = epoch,
                current_epoch = state.leader_epoch,
                "ignoring stale leader epoch"
            );
            return;
        }
        if state.leader != leader {
            debug!(topic, partition, ?leader, epoch, "partition leader changed");
        }
        state.leader = leader;
        if epoch >= 0 {
            state.leader_epoch = epoch;
        }
    }

    /// Installs a resolved offset for a still-pending row of the same
    /// generation.
    pub fn install_offset(&self, topic: &str, partition: i32, gen: u64, offset: i64, epoch: i32) -> bool {
        let mut partitions = self.partitions.write();
        let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) else {
            return false;
        };
        if state.gen != gen || !matches!(state.offset, OffsetState::Pending(_)) {
            return false;
        }
        debug!(topic, partition, offset, epoch, "resolved fetch offset");
        state.offset = OffsetState::Resolved { offset, epoch };
        true
    }

    /// Forces a concrete offset, bumping the generation so in-flight
    /// results for the old position are dropped. Returns the new
    /// generation.
    pub fn force_offset(&self, topic: &str, partition: i32, offset: i64, epoch: i32) -> Option<u64> {
        let mut partitions = self.partitions.write();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;
        let gen = self.next_gen();
        debug!(topic, partition, offset, epoch, gen, "forcing fetch offset");
        state.gen = gen;
        state.offset = OffsetState::Resolved { offset, epoch };
        Some(gen)
    }

    /// Sends the partition back to offset resolution with `spec`, bumping
    /// the generation (used for out-of-range re-seeks). Returns the new
    /// generation.
    pub fn reseek(&self, topic: &str, partition: i32, gen: u64, spec: OffsetSpec) -> Option<u64> {
        let mut partitions = self.partitions.write();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;
        if state.gen != gen {
            return None;
        }
        let new_gen = self.next_gen();
        debug!(topic, partition, ?spec, gen = new_gen, "re-seeking partition");
        state.gen = new_gen;
        state.offset = OffsetState::Pending(spec);
        Some(new_gen)
    }

    /// Advances the fetch position after a successful fetch; a no-op if the
    /// row changed generation while the fetch was in flight.
    pub fn advance(
        &self,
        topic: &str,
        partition: i32,
        gen: u64,
        next_offset: i64,
        high_watermark: i64,
        last_stable_offset: i64,
    ) -> bool {
        let mut partitions = self.partitions.write();
        let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) else {
            return false;
        };
        if state.gen != gen {
            return false;
        }
        if let OffsetState::Resolved { offset, epoch } = state.offset {
            if next_offset > offset {
                state.offset = OffsetState::Resolved {
                    offset: next_offset,
                    epoch,
                };
            }
        }
        state.high_watermark = high_watermark;
        state.last_stable_offset = last_stable_offset;
        true
    }

    /// Records watermarks from an empty fetch.
    pub fn update_watermarks(
        &self,
        topic: &str,
        partition: i32,
        gen: u64,
        high_watermark: i64,
        last_stable_offset: i64,
    ) {
        let mut partitions = self.partitions.write();
        if let Some(state) = partitions.get_mut(&(topic.to_string(), partition)) {
            if state.gen == gen {
                state.high_watermark = high_watermark;
                state.last_stable_offset = last_stable_offset;
            }
        }
    }

    /// Brokers that currently lead at least one assigned partition.
    pub fn brokers_with_assignments(&self) -> HashSet<i32> {
        self.partitions
            .read()
            .values()
            .filter_map(|s| s.leader)
            .collect()
    }

    pub fn broker_has_partitions(&self, broker: i32) -> bool {
        self.partitions
            .read()
            .values()
            .any(|s| s.leader == Some(broker))
    }

    /// Partitions on `broker` still awaiting offset resolution.
    pub fn pending_for_broker(&self, broker: i32) -> Vec<PendingOffset> {
        self.partitions
            .read()
            .iter()
            .filter_map(|((topic, partition), state)| match state.offset {
                OffsetState::Pending(spec) if state.leader == Some(broker) => Some(PendingOffset {
                    topic: topic.clone(),
                    partition: *partition,
                    gen: state.gen,
                    spec,
                    leader_epoch: state.leader_epoch,
                }),
                _ => None,
            })
            .collect()
    }

    /// The partitions `broker` should fetch this round: owned, offset
    /// resolved, and not excluded. The exclude bit is the OR of the user
    /// partition pause, the topic pause, and buffer backpressure.
    pub fn fetch_plan(&self, broker: i32, buffers: &BufferPool) -> Vec<FetchPlanEntry> {
        let paused_topics = self.paused_topics.read();
        let partitions = self.partitions.read();
        let mut plan = Vec::new();
        for ((topic, partition), state) in partitions.iter() {
            if state.leader != Some(broker) {
                continue;
            }
            let OffsetState::Resolved { offset, .. } = state.offset else {
                continue;
            };
            let excluded = state.paused
                || paused_topics.contains(topic)
                || buffers.is_backpressured(topic, *partition);
            if excluded {
                continue;
            }
            plan.push(FetchPlanEntry {
                topic: topic.clone(),
                partition: *partition,
                gen: state.gen,
                fetch_offset: offset,
                leader_epoch: state.leader_epoch,
            });
        }
        plan.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        plan
    }

    /// Consumption progress for every assigned partition, sorted by
    /// `(topic, partition)`.
    pub fn progress(&self) -> Vec<PartitionProgress> {
        let paused_topics = self.paused_topics.read();
        let partitions = self.partitions.read();
        let mut progress: Vec<PartitionProgress> = partitions
            .iter()
            .map(|((topic, partition), state)| {
                let next_offset = match state.offset {
                    OffsetState::Resolved { offset, .. } => Some(offset),
                    OffsetState::Pending(_) => None,
                };
                let lag = match next_offset {
                    Some(offset) if state.high_watermark >= 0 => {
                        (state.high_watermark - offset).max(0)
                    }
                    _ => -1,
                };
                PartitionProgress {
                    topic: topic.clone(),
                    partition: *partition,
                    next_offset,
                    high_watermark: state.high_watermark,
                    last_stable_offset: state.last_stable_offset,
                    lag,
                    paused: state.paused || paused_topics.contains(topic),
                }
            })
            .collect();
        progress.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        progress
    }

    #[cfg(test)]
    pub fn state(&self, topic: &str, partition: i32) -> Option<PartitionState> {
        self.partitions
            .read()
            .get(&(topic.to_string(), partition))
            .cloned()
    }
}
