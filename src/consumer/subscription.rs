//! Subscription state and metadata reconciliation.
//!
//! Translates user intent (topic subscriptions, regex patterns, direct
//! partitions, offset seeds) into assignment-set deltas against each
//! metadata snapshot. Purge, the hardest cross-cutting operation, also
//! lives here: it removes subscription entries, assignment rows, buffered
//! data, and metadata bookkeeping in one pass, relying on assignment
//! generations to drop whatever is still in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info};

use crate::client::ClientCore;
use crate::config::ClientConfig;
use crate::consumer::assignment::{AssignmentSet, OffsetState, TopicPartition};
use crate::consumer::offset::{EpochOffset, Offset, OffsetSpec};
use crate::error::{ClientError, KafkaCode, Result};
use crate::metadata::MetadataSnapshot;

#[derive(Default)]
struct SubscriptionState {
    /// Named topic subscriptions (non-regex).
    topics: HashSet<String>,
    /// Compiled regex patterns, keyed by their source string.
    patterns: Vec<(String, Regex)>,
    /// Topics the patterns matched in the last snapshot.
    last_regex_match: HashSet<String>,
    /// Direct partition subscriptions with their offset specs.
    direct: HashMap<String, HashMap<i32, Offset>>,
    /// Offsets seeded via `set_offsets`, consumed at assignment time.
    seeds: HashMap<TopicPartition, EpochOffset>,
}

pub(crate) struct SubscriptionController {
    state: Mutex<SubscriptionState>,
}

impl SubscriptionController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SubscriptionState::default()),
        }
    }

    /// Unions topics (or, in regex mode, patterns) into the subscription.
    pub fn add_topics(&self, topics: Vec<String>, regex_mode: bool) -> Result<()> {
        let mut state = self.state.lock();
        if regex_mode {
            for topic in topics {
                if state.patterns.iter().any(|(source, _)| source == &topic) {
                    continue;
                }
                let pattern = Regex::new(&topic).map_err(|e| {
                    ClientError::InvalidConfig(format!("invalid topic regex {topic:?}: {e}"))
                })?;
                debug!(pattern = %topic, "subscribing to regex");
                state.patterns.push((topic, pattern));
            }
        } else {
            for topic in topics {
                if state.topics.insert(topic.clone()) {
                    debug!(topic = %topic, "subscribing to topic");
                }
            }
        }
        Ok(())
    }

    pub fn add_partitions(&self, map: HashMap<String, HashMap<i32, Offset>>) {
        let mut state = self.state.lock();
        for (topic, partitions) in map {
            let entry = state.direct.entry(topic).or_default();
            for (partition, offset) in partitions {
                entry.insert(partition, offset);
            }
        }
    }

    /// Removes direct entries and seeds; returns the partitions that
    /// should be unassigned (those not still covered by a topic or regex
    /// subscription).
    pub fn remove_partitions(&self, map: &HashMap<String, Vec<i32>>) -> Vec<TopicPartition> {
        let mut state = self.state.lock();
        let mut to_unassign = Vec::new();
        for (topic, partitions) in map {
            if let Some(entry) = state.direct.get_mut(topic) {
                for partition in partitions {
                    entry.remove(partition);
                }
                if entry.is_empty() {
                    state.direct.remove(topic);
                }
            }
            for partition in partitions {
                state.seeds.remove(&(topic.clone(), *partition));
            }
            let covered =
                state.topics.contains(topic) || state.last_regex_match.contains(topic);
            if !covered {
                for partition in partitions {
                    to_unassign.push((topic.clone(), *partition));
                }
            }
        }
        to_unassign
    }

    /// Stores offset seeds. In direct mode the listed partitions also
    /// become direct subscriptions so a client with no other subscription
    /// starts consuming them once metadata knows the topic.
    pub fn seed_offsets(
        &self,
        map: &HashMap<String, HashMap<i32, EpochOffset>>,
        group_mode: bool,
    ) {
        let mut state = self.state.lock();
        for (topic, partitions) in map {
            for (partition, eo) in partitions {
                state.seeds.insert((topic.clone(), *partition), *eo);
                if !group_mode {
                    state
                        .direct
                        .entry(topic.clone())
                        .or_default()
                        .insert(*partition, Offset::new().at(eo.offset).with_epoch(eo.epoch));
                }
            }
        }
    }

    /// Consumes the seed for a partition, if one is present.
    pub fn take_seed(&self, topic: &str, partition: i32) -> Option<EpochOffset> {
        self.state
            .lock()
            .seeds
            .remove(&(topic.to_string(), partition))
    }

    /// Forgets a topic entirely (purge path).
    pub fn forget_topic(&self, topic: &str) {
        let mut state = self.state.lock();
        state.topics.remove(topic);
        state.direct.remove(topic);
        state.last_regex_match.remove(topic);
        state.seeds.retain(|(t, _), _| t != topic);
    }

    /// The topics the metadata loop should ask about; `None` means all
    /// topics (regex subscriptions need the full universe).
    pub fn metadata_interest(&self, assignment: &AssignmentSet) -> Option<Vec<String>> {
        let state = self.state.lock();
        if !state.patterns.is_empty() {
            return None;
        }
        let mut names: HashSet<String> = state.topics.clone();
        names.extend(state.direct.keys().cloned());
        names.extend(assignment.assigned_topics());
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        Some(names)
    }

    /// Named topics the subscription is waiting on (for missing clocks).
    fn expected_topics(&self) -> HashSet<String> {
        let state = self.state.lock();
        let mut expected = state.topics.clone();
        expected.extend(state.direct.keys().cloned());
        expected
    }

    /// Diffs the regex match set against a snapshot's topic universe.
    fn regex_diff(&self, present: &HashSet<String>) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.lock();
        if state.patterns.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let matches: HashSet<String> = present
            .iter()
            .filter(|t| state.patterns.iter().any(|(_, re)| re.is_match(t)))
            .cloned()
            .collect();
        let added = matches
            .difference(&state.last_regex_match)
            .cloned()
            .collect();
        let removed = state
            .last_regex_match
            .difference(&matches)
            .cloned()
            .collect();
        state.last_regex_match = matches;
        (added, removed)
    }

    /// The full set of partitions the subscription wants, given a
    /// snapshot: all partitions of subscribed and regex-matched topics,
    /// plus the direct entries whose partitions the snapshot knows.
    fn desired_partitions(
        &self,
        snapshot: &MetadataSnapshot,
        config: &ClientConfig,
    ) -> HashMap<TopicPartition, OffsetState> {
        let state = self.state.lock();
        let mut desired = HashMap::new();
        for topic in state.topics.iter().chain(state.last_regex_match.iter()) {
            let Some(meta) = snapshot.topics.get(topic) else {
                continue;
            };
            if meta.error.is_some_and(|c| c.is_unknown_topic()) {
                continue;
            }
            for p in &meta.partitions {
                desired.insert(
                    (topic.clone(), p.partition),
                    OffsetState::Pending(config.auto_offset_reset),
                );
            }
        }
        for (topic, partitions) in &state.direct {
            let Some(meta) = snapshot.topics.get(topic) else {
                continue;
            };
            let known: HashSet<i32> = meta.partitions.iter().map(|p| p.partition).collect();
            for (partition, offset) in partitions {
                if !known.contains(partition) {
                    continue;
                }
                let initial = match offset.spec() {
                    OffsetSpec::At(o) => OffsetState::Resolved {
                        offset: o,
                        epoch: offset.epoch(),
                    },
                    spec => OffsetState::Pending(spec),
                };
                desired.insert((topic.clone(), *partition), initial);
            }
        }
        desired
    }
}

/// Tears down a topic's partitions: assignment rows, buffers, and the
/// sources that owned them. Generation checks drop anything in flight.
pub(crate) fn purge_partitions(core: &Arc<ClientCore>, topic: &str) {
    core.assignment.unassign_topic(topic);
    core.buffers.remove_topic(topic);
    core.sources.wake_all();
}

/// Full purge: subscription entries, partitions, and metadata bookkeeping.
/// After this returns no poll yields records for the topic until it is
/// re-added.
pub(crate) fn purge_topic(core: &Arc<ClientCore>, topic: &str) {
    core.subscription.forget_topic(topic);
    purge_partitions(core, topic);
    core.metadata.forget_topic(topic);
}

/// Applies one metadata snapshot: regex diffs, missing-topic clocks,
/// assignment deltas, leader updates, and source reconciliation.
pub(crate) fn reconcile(core: &Arc<ClientCore>, snapshot: &Arc<MetadataSnapshot>) {
    let config = &core.config;
    let group_mode = core.group.is_some();

    // Topics this load actually knew. A topic answered with an
    // unknown-topic error counts as absent.
    let present: HashSet<String> = snapshot
        .topics
        .iter()
        .filter(|(_, meta)| !meta.error.is_some_and(|c| c.is_unknown_topic()))
        .map(|(name, _)| name.clone())
        .collect();

    let (added, removed) = core.subscription.regex_diff(&present);
    for topic in &removed {
        info!(topic = %topic, "regex-matched topic gone from metadata, purging");
        purge_partitions(core, topic);
    }
    for topic in &added {
        debug!(topic = %topic, "regex matched new topic");
    }

    let expected = core.subscription.expected_topics();
    let deleted = core.metadata.track_missing(&expected, &present, config);
    for topic in &deleted {
        info!(topic = %topic, "subscribed topic missing too long, purging");
        purge_topic(core, topic);
    }

    // Surface (or clear) topic-level unknown errors for named topics.
    for topic in &expected {
        if deleted.contains(topic) {
            continue;
        }
        if present.contains(topic) {
            core.buffers.remove(topic, -1);
        } else if config.keep_retryable_fetch_errors {
            core.buffers.set_topic_error(
                topic,
                ClientError::Partition {
                    topic: topic.clone(),
                    partition: -1,
                    code: KafkaCode::UnknownTopicOrPartition,
                },
            );
        }
    }

    if !group_mode {
        let desired = core.subscription.desired_partitions(snapshot, config);
        for ((topic, partition), initial) in &desired {
            if core.assignment.is_assigned(topic, *partition) {
                continue;
            }
            let initial = match core.subscription.take_seed(topic, *partition) {
                Some(seed) => OffsetState::Resolved {
                    offset: seed.offset,
                    epoch: seed.epoch,
                },
                None => *initial,
            };
            if let Some(gen) = core.assignment.assign(topic, *partition, initial) {
                core.buffers.ensure(topic, *partition, gen);
            }
        }
        // Unassign rows that are no longer wanted. A partition whose topic
        // merely vanished from this load is kept; the missing clock owns
        // that decision.
        let still_expected = {
            let mut s = expected.clone();
            let state = core.subscription.state.lock();
            s.extend(state.last_regex_match.iter().cloned());
            s
        };
        for (topic, partition) in core.assignment.assigned_partitions() {
            if desired.contains_key(&(topic.clone(), partition)) {
                continue;
            }
            if present.contains(&topic) || !still_expected.contains(&topic) {
                let _ = core.assignment.unassign(&topic, partition);
                core.buffers.remove(&topic, partition);
            }
        }
    }

    // Adopt leaders from the snapshot for every assigned partition.
    for (topic, partition) in core.assignment.assigned_partitions() {
        let Some(meta) = snapshot.topics.get(&topic) else {
            continue;
        };
        let Some(p) = meta.partitions.iter().find(|p| p.partition == partition) else {
            continue;
        };
        let leader = (p.leader >= 0).then_some(p.leader);
        core.assignment
            .set_leader(&topic, partition, leader, p.leader_epoch);
    }

    core.sources
        .sync(core, &core.assignment.brokers_with_assignments());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_topics_dedupes() {
        let sub = SubscriptionController::new();
        sub.add_topics(vec!["a".into(), "b".into()], false).unwrap();
        sub.add_topics(vec!["a".into()], false).unwrap();
        assert_eq!(sub.expected_topics().len(), 2);
    }

    #[test]
    fn test_add_topics_rejects_bad_regex() {
        let sub = SubscriptionController::new();
        let err = sub.add_topics(vec!["(unclosed".into()], true).unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_regex_diff_tracks_matches() {
        let sub = SubscriptionController::new();
        sub.add_topics(vec!["(x|y)".into()], true).unwrap();

        let present: HashSet<String> = ["x".to_string(), "z".to_string()].into();
        let (added, removed) = sub.regex_diff(&present);
        assert_eq!(added, vec!["x".to_string()]);
        assert!(removed.is_empty());

        let present: HashSet<String> = ["y".to_string(), "z".to_string()].into();
        let (added, removed) = sub.regex_diff(&present);
        assert_eq!(added, vec!["y".to_string()]);
        assert_eq!(removed, vec!["x".to_string()]);
    }

    #[test]
    fn test_remove_partitions_is_tolerant() {
        let sub = SubscriptionController::new();
        sub.add_partitions(HashMap::from([(
            "t".to_string(),
            HashMap::from([(0, Offset::new().at(0))]),
        )]));

        let removal = HashMap::from([
            ("t".to_string(), vec![0, 1, 2]),
            ("never-subscribed".to_string(), vec![0]),
        ]);
        let to_unassign = sub.remove_partitions(&removal);
        // everything listed is fair game to unassign; unknown entries are
        // no-ops downstream
        assert!(to_unassign.contains(&("t".to_string(), 0)));
        assert!(sub.expected_topics().is_empty());
    }

    #[test]
    fn test_seed_offsets_direct_mode_subscribes() {
        let sub = SubscriptionController::new();
        let map = HashMap::from([(
            "t".to_string(),
            HashMap::from([(0, EpochOffset { epoch: -1, offset: 1 })]),
        )]);
        sub.seed_offsets(&map, false);
        assert!(sub.expected_topics().contains("t"));
        assert_eq!(
            sub.take_seed("t", 0),
            Some(EpochOffset { epoch: -1, offset: 1 })
        );
        // consumed
        assert_eq!(sub.take_seed("t", 0), None);
    }

    #[test]
    fn test_seed_offsets_group_mode_only_seeds() {
        let sub = SubscriptionController::new();
        let map = HashMap::from([(
            "t".to_string(),
            HashMap::from([(0, EpochOffset { epoch: 3, offset: 9 })]),
        )]);
        sub.seed_offsets(&map, true);
        assert!(sub.expected_topics().is_empty());
        assert_eq!(
            sub.take_seed("t", 0),
            Some(EpochOffset { epoch: 3, offset: 9 })
        );
    }

    #[test]
    fn test_metadata_interest_regex_wants_everything() {
        let sub = SubscriptionController::new();
        let assignment = AssignmentSet::new();
        assert_eq!(sub.metadata_interest(&assignment), Some(Vec::new()));
        sub.add_topics(vec!["t1".into()], false).unwrap();
        assert_eq!(
            sub.metadata_interest(&assignment),
            Some(vec!["t1".to_string()])
        );
        sub.add_topics(vec![".*".into()], true).unwrap();
        assert_eq!(sub.metadata_interest(&assignment), None);
    }
}
