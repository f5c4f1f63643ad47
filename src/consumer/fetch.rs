//! The per-broker fetch scheduler.
//!
//! One `run_fetch_loop` task runs per broker source. Each turn the task
//! waits on its mailbox (or the fetch-max-wait ceiling), resolves any
//! pending offsets via ListOffsets, builds one fetch request from the
//! partitions it owns, issues it, and applies the response. At most one
//! fetch is ever in flight per broker because the task awaits its own RPC;
//! assignments changed mid-flight are simply picked up next turn.
//!
//! Response application is gated on assignment generations so results that
//! raced an unassign, purge, or re-seek are dropped instead of delivered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::{FetchRequest, FetchResponse, ListOffsetsRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::config::ClientConfig;
use crate::consumer::assignment::{FetchPlanEntry, PendingOffset};
use crate::consumer::buffer::BufferedBatch;
use crate::consumer::fetches::{Header, Record};
use crate::consumer::offset::OffsetSpec;
use crate::consumer::source::SourceEvent;
use crate::error::{ClientError, KafkaCode, Result};

/// ListOffsets sentinel timestamps.
const LIST_OFFSETS_EARLIEST: i64 = -2;
const LIST_OFFSETS_LATEST: i64 = -1;

/// Turns a source may spend owning nothing before its task exits.
const SOURCE_IDLE_GRACE_TURNS: u32 = 2;

/// Broker-side fetch session state. The session is used so brokers can
/// deduplicate partition state server-side; requests always carry the full
/// eligible partition set, so a purged topic vanishes from the very next
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchSession {
    pub id: i32,
    pub epoch: i32,
}

impl FetchSession {
    pub fn new() -> Self {
        Self { id: 0, epoch: 0 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Adopts the broker-issued session id and advances the epoch for the
    /// next request. Epochs wrap back to 1, never to 0 (0 requests a new
    /// session).
    pub fn observe(&mut self, session_id: i32) {
        if session_id == self.id {
            if self.id != 0 {
                self.epoch = self.epoch.wrapping_add(1).max(1);
            }
        } else if session_id == 0 {
            self.reset();
        } else {
            self.id = session_id;
            self.epoch = 1;
        }
    }
}

/// The scheduler loop for one broker source.
pub(crate) async fn run_fetch_loop(
    core: Arc<ClientCore>,
    broker: i32,
    mut mailbox: mpsc::UnboundedReceiver<SourceEvent>,
) {
    debug!(broker, "broker source starting");
    let mut session = FetchSession::new();
    let mut idle_turns = 0u32;
    loop {
        tokio::select! {
            event = mailbox.recv() => {
                match event {
                    None => break,
                    Some(SourceEvent::Wake) => {
                        // collapse a burst of wakes into one turn
                        while mailbox.try_recv().is_ok() {}
                    }
                }
            }
            _ = tokio::time::sleep(core.config.fetch_max_wait) => {}
        }
        if core.is_closed() {
            break;
        }

        resolve_pending_offsets(&core, broker).await;

        let plan = core.assignment.fetch_plan(broker, &core.buffers);
        if plan.is_empty() {
            if core.assignment.broker_has_partitions(broker) {
                // owned but paused, backpressured, or still resolving
                idle_turns = 0;
            } else {
                idle_turns += 1;
                if idle_turns > SOURCE_IDLE_GRACE_TURNS {
                    debug!(broker, "broker source idle, exiting");
                    break;
                }
            }
            continue;
        }
        idle_turns = 0;

        let request = build_fetch_request(&core.config, &session, &plan);
        match core.transport.fetch(broker, request).await {
            Ok(response) => apply_fetch_response(&core, broker, &mut session, &plan, response),
            Err(err) => {
                warn!(broker, error = %err, "fetch request failed");
                session.reset();
                core.metadata.request_refresh();
                tokio::time::sleep(backoff_with_jitter(core.config.retry_backoff)).await;
            }
        }
    }
    debug!(broker, "broker source exited");
}

/// Resolves offsets for owned partitions still pending resolution.
/// Explicit `At` specs install directly; the rest go through ListOffsets.
async fn resolve_pending_offsets(core: &Arc<ClientCore>, broker: i32) {
    let mut pending = core.assignment.pending_for_broker(broker);
    pending.retain(|entry| match entry.spec {
        OffsetSpec::At(offset) => {
            core.assignment
                .install_offset(&entry.topic, entry.partition, entry.gen, offset, -1);
            false
        }
        _ => true,
    });
    if pending.is_empty() {
        return;
    }

    let request = build_list_offsets_request(&pending);
    let response = match core.transport.list_offsets(broker, request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(broker, error = %err, "list offsets failed");
            core.metadata.request_refresh();
            return;
        }
    };

    for topic_response in &response.topics {
        let topic = topic_response.name.as_str();
        for p in &topic_response.partitions {
            let Some(entry) = pending
                .iter()
                .find(|e| e.topic == topic && e.partition == p.partition_index)
            else {
                continue;
            };
            match KafkaCode::from_code(p.error_code) {
                None => {
                    if p.offset < 0 {
                        // no offset for the requested timestamp; fall back
                        // to the log end
                        if let Some(gen) = core.assignment.reseek(
                            &entry.topic,
                            entry.partition,
                            entry.gen,
                            OffsetSpec::Latest,
                        ) {
                            core.buffers.ensure(&entry.topic, entry.partition, gen);
                        }
                    } else {
                        core.assignment.install_offset(
                            &entry.topic,
                            entry.partition,
                            entry.gen,
                            p.offset,
                            p.leader_epoch,
                        );
                    }
                }
                Some(code) if code.is_unknown_topic() => {
                    core.metadata.note_fetch_missing(topic);
                    core.metadata.request_refresh();
                }
                Some(code) if code.is_retriable() => {
                    debug!(topic, partition = p.partition_index, %code, "offset resolution retrying");
                    core.metadata.request_refresh();
                }
                Some(code) => {
                    warn!(topic, partition = p.partition_index, %code, "offset resolution failed");
                    core.buffers.set_sticky(
                        &entry.topic,
                        entry.partition,
                        entry.gen,
                        ClientError::Partition {
                            topic: entry.topic.clone(),
                            partition: entry.partition,
                            code,
                        },
                        true,
                    );
                }
            }
        }
    }
}

fn build_list_offsets_request(pending: &[PendingOffset]) -> ListOffsetsRequest {
    use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};

    let mut by_topic: BTreeMap<&str, Vec<&PendingOffset>> = BTreeMap::new();
    for entry in pending {
        by_topic.entry(&entry.topic).or_default().push(entry);
    }
    let topics = by_topic
        .into_iter()
        .map(|(topic, entries)| {
            ListOffsetsTopic::default()
                .with_name(TopicName(StrBytes::from_string(topic.to_string())))
                .with_partitions(
                    entries
                        .iter()
                        .map(|e| {
                            ListOffsetsPartition::default()
                                .with_partition_index(e.partition)
                                .with_current_leader_epoch(e.leader_epoch)
                                .with_timestamp(list_offsets_timestamp(e.spec))
                        })
                        .collect(),
                )
        })
        .collect();
    ListOffsetsRequest::default().with_topics(topics)
}

fn list_offsets_timestamp(spec: OffsetSpec) -> i64 {
    match spec {
        OffsetSpec::Earliest => LIST_OFFSETS_EARLIEST,
        OffsetSpec::Latest => LIST_OFFSETS_LATEST,
        OffsetSpec::AfterMillis(millis) => millis,
        // `At` never reaches ListOffsets; it installs directly
        OffsetSpec::At(_) => LIST_OFFSETS_EARLIEST,
    }
}

/// Builds one fetch round from the plan. Partitions are grouped per topic
/// in lexicographic order for request determinism.
pub(crate) fn build_fetch_request(
    config: &ClientConfig,
    session: &FetchSession,
    plan: &[FetchPlanEntry],
) -> FetchRequest {
    use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};

    let mut by_topic: BTreeMap<&str, Vec<&FetchPlanEntry>> = BTreeMap::new();
    for entry in plan {
        by_topic.entry(&entry.topic).or_default().push(entry);
    }
    let topics = by_topic
        .into_iter()
        .map(|(topic, entries)| {
            FetchTopic::default()
                .with_topic(TopicName(StrBytes::from_string(topic.to_string())))
                .with_partitions(
                    entries
                        .iter()
                        .map(|e| {
                            FetchPartition::default()
                                .with_partition(e.partition)
                                .with_current_leader_epoch(e.leader_epoch)
                                .with_fetch_offset(e.fetch_offset)
                                .with_log_start_offset(-1)
                                .with_partition_max_bytes(config.fetch_max_partition_bytes)
                        })
                        .collect(),
                )
        })
        .collect();

    FetchRequest::default()
        .with_max_wait_ms(config.fetch_max_wait.as_millis() as i32)
        .with_min_bytes(config.fetch_min_bytes)
        .with_max_bytes(config.fetch_max_bytes)
        .with_isolation_level(0)
        .with_session_id(session.id)
        .with_session_epoch(session.epoch)
        .with_topics(topics)
}

fn apply_fetch_response(
    core: &Arc<ClientCore>,
    broker: i32,
    session: &mut FetchSession,
    plan: &[FetchPlanEntry],
    response: FetchResponse,
) {
    if let Some(code) = KafkaCode::from_code(response.error_code) {
        if code.is_session_error() {
            debug!(broker, %code, "broker dropped our fetch session");
        } else {
            warn!(broker, %code, "fetch-level error");
            core.metadata.request_refresh();
        }
        session.reset();
        return;
    }
    session.observe(response.session_id);

    for topic_response in &response.responses {
        let topic = topic_response.topic.as_str();
        for p in &topic_response.partitions {
            let Some(entry) = plan
                .iter()
                .find(|e| e.topic == topic && e.partition == p.partition_index)
            else {
                // stale partition from a previous session epoch
                continue;
            };
            match KafkaCode::from_code(p.error_code) {
                None => apply_partition_data(
                    core,
                    entry,
                    p.high_watermark,
                    p.last_stable_offset,
                    p.records.clone(),
                ),
                Some(code) => handle_partition_error(core, session, entry, code),
            }
        }
    }
}

fn apply_partition_data(
    core: &Arc<ClientCore>,
    entry: &FetchPlanEntry,
    high_watermark: i64,
    last_stable_offset: i64,
    records: Option<Bytes>,
) {
    core.metadata.clear_fetch_strikes(&entry.topic);

    let batch_bytes = records.unwrap_or_default();
    let records = if batch_bytes.is_empty() {
        Vec::new()
    } else {
        match decode_batch(&entry.topic, entry.partition, entry.fetch_offset, batch_bytes.clone()) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    topic = %entry.topic,
                    partition = entry.partition,
                    error = %err,
                    "dropping undecodable fetch data"
                );
                core.buffers
                    .set_sticky(&entry.topic, entry.partition, entry.gen, err, false);
                return;
            }
        }
    };

    let Some(last) = records.last() else {
        core.assignment.update_watermarks(
            &entry.topic,
            entry.partition,
            entry.gen,
            high_watermark,
            last_stable_offset,
        );
        return;
    };
    let next_offset = last.offset + 1;

    if core.assignment.advance(
        &entry.topic,
        entry.partition,
        entry.gen,
        next_offset,
        high_watermark,
        last_stable_offset,
    ) {
        core.buffers.push_batch(
            &entry.topic,
            entry.partition,
            entry.gen,
            BufferedBatch {
                records,
                bytes: batch_bytes.len(),
            },
            high_watermark,
        );
    }
}

fn handle_partition_error(
    core: &Arc<ClientCore>,
    session: &mut FetchSession,
    entry: &FetchPlanEntry,
    code: KafkaCode,
) {
    let topic = entry.topic.as_str();
    let partition = entry.partition;
    let error = ClientError::Partition {
        topic: entry.topic.clone(),
        partition,
        code,
    };

    if code.is_session_error() {
        debug!(topic, partition, %code, "fetch session invalidated");
        session.reset();
        return;
    }

    if code.is_unknown_topic() {
        let strikes = core.metadata.note_fetch_missing(topic);
        debug!(topic, partition, strikes, %code, "fetch hit unknown topic");
        core.metadata.request_refresh();
        if core.config.keep_retryable_fetch_errors {
            core.buffers
                .set_sticky(topic, partition, entry.gen, error, false);
        }
        return;
    }

    if code == KafkaCode::OffsetOutOfRange {
        warn!(
            topic,
            partition,
            offset = entry.fetch_offset,
            "fetch offset out of range, re-seeking"
        );
        if let Some(gen) =
            core.assignment
                .reseek(topic, partition, entry.gen, core.config.auto_offset_reset)
        {
            core.buffers.ensure(topic, partition, gen);
            if core.config.keep_retryable_fetch_errors {
                core.buffers.set_sticky(topic, partition, gen, error, false);
            }
        }
        return;
    }

    if code.is_retriable() {
        // covers leader movement and epoch fencing; fresh metadata adopts
        // the broker's epoch, including the epoch-unknown (-1) case
        debug!(topic, partition, %code, "retryable fetch error, refreshing metadata");
        core.metadata.request_refresh();
        if core.config.keep_retryable_fetch_errors {
            core.buffers
                .set_sticky(topic, partition, entry.gen, error, false);
        }
        return;
    }

    warn!(topic, partition, %code, "fetch failed authoritatively");
    core.buffers
        .set_sticky(topic, partition, entry.gen, error, true);
}

/// Decodes one partition's batch bytes, dropping records below the
/// requested offset (batches may replay earlier offsets after compaction).
fn decode_batch(
    topic: &str,
    partition: i32,
    min_offset: i64,
    mut data: Bytes,
) -> Result<Vec<Record>> {
    use kafka_protocol::records::RecordBatchDecoder;

    let decoded = RecordBatchDecoder::decode(&mut data).map_err(|e| {
        ClientError::protocol(format!(
            "record batch for {topic}[{partition}] failed to decode: {e}"
        ))
    })?;

    let mut records = Vec::with_capacity(decoded.len());
    for rec in decoded {
        if rec.offset < min_offset {
            continue;
        }
        records.push(Record {
            topic: topic.to_string(),
            partition,
            offset: rec.offset,
            leader_epoch: rec.partition_leader_epoch,
            timestamp: rec.timestamp,
            key: rec.key,
            value: rec.value,
            headers: rec
                .headers
                .into_iter()
                .map(|(key, value)| Header {
                    key: key.to_string(),
                    value,
                })
                .collect(),
        });
    }
    Ok(records)
}

fn backoff_with_jitter(base: Duration) -> Duration {
    let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    base + Duration::from_millis(jitter)
}
