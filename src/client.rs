//! The public client surface.
//!
//! [`Client`] owns the background machinery: the metadata loop, one fetch
//! task per broker source, and (in group mode) the group loop. All
//! subscription edits are safe to call from any task at any time; they are
//! observed by the schedulers at their next turn, in program order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::consumer::assignment::AssignmentSet;
use crate::consumer::buffer::BufferPool;
use crate::consumer::fetches::Fetches;
use crate::consumer::offset::{EpochOffset, Offset};
use crate::consumer::source::SourceManager;
use crate::consumer::subscription::{self, SubscriptionController};
use crate::error::{ClientError, Result};
use crate::group::GroupCoordinator;
use crate::metadata::MetadataCache;
use crate::transport::Transport;

/// Shared state behind every background task.
pub(crate) struct ClientCore {
    pub config: ClientConfig,
    pub transport: Arc<dyn Transport>,
    pub metadata: MetadataCache,
    pub subscription: SubscriptionController,
    pub assignment: AssignmentSet,
    pub buffers: BufferPool,
    pub sources: SourceManager,
    pub group: Option<Arc<dyn GroupCoordinator>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl ClientCore {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_signal(&self) -> &Notify {
        &self.close_notify
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        self.metadata.request_refresh();
        self.sources.shutdown();
        self.buffers.notify_all();
    }
}

/// A Kafka consumer client.
///
/// Construction spawns the background tasks, so a tokio runtime must be
/// current. The client is cheap to share behind an `Arc`; every method
/// takes `&self`.
pub struct Client {
    core: Arc<ClientCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// A direct-mode client: the caller controls the assignment through
    /// `add_consume_topics` / `add_consume_partitions` / `set_offsets`.
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Client {
        Self::build(config, transport, None)
    }

    /// A group-mode client: assignment changes flow from the coordinator;
    /// `config.consumer_group` names the group.
    pub fn with_group(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        coordinator: Arc<dyn GroupCoordinator>,
    ) -> Result<Client> {
        if config.consumer_group.is_none() {
            return Err(ClientError::InvalidConfig(
                "group mode requires consumer_group to be set".to_string(),
            ));
        }
        Ok(Self::build(config, transport, Some(coordinator)))
    }

    fn build(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        group: Option<Arc<dyn GroupCoordinator>>,
    ) -> Client {
        let buffered_limit = config.buffered_partition_max_bytes;
        let core = Arc::new(ClientCore {
            config,
            transport,
            metadata: MetadataCache::new(),
            subscription: SubscriptionController::new(),
            assignment: AssignmentSet::new(),
            buffers: BufferPool::new(buffered_limit),
            sources: SourceManager::new(),
            group,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        let mut tasks = vec![tokio::spawn(crate::metadata::run_metadata_loop(
            core.clone(),
        ))];
        if core.group.is_some() {
            tasks.push(tokio::spawn(crate::group::run_group_loop(core.clone())));
        }
        debug!(
            group = core.config.consumer_group.as_deref().unwrap_or(""),
            "client started"
        );
        Client {
            core,
            tasks: Mutex::new(tasks),
        }
    }

    /// Unions topics into the subscription. With `consume_regex` set, each
    /// entry is a pattern matched against the broker's topic universe.
    pub fn add_consume_topics<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Ok(());
        }
        self.core
            .subscription
            .add_topics(topics, self.core.config.consume_regex)?;
        self.reconcile_now();
        Ok(())
    }

    /// Direct-mode precise add: consume exactly the listed partitions at
    /// the given offset specs.
    pub fn add_consume_partitions(&self, map: HashMap<String, HashMap<i32, Offset>>) {
        if map.is_empty() {
            return;
        }
        self.core.subscription.add_partitions(map);
        self.reconcile_now();
    }

    /// Stops consuming the listed partitions. Partitions (or whole topics)
    /// that were never assigned are ignored.
    pub fn remove_consume_partitions(&self, map: HashMap<String, Vec<i32>>) {
        let to_unassign = self.core.subscription.remove_partitions(&map);
        for (topic, partition) in to_unassign {
            let _ = self.core.assignment.unassign(&topic, partition);
            self.core.buffers.remove(&topic, partition);
        }
        self.core.sources.wake_all();
    }

    /// Sets the topic-level pause bit: owned partitions stay owned but are
    /// omitted from fetch requests. Already-buffered records are still
    /// returned by later polls.
    pub fn pause_fetch_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<String> = topics.into_iter().map(|t| t.as_ref().to_string()).collect();
        self.core
            .assignment
            .pause_topics(topics.iter().map(String::as_str));
    }

    pub fn resume_fetch_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<String> = topics.into_iter().map(|t| t.as_ref().to_string()).collect();
        self.core
            .assignment
            .resume_topics(topics.iter().map(String::as_str));
        self.core.sources.wake_all();
    }

    /// Sets partition-level pause bits; see [`Client::pause_fetch_topics`].
    pub fn pause_fetch_partitions(&self, map: HashMap<String, Vec<i32>>) {
        for (topic, partitions) in &map {
            self.core
                .assignment
                .pause_partitions(partitions.iter().map(|p| (topic.as_str(), *p)));
        }
    }

    pub fn resume_fetch_partitions(&self, map: HashMap<String, Vec<i32>>) {
        for (topic, partitions) in &map {
            self.core
                .assignment
                .resume_partitions(partitions.iter().map(|p| (topic.as_str(), *p)));
        }
        self.core.sources.wake_all();
    }

    /// Seeds or forces offsets. Currently assigned partitions re-seek to
    /// the given position immediately (dropping anything buffered for the
    /// old position); unknown partitions keep the seed until they become
    /// assigned. An epoch of `-1` means "no epoch known".
    pub fn set_offsets(&self, map: HashMap<String, HashMap<i32, EpochOffset>>) {
        if map.is_empty() {
            return;
        }
        let group_mode = self.core.group.is_some();
        self.core.subscription.seed_offsets(&map, group_mode);
        for (topic, partitions) in &map {
            for (partition, eo) in partitions {
                if let Some(gen) =
                    self.core
                        .assignment
                        .force_offset(topic, *partition, eo.offset, eo.epoch)
                {
                    self.core.buffers.ensure(topic, *partition, gen);
                    // the assigned row consumed its seed
                    let _ = self.core.subscription.take_seed(topic, *partition);
                }
            }
        }
        self.reconcile_now();
        self.core.sources.wake_all();
    }

    /// Strong purge: after this returns, no poll yields records or
    /// non-missing errors for the topics until they are re-added, and any
    /// in-flight fetch results for them are dropped. A later
    /// `add_consume_topics` is accepted as a fresh subscription.
    pub fn purge_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            let topic = topic.as_ref();
            info!(topic, "purging topic from client");
            subscription::purge_topic(&self.core, topic);
        }
        self.core.metadata.request_refresh();
    }

    /// Drains everything currently buffered, waiting up to `wait` for data
    /// if nothing is buffered (`None` waits until data or close). An
    /// elapsed wait returns a `Fetches` whose zero-th error slot is
    /// [`ClientError::PollWaitElapsed`].
    pub async fn poll_fetches(&self, wait: Option<Duration>) -> Fetches {
        self.poll(wait, None).await
    }

    /// Like [`Client::poll_fetches`] but drains at most `max` records,
    /// round-robin across partitions; `0` means unbounded.
    pub async fn poll_records(&self, wait: Option<Duration>, max: usize) -> Fetches {
        self.poll(wait, (max > 0).then_some(max)).await
    }

    async fn poll(&self, wait: Option<Duration>, max: Option<usize>) -> Fetches {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if self.core.is_closed() {
                return Fetches::from_err0(ClientError::ClientClosed);
            }
            if self.core.buffers.has_data() {
                let fetches = match max {
                    Some(max) => self.core.buffers.drain_records(max),
                    None => self.core.buffers.drain_all(),
                };
                if !fetches.is_empty() {
                    // draining cleared backpressure; let the sources refill
                    self.core.sources.wake_all();
                    return fetches;
                }
            }
            let wait_for_data = self.core.buffers.wait_data();
            match deadline {
                None => wait_for_data.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Fetches::from_err0(ClientError::PollWaitElapsed);
                    }
                    if tokio::time::timeout(deadline - now, wait_for_data)
                        .await
                        .is_err()
                    {
                        return Fetches::from_err0(ClientError::PollWaitElapsed);
                    }
                }
            }
        }
    }

    /// Consumption progress (position, watermarks, lag, pause state) for
    /// every assigned partition.
    pub fn progress(&self) -> Vec<crate::consumer::PartitionProgress> {
        self.core.assignment.progress()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Stops all background tasks and wakes outstanding polls, which (like
    /// all subsequent polls) return [`ClientError::ClientClosed`].
    pub async fn close(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing client");
        self.core.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    /// Applies an edit against current metadata right away (when a
    /// snapshot exists) and schedules a refresh for whatever it missed.
    fn reconcile_now(&self) {
        if let Some(snapshot) = self.core.metadata.snapshot() {
            subscription::reconcile(&self.core, &snapshot);
        }
        self.core.metadata.request_refresh();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.core.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
