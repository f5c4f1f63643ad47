//! Broker source lifecycle.
//!
//! One fetch task runs per broker that leads at least one assigned
//! partition. Sources are spawned lazily on first assignment, woken
//! through their mailboxes on any state change, and allowed to exit after
//! an idle grace window so leader churn does not thrash tasks. Finished
//! handles are pruned and respawned on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::ClientCore;
use crate::consumer::fetch;

/// Events delivered to a source's mailbox. The mailbox doubles as the
/// wake signal: the worker re-plans its fetch on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceEvent {
    Wake,
}

struct SourceHandle {
    tx: mpsc::UnboundedSender<SourceEvent>,
    task: JoinHandle<()>,
}

pub(crate) struct SourceManager {
    sources: Mutex<HashMap<i32, SourceHandle>>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a running source exists for every broker in `brokers` and
    /// wakes them all. Sources for brokers no longer in the set are left
    /// to drain and exit on their own grace timer.
    pub fn sync(&self, core: &Arc<ClientCore>, brokers: &HashSet<i32>) {
        if core.is_closed() {
            return;
        }
        let mut sources = self.sources.lock();
        sources.retain(|broker, handle| {
            if handle.task.is_finished() {
                debug!(broker = *broker, "pruning finished broker source");
                false
            } else {
                true
            }
        });
        for &broker in brokers {
            let handle = sources.entry(broker).or_insert_with(|| {
                debug!(broker, "spawning broker source");
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(fetch::run_fetch_loop(core.clone(), broker, rx));
                SourceHandle { tx, task }
            });
            let _ = handle.tx.send(SourceEvent::Wake);
        }
    }

    /// Wakes every running source.
    pub fn wake_all(&self) {
        let sources = self.sources.lock();
        for handle in sources.values() {
            let _ = handle.tx.send(SourceEvent::Wake);
        }
    }

    /// Drops all mailboxes and aborts the tasks (close path).
    pub fn shutdown(&self) {
        let mut sources = self.sources.lock();
        for (broker, handle) in sources.drain() {
            debug!(broker, "stopping broker source");
            handle.task.abort();
        }
    }
}
