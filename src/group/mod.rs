//! Group-mode assignment seam.
//!
//! Consumer-group protocol internals (join/sync, heartbeats, rebalance
//! strategies) live behind [`GroupCoordinator`]: a component that, given
//! the configured group, yields a stream of assignment changes and answers
//! committed-offset lookups. The loop here applies those changes to the
//! assignment set. Offsets for a newly assigned partition resolve in
//! order: a user seed from `set_offsets`, then the group's committed
//! offset, then the configured reset.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::ClientCore;
use crate::consumer::assignment::OffsetState;
use crate::consumer::offset::EpochOffset;

/// One assignment from the group: the full set of partitions this member
/// now owns.
#[derive(Debug, Clone, Default)]
pub struct GroupAssignment {
    pub partitions: HashMap<String, Vec<i32>>,
}

/// The consumer-group protocol component.
#[async_trait]
pub trait GroupCoordinator: Send + Sync + 'static {
    /// Blocks until the group hands this member a new assignment; `None`
    /// ends the group session.
    async fn next_assignment(&self) -> Option<GroupAssignment>;

    /// The committed offset for a partition at assignment time, if any.
    async fn committed_offset(&self, topic: &str, partition: i32) -> Option<EpochOffset>;
}

/// Applies group assignment changes to the assignment set.
pub(crate) async fn run_group_loop(core: Arc<ClientCore>) {
    let Some(group) = core.group.clone() else {
        return;
    };
    debug!("group loop starting");
    let mut held: HashSet<(String, i32)> = HashSet::new();
    loop {
        let assignment = tokio::select! {
            assignment = group.next_assignment() => assignment,
            _ = core.close_signal().notified() => break,
        };
        let Some(assignment) = assignment else {
            break;
        };
        if core.is_closed() {
            break;
        }

        let mut wanted: HashSet<(String, i32)> = HashSet::new();
        for (topic, partitions) in &assignment.partitions {
            for partition in partitions {
                wanted.insert((topic.clone(), *partition));
            }
        }
        info!(partitions = wanted.len(), "applying group assignment");

        for (topic, partition) in &wanted {
            if held.contains(&(topic.clone(), *partition)) {
                continue;
            }
            let initial = match core.subscription.take_seed(topic, *partition) {
                Some(seed) => OffsetState::Resolved {
                    offset: seed.offset,
                    epoch: seed.epoch,
                },
                None => match group.committed_offset(topic, *partition).await {
                    Some(committed) => OffsetState::Resolved {
                        offset: committed.offset,
                        epoch: committed.epoch,
                    },
                    None => OffsetState::Pending(core.config.auto_offset_reset),
                },
            };
            if let Some(gen) = core.assignment.assign(topic, *partition, initial) {
                core.buffers.ensure(topic, *partition, gen);
            }
        }

        for (topic, partition) in held.difference(&wanted) {
            debug!(topic = %topic, partition = *partition, "group revoked partition");
            let _ = core.assignment.unassign(topic, *partition);
            core.buffers.remove(topic, *partition);
        }

        held = wanted;
        core.metadata.request_refresh();
        core.sources.wake_all();
    }
    debug!("group loop exited");
}
