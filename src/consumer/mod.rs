//! The consumer subsystem.
//!
//! Reconciles three asynchronous sources of change (subscription edits,
//! metadata updates, and in-flight fetch responses) while preserving
//! per-partition order, offset progress, and at-most-one in-flight fetch
//! per broker:
//!
//! - `subscription` turns user intent and regex matches into assignment
//!   deltas and owns purge semantics
//! - `assignment` is the authoritative partition table
//! - `source` + `fetch` run one scheduler per broker that leads assigned
//!   partitions
//! - `buffer` + `fetches` deliver ordered records to the poller

pub(crate) mod assignment;
pub(crate) mod buffer;
pub(crate) mod fetch;
pub mod fetches;
pub mod offset;
pub(crate) mod source;
pub(crate) mod subscription;

pub use assignment::PartitionProgress;
pub use fetches::{FetchPartitionData, FetchTopic, Fetches, Header, Record};
pub use offset::{EpochOffset, Offset, OffsetSpec};
