#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # streamline-client
//!
//! A consumer client for the Kafka wire protocol: topic discovery, dynamic
//! subscriptions (including regex), per-broker fetch multiplexing, pause /
//! resume / purge semantics, and ordered in-partition delivery through a
//! polling interface.
//!
//! The wire itself stays behind the [`Transport`] trait, which marshals
//! typed `kafka-protocol` requests to brokers; consumer-group protocol
//! internals stay behind [`GroupCoordinator`]. Everything in between
//! (metadata caching, assignment, scheduling, buffering) is this crate.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use streamline_client::{Client, ClientConfig};
//! use std::time::Duration;
//!
//! let config = ClientConfig::default()
//!     .with_fetch_max_wait(Duration::from_millis(500));
//! let client = Client::new(config, transport);
//!
//! client.add_consume_topics(["events"])?;
//! loop {
//!     let fetches = client.poll_fetches(Some(Duration::from_secs(1))).await;
//!     fetches.each_record(|record| {
//!         println!("{}[{}] @ {}", record.topic, record.partition, record.offset);
//!     });
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Within a `(topic, partition)`, records are delivered in broker order
//!   with strictly increasing offsets; across partitions there is no
//!   ordering.
//! - At most one fetch is in flight per broker connection.
//! - Pause means "stop asking for more": paused partitions stay assigned
//!   and already-buffered records still deliver.
//! - After [`Client::purge_topics`] returns, no subsequent poll returns
//!   records for the purged topics until they are re-added, including
//!   records that were in flight at purge time.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
mod metadata;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use consumer::PartitionProgress;
pub use consumer::fetches::{FetchPartitionData, FetchTopic, Fetches, Header, Record};
pub use consumer::offset::{EpochOffset, Offset, OffsetSpec};
pub use error::{ClientError, KafkaCode, Result};
pub use group::{GroupAssignment, GroupCoordinator};
pub use transport::{BrokerEndpoint, Transport};
