//! Client configuration.
//!
//! `ClientConfig` is built programmatically: construct with `Default` and
//! refine with the `with_*` methods.
//!
//! ```
//! use streamline_client::{ClientConfig, OffsetSpec};
//! use std::time::Duration;
//!
//! let config = ClientConfig::default()
//!     .with_fetch_max_wait(Duration::from_millis(100))
//!     .with_consume_regex(true)
//!     .with_auto_offset_reset(OffsetSpec::Earliest);
//! ```

mod defaults;

pub use defaults::*;

use std::time::Duration;

use crate::consumer::offset::OffsetSpec;

/// Complete configuration for a [`Client`](crate::Client).
///
/// Fields are public for inspection; prefer the builder methods for
/// construction so defaults stay in one place.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client id reported to brokers in requests.
    pub client_id: Option<String>,

    /// How many consecutive successful metadata loads may miss a subscribed
    /// topic before the client gives up on it early; `-1` means the topic
    /// is kept until the missing-topic delete timeout fires.
    pub unknown_topic_retries: i32,

    /// Floor between metadata refreshes.
    pub metadata_min_age: Duration,

    /// Ceiling after which metadata is refreshed without a trigger.
    pub metadata_max_age: Duration,

    /// How long a subscribed topic may be missing from successful metadata
    /// before it is treated as deleted.
    pub missing_topic_delete_timeout: Duration,

    /// Broker-side long-poll ceiling; also bounds how long a fetch
    /// scheduler turn waits for a wake before re-planning.
    pub fetch_max_wait: Duration,

    /// Minimum bytes a broker should accumulate before answering.
    pub fetch_min_bytes: i32,

    /// Maximum bytes per fetch response.
    pub fetch_max_bytes: i32,

    /// Maximum bytes per partition per fetch response.
    pub fetch_max_partition_bytes: i32,

    /// Soft limit on client-side buffered bytes per partition
    /// (backpressure).
    pub buffered_partition_max_bytes: usize,

    /// Surface retryable per-partition fetch errors to the caller instead
    /// of consuming them internally.
    pub keep_retryable_fetch_errors: bool,

    /// Treat topics passed to `add_consume_topics` as regex patterns
    /// matched against the broker's topic universe.
    pub consume_regex: bool,

    /// Consumer group name; group mode also requires a
    /// [`GroupCoordinator`](crate::group::GroupCoordinator).
    pub consumer_group: Option<String>,

    /// Where consumption starts for partitions assigned without an explicit
    /// or committed offset.
    pub auto_offset_reset: OffsetSpec,

    /// Base backoff between retries of failed broker requests; jittered.
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            unknown_topic_retries: DEFAULT_UNKNOWN_TOPIC_RETRIES,
            metadata_min_age: DEFAULT_METADATA_MIN_AGE,
            metadata_max_age: DEFAULT_METADATA_MAX_AGE,
            missing_topic_delete_timeout: DEFAULT_MISSING_TOPIC_DELETE_TIMEOUT,
            fetch_max_wait: DEFAULT_FETCH_MAX_WAIT,
            fetch_min_bytes: DEFAULT_FETCH_MIN_BYTES,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            fetch_max_partition_bytes: DEFAULT_FETCH_MAX_PARTITION_BYTES,
            buffered_partition_max_bytes: DEFAULT_BUFFERED_PARTITION_MAX_BYTES,
            keep_retryable_fetch_errors: false,
            consume_regex: false,
            consumer_group: None,
            auto_offset_reset: OffsetSpec::Earliest,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl ClientConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_unknown_topic_retries(mut self, retries: i32) -> Self {
        self.unknown_topic_retries = retries;
        self
    }

    pub fn with_metadata_min_age(mut self, age: Duration) -> Self {
        self.metadata_min_age = age;
        self
    }

    pub fn with_metadata_max_age(mut self, age: Duration) -> Self {
        self.metadata_max_age = age;
        self
    }

    pub fn with_missing_topic_delete_timeout(mut self, timeout: Duration) -> Self {
        self.missing_topic_delete_timeout = timeout;
        self
    }

    pub fn with_fetch_max_wait(mut self, wait: Duration) -> Self {
        self.fetch_max_wait = wait;
        self
    }

    pub fn with_fetch_min_bytes(mut self, bytes: i32) -> Self {
        self.fetch_min_bytes = bytes;
        self
    }

    pub fn with_fetch_max_bytes(mut self, bytes: i32) -> Self {
        self.fetch_max_bytes = bytes;
        self
    }

    pub fn with_fetch_max_partition_bytes(mut self, bytes: i32) -> Self {
        self.fetch_max_partition_bytes = bytes;
        self
    }

    pub fn with_buffered_partition_max_bytes(mut self, bytes: usize) -> Self {
        self.buffered_partition_max_bytes = bytes;
        self
    }

    pub fn with_keep_retryable_fetch_errors(mut self, keep: bool) -> Self {
        self.keep_retryable_fetch_errors = keep;
        self
    }

    pub fn with_consume_regex(mut self, regex: bool) -> Self {
        self.consume_regex = regex;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_auto_offset_reset(mut self, reset: OffsetSpec) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.unknown_topic_retries, -1);
        assert_eq!(config.metadata_min_age, Duration::from_secs(5));
        assert_eq!(config.fetch_max_wait, Duration::from_secs(5));
        assert_eq!(config.auto_offset_reset, OffsetSpec::Earliest);
        assert!(!config.keep_retryable_fetch_errors);
        assert!(!config.consume_regex);
        assert!(config.consumer_group.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = ClientConfig::default()
            .with_client_id("tester")
            .with_fetch_max_wait(Duration::from_millis(100))
            .with_keep_retryable_fetch_errors(true)
            .with_consumer_group("g1");
        assert_eq!(config.client_id.as_deref(), Some("tester"));
        assert_eq!(config.fetch_max_wait, Duration::from_millis(100));
        assert!(config.keep_retryable_fetch_errors);
        assert_eq!(config.consumer_group.as_deref(), Some("g1"));
    }
}
