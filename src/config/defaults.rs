//! Default constants for client configuration.

use std::time::Duration;

/// How many consecutive successful metadata loads may miss a subscribed
/// topic before the client stops waiting for it; `-1` waits forever.
pub const DEFAULT_UNKNOWN_TOPIC_RETRIES: i32 = -1;

/// Floor between metadata refreshes; concurrent triggers are debounced to
/// this cadence.
pub const DEFAULT_METADATA_MIN_AGE: Duration = Duration::from_secs(5);

/// Ceiling after which metadata is refreshed even without a trigger.
pub const DEFAULT_METADATA_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// How long a subscribed topic may be absent from successful metadata
/// before it is treated as deleted and purged internally.
pub const DEFAULT_MISSING_TOPIC_DELETE_TIMEOUT: Duration = Duration::from_secs(15);

/// Broker-side long-poll ceiling and scheduler wake ceiling.
pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(5);

/// Minimum bytes a broker should accumulate before answering a fetch.
pub const DEFAULT_FETCH_MIN_BYTES: i32 = 1;

/// Maximum bytes per fetch response.
pub const DEFAULT_FETCH_MAX_BYTES: i32 = 50 * 1024 * 1024;

/// Maximum bytes per partition per fetch response.
pub const DEFAULT_FETCH_MAX_PARTITION_BYTES: i32 = 1024 * 1024;

/// Soft limit on bytes buffered client-side per partition; a partition over
/// the limit is excluded from fetch requests until a poll drains it.
pub const DEFAULT_BUFFERED_PARTITION_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Base backoff between retries of failed broker requests.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);
