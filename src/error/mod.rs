//! Error types for the client.
//!
//! `ClientError` is the single error surface; per-partition Kafka errors
//! carry a [`KafkaCode`] so callers can classify what the broker said.

use thiserror::Error;

mod kafka_code;

pub use kafka_code::KafkaCode;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Main error type for the client.
///
/// The type is `Clone` because fetch errors are buffered per partition and
/// handed out on every poll that observes them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The transport failed to reach a broker or the connection died
    /// mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker answered with something the client could not interpret
    /// (undecodable record batch, malformed response).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A Kafka error code attached to a specific partition. The partition
    /// is `-1` for topic-level errors (e.g. an unknown topic that has no
    /// partitions to pin the error to).
    #[error("{code} for {topic}[{partition}]")]
    Partition {
        topic: String,
        partition: i32,
        code: KafkaCode,
    },

    /// A Kafka error code not attached to any partition (metadata-level).
    #[error("{0}")]
    Kafka(KafkaCode),

    /// The poll wait elapsed before any data was buffered. Surfaced only in
    /// the zero-th error slot of `Fetches`, never per partition.
    #[error("poll wait elapsed before any data arrived")]
    PollWaitElapsed,

    /// The client was closed; all outstanding and subsequent polls fail
    /// with this.
    #[error("client closed")]
    ClientClosed,

    /// A user-supplied argument was invalid (bad regex, missing group).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    pub(crate) fn protocol(err: impl std::fmt::Display) -> Self {
        ClientError::Protocol(err.to_string())
    }

    /// The Kafka error code carried by this error, if any.
    pub fn kafka_code(&self) -> Option<KafkaCode> {
        match self {
            ClientError::Partition { code, .. } | ClientError::Kafka(code) => Some(*code),
            _ => None,
        }
    }

    /// True if this is an unknown-topic error (either wire code).
    pub fn is_unknown_topic(&self) -> bool {
        self.kafka_code().is_some_and(|c| c.is_unknown_topic())
    }
}
