//! Kafka protocol error codes as seen by a consumer.

use std::fmt;

/// Kafka protocol error codes relevant to the consumer path.
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KafkaCode {
    /// Unknown server error
    UnknownServerError = -1,
    /// The requested offset is outside the range retained by the log
    OffsetOutOfRange = 1,
    /// Message failed its CRC check or is otherwise corrupt
    CorruptMessage = 2,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// A leader election is in progress for the partition
    LeaderNotAvailable = 5,
    /// The receiving broker is not the leader for the partition
    NotLeaderOrFollower = 6,
    /// Request timed out broker-side
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Replica not available
    ReplicaNotAvailable = 9,
    /// Broker-side network exception
    NetworkException = 13,
    /// Coordinator is loading group state
    CoordinatorLoadInProgress = 14,
    /// Coordinator not available
    CoordinatorNotAvailable = 15,
    /// Not the coordinator for the group
    NotCoordinator = 16,
    /// Invalid topic name
    InvalidTopicException = 17,
    /// Generation mismatch within the group
    IllegalGeneration = 22,
    /// Unknown group member
    UnknownMemberId = 25,
    /// Group rebalance in progress
    RebalanceInProgress = 27,
    /// Not authorized to read the topic
    TopicAuthorizationFailed = 29,
    /// Not authorized to use the group
    GroupAuthorizationFailed = 30,
    /// Not authorized against the cluster
    ClusterAuthorizationFailed = 31,
    /// Broker does not support the request version
    UnsupportedVersion = 35,
    /// Broker-side storage failure
    KafkaStorageError = 56,
    /// Fetch session was evicted broker-side
    FetchSessionIdNotFound = 70,
    /// Fetch session epoch does not match the broker's
    InvalidFetchSessionEpoch = 71,
    /// Requested epoch is older than the broker's
    FencedLeaderEpoch = 74,
    /// Requested epoch is newer than the broker's
    UnknownLeaderEpoch = 75,
    /// Compression type not supported
    UnsupportedCompressionType = 76,
    /// Offset exists but is not yet available (follower lag)
    OffsetNotAvailable = 78,
    /// Leader is being elected preferentially elsewhere
    PreferredLeaderNotAvailable = 80,
    /// Record failed broker-side validation
    InvalidRecord = 87,
    /// Client quota exceeded
    ThrottlingQuotaExceeded = 89,
    /// Topic id is not known to the broker
    UnknownTopicId = 100,
    /// Topic id in the fetch session does not match the broker's
    InconsistentTopicId = 103,
}

impl KafkaCode {
    /// Maps a wire error code to a known code. `0` (no error) maps to
    /// `None`; codes the consumer never sees map to `UnknownServerError`.
    pub fn from_code(code: i16) -> Option<KafkaCode> {
        use KafkaCode::*;
        let known = match code {
            0 => return None,
            -1 => UnknownServerError,
            1 => OffsetOutOfRange,
            2 => CorruptMessage,
            3 => UnknownTopicOrPartition,
            5 => LeaderNotAvailable,
            6 => NotLeaderOrFollower,
            7 => RequestTimedOut,
            8 => BrokerNotAvailable,
            9 => ReplicaNotAvailable,
            13 => NetworkException,
            14 => CoordinatorLoadInProgress,
            15 => CoordinatorNotAvailable,
            16 => NotCoordinator,
            17 => InvalidTopicException,
            22 => IllegalGeneration,
            25 => UnknownMemberId,
            27 => RebalanceInProgress,
            29 => TopicAuthorizationFailed,
            30 => GroupAuthorizationFailed,
            31 => ClusterAuthorizationFailed,
            35 => UnsupportedVersion,
            56 => KafkaStorageError,
            70 => FetchSessionIdNotFound,
            71 => InvalidFetchSessionEpoch,
            74 => FencedLeaderEpoch,
            75 => UnknownLeaderEpoch,
            76 => UnsupportedCompressionType,
            78 => OffsetNotAvailable,
            80 => PreferredLeaderNotAvailable,
            87 => InvalidRecord,
            89 => ThrottlingQuotaExceeded,
            100 => UnknownTopicId,
            103 => InconsistentTopicId,
            _ => UnknownServerError,
        };
        Some(known)
    }

    /// The i16 error code used on the wire.
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    /// True if the client should retry the operation after refreshing
    /// metadata, without surfacing the error by default.
    pub fn is_retriable(&self) -> bool {
        use KafkaCode::*;
        matches!(
            self,
            CorruptMessage
                | UnknownTopicOrPartition
                | LeaderNotAvailable
                | NotLeaderOrFollower
                | RequestTimedOut
                | BrokerNotAvailable
                | ReplicaNotAvailable
                | NetworkException
                | CoordinatorLoadInProgress
                | CoordinatorNotAvailable
                | NotCoordinator
                | KafkaStorageError
                | FetchSessionIdNotFound
                | InvalidFetchSessionEpoch
                | FencedLeaderEpoch
                | UnknownLeaderEpoch
                | OffsetNotAvailable
                | PreferredLeaderNotAvailable
                | ThrottlingQuotaExceeded
                | UnknownTopicId
                | InconsistentTopicId
        )
    }

    /// True for the two codes that mean "this broker does not know the
    /// topic"; these feed the missing-topic machinery rather than sticking
    /// to the partition.
    pub fn is_unknown_topic(&self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition | KafkaCode::UnknownTopicId
        )
    }

    /// True for leader-epoch disagreements, which are fixed by adopting the
    /// epoch from fresh metadata.
    pub fn is_epoch_related(&self) -> bool {
        matches!(
            self,
            KafkaCode::FencedLeaderEpoch | KafkaCode::UnknownLeaderEpoch
        )
    }

    /// True when the broker-side fetch session must be re-established.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            KafkaCode::FetchSessionIdNotFound | KafkaCode::InvalidFetchSessionEpoch
        )
    }

    /// True for errors that stick to the partition until it is re-seeked or
    /// reassigned (authorization and friends).
    pub fn is_authoritative(&self) -> bool {
        use KafkaCode::*;
        matches!(
            self,
            TopicAuthorizationFailed
                | GroupAuthorizationFailed
                | ClusterAuthorizationFailed
                | InvalidTopicException
                | UnsupportedVersion
                | UnsupportedCompressionType
        )
    }
}

impl fmt::Display for KafkaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self, self.as_i16())
    }
}
