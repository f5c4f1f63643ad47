//! The caller-facing view of one poll.
//!
//! A poll drains buffered batches into a [`Fetches`] snapshot: records
//! grouped by `(topic, partition)` in broker order, per-partition errors,
//! and the zero-th error slot for poll-level conditions (wait elapsed,
//! client closed).

use bytes::Bytes;

use crate::error::ClientError;

/// A single consumed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Leader epoch of the batch the record came from; `-1` if unknown.
    pub leader_epoch: i32,
    /// Broker timestamp in milliseconds.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
}

/// A record header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub key: String,
    pub value: Option<Bytes>,
}

/// Records and/or an error for one partition in a poll.
#[derive(Debug, Clone, Default)]
pub struct FetchPartitionData {
    pub partition: i32,
    pub records: Vec<Record>,
    pub error: Option<ClientError>,
    /// High watermark observed with the data; `-1` if unknown.
    pub high_watermark: i64,
}

/// All partitions of one topic in a poll.
#[derive(Debug, Clone, Default)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartitionData>,
}

/// Everything one poll returned.
#[derive(Debug, Clone, Default)]
pub struct Fetches {
    topics: Vec<FetchTopic>,
    err0: Option<ClientError>,
}

impl Fetches {
    pub(crate) fn new(topics: Vec<FetchTopic>) -> Fetches {
        Fetches { topics, err0: None }
    }

    pub(crate) fn from_err0(err: ClientError) -> Fetches {
        Fetches {
            topics: Vec::new(),
            err0: Some(err),
        }
    }

    /// The poll-level error slot. `PollWaitElapsed` here means "no data
    /// yet", distinct from any per-partition error.
    pub fn err0(&self) -> Option<&ClientError> {
        self.err0.as_ref()
    }

    /// True when the poll carried no records and no errors at all.
    pub fn is_empty(&self) -> bool {
        self.err0.is_none()
            && self
                .topics
                .iter()
                .all(|t| t.partitions.iter().all(|p| p.records.is_empty() && p.error.is_none()))
    }

    pub fn num_records(&self) -> usize {
        self.topics
            .iter()
            .map(|t| t.partitions.iter().map(|p| p.records.len()).sum::<usize>())
            .sum()
    }

    /// All records in this poll, in per-partition order.
    pub fn records(&self) -> Vec<&Record> {
        let mut out = Vec::with_capacity(self.num_records());
        for topic in &self.topics {
            for partition in &topic.partitions {
                out.extend(partition.records.iter());
            }
        }
        out
    }

    /// Consumes the snapshot into owned records.
    pub fn into_records(self) -> Vec<Record> {
        let mut out = Vec::new();
        for topic in self.topics {
            for partition in topic.partitions {
                out.extend(partition.records);
            }
        }
        out
    }

    pub fn each_record(&self, mut f: impl FnMut(&Record)) {
        for topic in &self.topics {
            for partition in &topic.partitions {
                for record in &partition.records {
                    f(record);
                }
            }
        }
    }

    pub fn each_topic(&self, mut f: impl FnMut(&FetchTopic)) {
        for topic in &self.topics {
            f(topic);
        }
    }

    /// Visits every per-partition error as `(topic, partition, error)`;
    /// topic-level errors use partition `-1`.
    pub fn each_error(&self, mut f: impl FnMut(&str, i32, &ClientError)) {
        for topic in &self.topics {
            for partition in &topic.partitions {
                if let Some(err) = &partition.error {
                    f(&topic.topic, partition.partition, err);
                }
            }
        }
    }

    pub fn topics(&self) -> &[FetchTopic] {
        &self.topics
    }
}
