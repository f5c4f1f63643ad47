//! Offset specifications for starting or re-seeking consumption.

/// Where consumption of a partition should begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// Start at the log start offset.
    Earliest,
    /// Start at the log end offset (only records produced after assignment).
    Latest,
    /// Start at an exact offset.
    At(i64),
    /// Start at the first offset with a timestamp at or after the given
    /// millisecond timestamp.
    AfterMillis(i64),
}

/// An offset spec paired with an optional leader epoch.
///
/// The epoch rides along on fetch requests so brokers can fence stale
/// consumers; `-1` means "no epoch known, do not send one".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    spec: OffsetSpec,
    epoch: i32,
}

impl Offset {
    /// A new offset spec starting at the log start offset with no epoch.
    pub fn new() -> Offset {
        Offset {
            spec: OffsetSpec::Earliest,
            epoch: -1,
        }
    }

    /// Consume from the log start offset.
    pub fn earliest(mut self) -> Offset {
        self.spec = OffsetSpec::Earliest;
        self
    }

    /// Consume only records produced after the partition is assigned.
    pub fn latest(mut self) -> Offset {
        self.spec = OffsetSpec::Latest;
        self
    }

    /// Consume from an exact offset.
    pub fn at(mut self, offset: i64) -> Offset {
        self.spec = OffsetSpec::At(offset);
        self
    }

    /// Consume from the first offset with a timestamp at or after `millis`.
    pub fn after_millis(mut self, millis: i64) -> Offset {
        self.spec = OffsetSpec::AfterMillis(millis);
        self
    }

    /// Attach a leader epoch; `-1` clears it.
    pub fn with_epoch(mut self, epoch: i32) -> Offset {
        self.epoch = epoch;
        self
    }

    pub fn spec(&self) -> OffsetSpec {
        self.spec
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }
}

impl Default for Offset {
    fn default() -> Offset {
        Offset::new()
    }
}

impl From<OffsetSpec> for Offset {
    fn from(spec: OffsetSpec) -> Offset {
        Offset { spec, epoch: -1 }
    }
}

/// A concrete offset with its leader epoch, as used by `set_offsets` and by
/// committed-offset lookups. `epoch: -1` means "no epoch known".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOffset {
    pub epoch: i32,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_builder() {
        let o = Offset::new();
        assert_eq!(o.spec(), OffsetSpec::Earliest);
        assert_eq!(o.epoch(), -1);

        let o = Offset::new().at(42).with_epoch(3);
        assert_eq!(o.spec(), OffsetSpec::At(42));
        assert_eq!(o.epoch(), 3);

        let o = Offset::new().latest();
        assert_eq!(o.spec(), OffsetSpec::Latest);
    }

    #[test]
    fn test_from_spec() {
        let o = Offset::from(OffsetSpec::AfterMillis(1_700_000_000_000));
        assert_eq!(o.spec(), OffsetSpec::AfterMillis(1_700_000_000_000));
        assert_eq!(o.epoch(), -1);
    }
}
