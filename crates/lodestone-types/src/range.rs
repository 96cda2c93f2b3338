//! Half-open key ranges over the raw byte keyspace.

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// End of the user keyspace. Keys at or above this byte prefix are system
/// metadata.
pub const USER_KEYSPACE_END: &[u8] = b"\xff";

/// End of the whole keyspace, exclusive bound of the system-metadata range.
pub const KEYSPACE_END: &[u8] = b"\xff\xff";

/// A contiguous half-open key range `[begin, end)`.
///
/// Ranges with `begin >= end` are empty. The shard map partitions the user
/// keyspace into non-overlapping, non-empty ranges.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct KeyRange {
    pub begin: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The full user keyspace `["", \xff)`.
    pub fn all_user_keys() -> Self {
        Self::new(Bytes::new(), Bytes::from_static(USER_KEYSPACE_END))
    }

    /// The system-metadata keyspace `[\xff, \xff\xff)`.
    pub fn system_keys() -> Self {
        Self::new(
            Bytes::from_static(USER_KEYSPACE_END),
            Bytes::from_static(KEYSPACE_END),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.begin.as_ref() <= key && key < self.end.as_ref()
    }

    /// True if `other` lies entirely within this range. Empty ranges are
    /// contained by everything.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty() || (self.begin <= other.begin && other.end <= self.end)
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.begin < other.end && other.begin < self.end
    }

    /// The overlap of two ranges, empty when they are disjoint.
    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        let begin = self.begin.clone().max(other.begin.clone());
        let end = self.end.clone().min(other.end.clone());
        KeyRange { begin, end }
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_key(f: &mut fmt::Formatter<'_>, key: &[u8]) -> fmt::Result {
            for b in key {
                if b.is_ascii_graphic() {
                    write!(f, "{}", *b as char)?;
                } else {
                    write!(f, "\\x{b:02x}")?;
                }
            }
            Ok(())
        }
        write!(f, "[")?;
        fmt_key(f, &self.begin)?;
        write!(f, ", ")?;
        fmt_key(f, &self.end)?;
        write!(f, ")")
    }
}
