//! Branded ID newtypes.
//!
//! Studies are keyed by a caller-chosen name; sessions by an opaque
//! integer-string token allocated by their run. Both are stringly on the
//! wire but branded in the type system so they cannot be swapped.

use std::{cmp, fmt};

use serde::{Deserialize, Serialize};

/// Identifier of a study (its registered name).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyId(pub String);

impl StudyId {
    /// View as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StudyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Token identifying one participant session within a run.
///
/// Allocated monotonically per run, starting at `"1"`. Unique within the
/// run for the process lifetime; never reused after close.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub String);

impl PartialOrd for SessionToken {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Numeric order, so ordered collections iterate in allocation order.
///
/// Allocation produces decimal strings without leading zeros, for which
/// shorter-first then lexicographic equals numeric comparison.
impl Ord for SessionToken {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl SessionToken {
    /// View as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for SessionToken {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}
