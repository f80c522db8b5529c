//! Per-partition consumer state.

use std::fmt;

/// Lifecycle of one assigned partition:
/// `Unassigned -> Fetching -> Delivering -> (Fetching | Committing)`, and
/// `Closed` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionState {
    Unassigned,
    /// Cursor is idle and may be fetched or repositioned.
    Fetching,
    /// Records from the last poll are with the caller.
    Delivering,
    Committing,
    Closed,
}

impl PartitionState {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionState::Unassigned => "unassigned",
            PartitionState::Fetching => "fetching",
            PartitionState::Delivering => "delivering",
            PartitionState::Committing => "committing",
            PartitionState::Closed => "closed",
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartitionCursor {
    pub state: PartitionState,
    /// Next offset to fetch.
    pub position: i64,
    /// Highest offset handed to the caller since assignment or the last seek.
    pub last_delivered: Option<i64>,
    /// Last offset known to be committed for the group.
    pub committed: Option<i64>,
}

impl PartitionCursor {
    pub fn new(position: i64, committed: Option<i64>) -> Self {
        Self {
            state: PartitionState::Fetching,
            position,
            last_delivered: None,
            committed,
        }
    }

    /// Advance past `offset`. Returns false for offsets already behind the
    /// cursor, which must not be delivered again.
    pub fn advance(&mut self, offset: i64) -> bool {
        if offset < self.position {
            return false;
        }
        self.position = offset + 1;
        self.last_delivered = Some(offset);
        true
    }
}
