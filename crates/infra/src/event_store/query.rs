//! Cursor types for paging through the global stream.

use eventlog_events::DomainEvent;

use crate::stream_store::{EntryId, RangeStart};

/// Position in the global stream from which a catch-up read resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GlobalPosition {
    /// Before the first entry.
    #[default]
    Start,
    /// Immediately after the given entry (exclusive).
    After(EntryId),
}

impl GlobalPosition {
    pub(crate) fn to_range_start(&self) -> RangeStart {
        match self {
            GlobalPosition::Start => RangeStart::First,
            GlobalPosition::After(id) => RangeStart::After(id.clone()),
        }
    }
}

/// One page of a global catch-up read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsPage {
    /// Events in global commit order.
    pub events: Vec<DomainEvent>,
    /// Pass back to continue after the last entry this page consumed.
    ///
    /// Skipped entries (bootstrap sentinels, malformed records) still advance it.
    pub next_position: GlobalPosition,
    /// `true` when the read ran off the end of the stream.
    pub reached_end: bool,
}
