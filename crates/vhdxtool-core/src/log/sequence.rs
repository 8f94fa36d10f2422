//! Runs of log entries and discovery of the active run.

use tracing::debug;
use uuid::Uuid;

use super::{LogEntry, LogRegion, LOG_SECTOR_SIZE};
use crate::error::Result;
use crate::store::BackingStore;

/// Entries with consecutive sequence numbers, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSequence {
    entries: Vec<LogEntry>,
}

impl LogSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest entry.
    pub fn head(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// Oldest entry.
    pub fn tail(&self) -> Option<&LogEntry> {
        self.entries.first()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogEntry> {
        self.entries.iter()
    }

    /// Appends `entry` if it directly follows the current head.
    pub fn push(&mut self, entry: LogEntry) -> bool {
        if let Some(head) = self.head() {
            if entry.sequence_number() != head.sequence_number().wrapping_add(1) {
                return false;
            }
        }
        self.entries.push(entry);
        true
    }

    /// True when some entry starts at log position `position`.
    pub fn contains(&self, position: u64) -> bool {
        self.entries.iter().any(|e| e.position() == position)
    }

    /// True when the head reaches back to the entry it names as its tail.
    pub fn is_complete(&self) -> bool {
        self.head().is_some_and(|head| self.contains(head.tail()))
    }

    /// True when this run's head is newer than `other`'s (or `other` is empty).
    pub fn higher_sequence_than(&self, other: &LogSequence) -> bool {
        match (self.head(), other.head()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(mine), Some(theirs)) => mine.sequence_number() > theirs.sequence_number(),
        }
    }
}

impl<'a> IntoIterator for &'a LogSequence {
    type Item = &'a LogEntry;
    type IntoIter = std::slice::Iter<'a, LogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Scans the circular log for the newest complete run of entries tagged `log_guid`.
///
/// Candidate runs start at sector boundaries not already covered by an
/// earlier run. The scan ends once the cursor wraps past its starting point.
/// An empty sequence means no complete run exists.
pub fn find_active_sequence<S: BackingStore + ?Sized>(
    store: &mut S,
    log: LogRegion,
    log_guid: Uuid,
) -> Result<LogSequence> {
    let mut best = LogSequence::new();
    if log.length < LOG_SECTOR_SIZE {
        return Ok(best);
    }

    let mut cursor = 0u64;
    loop {
        let start = cursor;
        let mut run = LogSequence::new();
        let mut position = start;

        while let Some(entry) = LogEntry::try_read(store, log, position)? {
            if entry.log_guid() != log_guid {
                break;
            }
            let next = position + entry.entry_length();
            if !run.push(entry) {
                break;
            }
            position = next;
        }

        cursor = match run.head() {
            Some(head) => head.position() + LOG_SECTOR_SIZE,
            None => cursor + LOG_SECTOR_SIZE,
        } % log.length;

        if run.is_complete() && run.higher_sequence_than(&best) {
            debug!(
                start,
                entries = run.len(),
                head_sequence = run.head().map(|h| h.sequence_number()),
                "found candidate log sequence"
            );
            best = run;
        }

        if cursor <= start {
            break;
        }
    }
    Ok(best)
}
