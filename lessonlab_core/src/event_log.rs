//! Bounded, chronological event log.
//!
//! The log is purely observational: the engine writes every organic
//! transition message, every injected fault and every contract violation
//! here, and the presentation layer reads it back. Nothing ever reads the
//! log to decide module behavior.

use lessonlab_env::{EntrySource, LogEntry, Severity, Tick};
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of lines kept.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Fixed-capacity ring of log entries; the oldest entry is evicted first.
#[derive(Debug, Clone, Serialize)]
pub struct EventLog {
    /// Retained entries, oldest first
    entries: VecDeque<LogEntry>,

    /// Maximum number of retained entries (always >= 1)
    capacity: usize,

    /// Entries evicted since the last clear
    evicted: u64,
}

impl EventLog {
    /// Creates an empty log. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Appends an entry, evicting the oldest one when full.
    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    /// Appends every entry in order.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Convenience for engine-authored lines.
    pub fn record(&mut self, tick: Tick, severity: Severity, message: impl Into<String>) {
        self.push(LogEntry::new(tick, severity, EntrySource::Engine, message));
    }

    /// Removes every entry and resets the eviction counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }

    /// Iterates oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Returns a copy of the retained entries, oldest first.
    pub fn to_vec(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Returns the most recent entry.
    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries dropped to make room since the last clear.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Total entries pushed since the last clear, evicted ones included.
    pub fn written(&self) -> u64 {
        self.evicted + self.entries.len() as u64
    }

    /// Entries pushed after the log had `mark` written entries, as far as
    /// they are still retained.
    pub fn since(&self, mark: u64) -> Vec<LogEntry> {
        let fresh = self.written().saturating_sub(mark).min(self.entries.len() as u64) as usize;
        self.entries.iter().skip(self.entries.len() - fresh).cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(tick: Tick) -> LogEntry {
        LogEntry::new(tick, Severity::Info, EntrySource::Transition, format!("line {}", tick))
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut log = EventLog::new(3);
        for t in 0..5 {
            log.push(entry(t));
        }

        let ticks: Vec<Tick> = log.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![2, 3, 4]);
        assert_eq!(log.evicted(), 2);
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut log = EventLog::new(2);
        log.extend((0..4).map(entry));
        log.clear();

        assert!(log.is_empty());
        assert_eq!(log.evicted(), 0);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut log = EventLog::new(0);
        log.push(entry(0));
        log.push(entry(1));

        assert_eq!(log.capacity(), 1);
        assert_eq!(log.last().map(|e| e.tick), Some(1));
    }

    #[test]
    fn test_since_mark() {
        let mut log = EventLog::new(4);
        log.extend((0..3).map(entry));
        let mark = log.written();
        log.extend((3..6).map(entry));

        let fresh: Vec<Tick> = log.since(mark).iter().map(|e| e.tick).collect();
        assert_eq!(fresh, vec![3, 4, 5]);
        assert!(log.since(log.written()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_length_bounded_and_order_preserved(capacity in 1usize..32, total in 0u64..200) {
            let mut log = EventLog::new(capacity);
            for t in 0..total {
                log.push(entry(t));
            }

            prop_assert!(log.len() <= capacity);
            prop_assert_eq!(log.len() as u64, total.min(capacity as u64));

            let expected_first = total.saturating_sub(capacity as u64);
            let ticks: Vec<Tick> = log.iter().map(|e| e.tick).collect();
            let expected: Vec<Tick> = (expected_first..total).collect();
            prop_assert_eq!(ticks, expected);
        }
    }
}
