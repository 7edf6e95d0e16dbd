//! Bounded ring buffer of sequenced session output.
//!
//! [`OutputBuffer`] keeps the most recent output of a session so a late or
//! reconnecting observer can catch up. When the buffer is full the oldest
//! entry is evicted; this is the retention policy, not a delivery guarantee.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Which output stream produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A single sequenced output entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    /// Monotonically increasing sequence number (unique within a session).
    pub seq: u64,
    pub stream: OutputStream,
    pub data: String,
    /// Unix timestamp in milliseconds when the entry was created.
    pub timestamp_ms: u64,
}

pub struct OutputBuffer {
    entries: VecDeque<OutputEntry>,
    next_seq: u64,
    max_entries: usize,
}

impl OutputBuffer {
    /// Create a new buffer that holds at most `max_entries` items.
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries,
        }
    }

    /// Append an entry, evicting the oldest if full. Returns the stored entry.
    pub fn push(&mut self, stream: OutputStream, data: String) -> OutputEntry {
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }

        let entry = OutputEntry {
            seq,
            stream,
            data,
            timestamp_ms: crate::util::now_ms(),
        };
        self.entries.push_back(entry.clone());
        entry
    }

    /// Read all entries with `seq > since`.
    ///
    /// Returns `(entries, dropped_count)` where `dropped_count > 0` if entries
    /// between `since` and the oldest available entry were evicted.
    pub fn read_since(&self, since: u64) -> (Vec<OutputEntry>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = oldest_available.saturating_sub(since.saturating_add(1));

        let entries = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();

        (entries, dropped)
    }

    /// Sequence number the next pushed entry will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_when_full() {
        let mut buf = OutputBuffer::new(3);
        for i in 0..5 {
            buf.push(OutputStream::Stdout, format!("line {i}"));
        }
        assert_eq!(buf.len(), 3);
        let (entries, dropped) = buf.read_since(0);
        assert_eq!(dropped, 2);
        assert_eq!(entries.first().map(|e| e.seq), Some(3));
        assert_eq!(entries.last().map(|e| e.data.as_str()), Some("line 4"));
    }

    #[test]
    fn read_since_returns_only_newer_entries() {
        let mut buf = OutputBuffer::new(10);
        buf.push(OutputStream::Stdout, "a".into());
        let b = buf.push(OutputStream::Stderr, "b".into());
        buf.push(OutputStream::Stdout, "c".into());

        let (entries, dropped) = buf.read_since(b.seq - 1);
        assert_eq!(dropped, 0);
        let data: Vec<_> = entries.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, ["b", "c"]);
        assert_eq!(entries[0].stream, OutputStream::Stderr);
    }

    #[test]
    fn caught_up_reader_sees_nothing_dropped() {
        let mut buf = OutputBuffer::new(2);
        for _ in 0..4 {
            buf.push(OutputStream::Stdout, "x".into());
        }
        let (entries, dropped) = buf.read_since(4);
        assert!(entries.is_empty());
        assert_eq!(dropped, 0);
        assert_eq!(buf.next_seq(), 5);
    }
}
